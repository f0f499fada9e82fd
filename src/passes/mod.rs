//! Module passes and the registry that resolves pass names.
//!
//! Every entry of a pipeline step list is a pass name. [`PassRegistry`]
//! turns a name into a boxed [`Pass`] configured for one device; the
//! pipeline runs them in order over a kernel module, sharing a
//! [`PassContext`] that carries options, cached analyses and remarks.
//!
//! Passes fall into a few families:
//! - `inline`: inlining discipline (kernels, flattening, always-inline).
//! - `cleanup`: the scalar optimizations that make up the standard set.
//! - `workitem`: work-item builtin rewrites and handler selection.
//! - `barriers`: barrier normalization ahead of region formation.
//! - `wiloops`: work-item loops, sub-CFG formation and replication.
//! - `workgroup`: the work-group launcher.
//! - `vectorize`, `analysis`, `vortex`.

mod analysis;
mod barriers;
mod cleanup;
mod inline;
mod vectorize;
mod vortex;
mod wiloops;
mod workgroup;
mod workitem;

#[cfg(test)]
mod tests;

use crate::config::CompilerOptions;
use crate::device::DeviceDescriptor;
use crate::ir::{Function, Module};
use crate::launch::LaunchMetadata;
use crate::target::TargetInfo;

pub use analysis::{AnalysisCache, AnalysisKind, PointerClass, Uniformity, WorkItemAccess};
pub use inline::inline_call;

/// A transform or analysis over a whole module.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run over `module`. Returns whether the module changed.
    fn run(&self, module: &mut Module, cx: &mut PassContext<'_>) -> bool;

    /// Analyses only fill the cache; they never change IR.
    fn is_analysis(&self) -> bool {
        false
    }

    /// Cached analyses that stay valid when this pass changes the module.
    fn preserves(&self) -> &'static [AnalysisKind] {
        &[]
    }
}

/// State shared by the passes of one pipeline run.
pub struct PassContext<'a> {
    pub opts: &'a CompilerOptions,
    pub analyses: AnalysisCache,
    /// Optimization remarks, collected when remarks are enabled.
    pub remarks: Vec<String>,
    /// Problems reported by `verify` steps.
    pub verify_errors: Vec<String>,
}

impl<'a> PassContext<'a> {
    pub fn new(opts: &'a CompilerOptions) -> Self {
        Self {
            opts,
            analyses: AnalysisCache::default(),
            remarks: Vec::new(),
            verify_errors: Vec::new(),
        }
    }

    pub fn remark(&mut self, text: String) {
        if self.opts.vectorizer_remarks {
            self.remarks.push(text);
        }
    }
}

/// Launch metadata of the module, if it was annotated.
pub(crate) fn launch_metadata(m: &Module) -> Option<LaunchMetadata> {
    LaunchMetadata::read(m).ok()
}

/// Apply `per_function` to every defined function; report any change.
pub(crate) fn for_each_defined(m: &mut Module, mut per_function: impl FnMut(&mut Function) -> bool) -> bool {
    let mut changed = false;
    for f in m.functions.iter_mut().filter(|f| !f.is_declaration()) {
        changed |= per_function(f);
    }
    changed
}

/// Apply `per_kernel` to every defined kernel; report any change.
pub(crate) fn for_each_kernel(m: &mut Module, mut per_kernel: impl FnMut(&mut Function) -> bool) -> bool {
    let mut changed = false;
    for f in m
        .functions
        .iter_mut()
        .filter(|f| f.is_kernel() && !f.is_declaration())
    {
        changed |= per_kernel(f);
    }
    changed
}

// ─── Registry ─────────────────────────────────────────────────────

/// Every name [`PassRegistry::create`] resolves.
pub const PASS_NAMES: &[&str] = &[
    "inline-kernels",
    "remove-optnone",
    "optimize-wi-func-calls",
    "handle-samplers",
    "infer-address-spaces",
    "workitem-handler-chooser",
    "mem2reg",
    "domtree",
    "flatten-inline-all",
    "flatten-globals",
    "flatten-barrier-subs",
    "always-inline",
    "inline",
    "automatic-locals",
    "instcombine",
    "early-cse",
    "dce",
    "simplifycfg",
    "loop-vectorize",
    "slp-vectorizer",
    "verify",
    "loop-simplify",
    "uniformity",
    "phistoallocas",
    "isolate-regions",
    "implicit-loop-barriers",
    "implicit-cond-barriers",
    "loop-barriers",
    "barriertails",
    "barriers",
    "wi-aa",
    "workitemrepl",
    "subcfgformation",
    "workitemloops",
    "remove-barriers",
    "workgroup",
    "allocastoentry",
    "loop-deletion",
    "target-transform-info",
    "target-library-info",
    "vortex-mno-riscv-attribute",
    "vortex-printfs",
    "vortex-barriers",
];

/// Resolves pass names to pass instances.
pub struct PassRegistry;

impl PassRegistry {
    /// Build the pass called `name`, configured for `device`. `target` is
    /// the backend's target description when the device has one.
    pub fn create(
        name: &str,
        device: &DeviceDescriptor,
        target: Option<TargetInfo>,
    ) -> Option<Box<dyn Pass>> {
        let pass: Box<dyn Pass> = match name {
            "inline-kernels" => Box::new(inline::InlineKernels),
            "flatten-inline-all" => Box::new(inline::FlattenInlineAll),
            "flatten-globals" => Box::new(inline::FlattenGlobals),
            "flatten-barrier-subs" => Box::new(inline::FlattenBarrierSubs),
            "always-inline" => Box::new(inline::AlwaysInline),
            "inline" => Box::new(inline::Inline),

            "remove-optnone" => Box::new(cleanup::RemoveOptNone),
            "instcombine" => Box::new(cleanup::InstCombine),
            "early-cse" => Box::new(cleanup::EarlyCse),
            "dce" => Box::new(cleanup::Dce),
            "simplifycfg" => Box::new(cleanup::SimplifyCfg),
            "mem2reg" => Box::new(cleanup::Mem2Reg),
            "loop-deletion" => Box::new(cleanup::LoopDeletion),
            "allocastoentry" => Box::new(cleanup::AllocasToEntry),
            "verify" => Box::new(cleanup::Verify),

            "optimize-wi-func-calls" => Box::new(workitem::OptimizeWiFuncCalls),
            "handle-samplers" => Box::new(workitem::HandleSamplers),
            "infer-address-spaces" => Box::new(workitem::InferAddressSpaces),
            "workitem-handler-chooser" => Box::new(workitem::HandlerChooser),
            "automatic-locals" => Box::new(workitem::AutomaticLocals {
                to_args: device.autolocals_to_args,
                to_allocas: device.device_alloca_locals,
            }),

            "domtree" => Box::new(analysis::DomTreeAnalysis),
            "uniformity" => Box::new(analysis::UniformityAnalysis),
            "wi-aa" => Box::new(analysis::WorkItemAliasAnalysis),
            "target-transform-info" => Box::new(analysis::TargetTransformInfo(target)),
            "target-library-info" => Box::new(analysis::TargetLibraryInfo),

            "loop-vectorize" => Box::new(vectorize::LoopVectorize),
            "slp-vectorizer" => Box::new(vectorize::SlpVectorizer),

            "loop-simplify" => Box::new(barriers::LoopSimplify),
            "phistoallocas" => Box::new(barriers::PhisToAllocas),
            "isolate-regions" => Box::new(barriers::IsolateRegions),
            "implicit-loop-barriers" => Box::new(barriers::ImplicitLoopBarriers),
            "implicit-cond-barriers" => Box::new(barriers::ImplicitCondBarriers),
            "loop-barriers" => Box::new(barriers::LoopBarriers),
            "barriertails" => Box::new(barriers::BarrierTails),
            "barriers" => Box::new(barriers::Barriers),
            "remove-barriers" => Box::new(barriers::RemoveBarriers {
                keep_explicit: device.spmd,
            }),

            "workitemloops" => Box::new(wiloops::WorkItemLoops::new(device)),
            "subcfgformation" => Box::new(wiloops::SubCfgFormation::new(device)),
            "workitemrepl" => Box::new(wiloops::WorkItemReplication::new(device)),

            "workgroup" => Box::new(workgroup::Workgroup::new(device)),

            "vortex-mno-riscv-attribute" => Box::new(vortex::NoRiscvAttribute),
            "vortex-printfs" => Box::new(vortex::Printfs),
            "vortex-barriers" => Box::new(vortex::Barriers),
            _ => return None,
        };
        Some(pass)
    }
}
