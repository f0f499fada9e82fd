//! Work-group compilation pipelines.
//!
//! A pipeline is data first: [`kernel_compiler_steps`] returns the ordered
//! step list for a device, with [`PipelineStep::StandardOpts`] standing in
//! for the standard optimization set. [`Pipeline::build`] resolves every
//! step through the pass registry and expands the sentinel; the result is
//! immutable and shared through [`PipelineCache`], one per device.
//!
//! Ordering constraints the step list keeps:
//! - `mem2reg` runs early so trivial allocas never reach context saving.
//! - `implicit-cond-barriers` follows `implicit-loop-barriers`, which may
//!   add barriers inside conditional regions.
//! - `loop-barriers`, `barriertails` and `barriers` follow the implicit
//!   barrier passes so they normalize those barriers too.
//! - `phistoallocas` precedes region formation: phis cannot be restored
//!   from context slots.
//! - `automatic-locals` follows all inlining. A helper's local-memory
//!   variable that survives as a global is shared by every thread running
//!   the kernel.
//! - `workgroup` runs late, once inlining has exposed every group builtin
//!   as a direct call.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::CompilerOptions;
use crate::device::{DeviceDescriptor, DeviceFamily, DeviceId};
use crate::error::{CompilerError, Result};
use crate::ir::Module;
use crate::passes::{Pass, PassContext, PassRegistry};
use crate::target::BackendFactory;

/// Name of the standard optimization sentinel in rendered step lists.
pub const STANDARD_OPTS: &str = "STANDARD_OPTS";

/// One entry of a pipeline's step list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStep {
    Pass(&'static str),
    /// Expands into [`standard_opts`] when the pipeline is built.
    StandardOpts,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::Pass(name) => f.write_str(name),
            PipelineStep::StandardOpts => f.write_str(STANDARD_OPTS),
        }
    }
}

/// The work-group compilation steps for `device`, in order.
pub fn kernel_compiler_steps(device: &DeviceDescriptor) -> Vec<PipelineStep> {
    use PipelineStep::{Pass, StandardOpts};

    let vortex = device.family == DeviceFamily::Vortex;
    let mut steps = Vec::new();
    if vortex {
        steps.extend([Pass("vortex-mno-riscv-attribute"), Pass("vortex-printfs")]);
    }
    steps.extend([
        Pass("inline-kernels"),
        Pass("remove-optnone"),
        Pass("optimize-wi-func-calls"),
        Pass("handle-samplers"),
        Pass("infer-address-spaces"),
        Pass("workitem-handler-chooser"),
        Pass("mem2reg"),
        Pass("domtree"),
    ]);
    if device.spmd {
        steps.extend([Pass("flatten-inline-all"), Pass("always-inline")]);
    } else {
        steps.extend([
            Pass("flatten-globals"),
            Pass("flatten-barrier-subs"),
            Pass("always-inline"),
            Pass("inline"),
        ]);
    }
    steps.push(Pass("automatic-locals"));
    steps.push(StandardOpts);

    if !device.spmd {
        steps.extend([
            Pass("simplifycfg"),
            Pass("loop-simplify"),
            Pass("uniformity"),
            Pass("phistoallocas"),
            Pass("isolate-regions"),
            Pass("implicit-loop-barriers"),
            Pass("implicit-cond-barriers"),
            Pass("loop-barriers"),
            Pass("barriertails"),
            Pass("barriers"),
            Pass("isolate-regions"),
            Pass("wi-aa"),
            Pass("workitemrepl"),
            // Before workitemloops: a kernel that has been through the loop
            // former looks like it has barriers.
            Pass("subcfgformation"),
            Pass("workitemloops"),
        ]);
        if vortex {
            steps.push(Pass("vortex-barriers"));
        }
        steps.push(Pass("remove-barriers"));
    }

    if device.workgroup_pass {
        steps.extend([Pass("workgroup"), Pass("always-inline")]);
    }

    steps.extend([
        Pass("allocastoentry"),
        // Replication leaves unreachable blocks behind.
        Pass("simplifycfg"),
        StandardOpts,
        // Store sinking in the standard set often leaves loops only
        // deletable on a second try.
        Pass("loop-deletion"),
        Pass("remove-barriers"),
    ]);
    steps
}

/// The passes `STANDARD_OPTS` expands to. The vectorizers run only on
/// non-SPMD devices whose work-group method wants them.
pub fn standard_opts(device: &DeviceDescriptor, opts: &CompilerOptions) -> Vec<&'static str> {
    let mut names = Vec::new();
    if opts.verify_modules {
        names.push("verify");
    }
    names.extend(["instcombine", "simplifycfg", "early-cse", "mem2reg", "instcombine", "dce"]);
    if !device.spmd && opts.wg_method.wants_vectorizer() {
        names.extend(["loop-vectorize", "slp-vectorizer"]);
    }
    names.extend(["simplifycfg", "dce"]);
    if opts.verify_modules {
        names.push("verify");
    }
    names
}

// ─── Pipeline ─────────────────────────────────────────────────────

/// A resolved, immutable pass sequence for one device.
pub struct Pipeline {
    device: DeviceId,
    steps: Vec<PipelineStep>,
    passes: Vec<Box<dyn Pass>>,
    runs: AtomicUsize,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("device", &self.device)
            .field("passes", &self.pass_names())
            .field("runs", &self.runs())
            .finish()
    }
}

impl Pipeline {
    /// Resolve the device's step list. Target analyses lead the pipeline
    /// when the device has a backend.
    ///
    /// # Panics
    ///
    /// If a step names a pass the registry does not know.
    pub fn build(
        device: &DeviceDescriptor,
        opts: &CompilerOptions,
        backends: &BackendFactory,
    ) -> Self {
        let steps = kernel_compiler_steps(device);
        let target = backends.get(device, opts).map(|b| b.target_info());

        let mut names = Vec::new();
        if target.is_some() {
            names.push("target-transform-info");
        }
        names.push("target-library-info");
        for step in &steps {
            match *step {
                PipelineStep::Pass(name) => names.push(name),
                PipelineStep::StandardOpts => names.extend(standard_opts(device, opts)),
            }
        }
        let passes = names
            .into_iter()
            .map(|name| match PassRegistry::create(name, device, target) {
                Some(pass) => pass,
                None => panic!("failed to create kernel compiler pass '{}'", name),
            })
            .collect::<Vec<_>>();
        log::debug!(
            "built kernel compiler pipeline for {}: {} passes",
            device.id,
            passes.len()
        );
        Self {
            device: device.id,
            steps,
            passes,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The step list, with the sentinel unexpanded.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Names of the resolved passes in run order.
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.passes.iter().any(|p| p.name() == name)
    }

    /// How many times [`Pipeline::run`] has been entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    /// Run every pass over `module`. Returns the optimization remarks the
    /// run produced; problems found by `verify` steps fail the run.
    pub fn run(&self, module: &mut Module, opts: &CompilerOptions) -> Result<Vec<String>> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let mut cx = PassContext::new(opts);
        for pass in &self.passes {
            let changed = pass.run(module, &mut cx);
            log::trace!("{}: {}", pass.name(), if changed { "changed" } else { "unchanged" });
            if changed && !pass.is_analysis() {
                cx.analyses.invalidate(pass.preserves());
            }
        }
        if !cx.verify_errors.is_empty() {
            return Err(CompilerError::Verify(cx.verify_errors));
        }
        Ok(cx.remarks)
    }
}

// ─── Cache ────────────────────────────────────────────────────────

/// Process-wide pipelines, built once per device and never changed after.
#[derive(Default)]
pub struct PipelineCache {
    pipelines: Mutex<HashMap<DeviceId, Arc<Pipeline>>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's pipeline, built on first request. Later requests return
    /// the same pipeline whatever `opts` they pass.
    pub fn pipeline_for(
        &self,
        device: &DeviceDescriptor,
        opts: &CompilerOptions,
        backends: &BackendFactory,
    ) -> Arc<Pipeline> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = pipelines.get(&device.id) {
            return Arc::clone(p);
        }
        let pipeline = Arc::new(Pipeline::build(device, opts, backends));
        pipelines.insert(device.id, Arc::clone(&pipeline));
        pipeline
    }

    pub fn len(&self) -> usize {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
