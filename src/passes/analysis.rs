//! Cached analyses: dominator trees, work-item uniformity, work-item
//! access classes, and the target facts handed in by the backend.
//!
//! Function-level results are keyed by function name and dropped by the
//! pipeline whenever a transform changes the module, unless that
//! transform declares them preserved.

use std::collections::{HashMap, HashSet};

use super::{for_each_defined, Pass, PassContext};
use crate::ir::cfg::{Cfg, DomTree};
use crate::ir::{addrspace, builtins, Function, Module, Op, Terminator, Type, Value, ValueKind};
use crate::target::TargetInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisKind {
    DomTree,
    Uniformity,
    WorkItemAccess,
}

/// Math functions without side effects that the target library provides.
const LIBRARY_FUNCTIONS: &[&str] = &[
    "sqrt", "rsqrt", "fabs", "sin", "cos", "tan", "exp", "exp2", "log", "log2", "pow", "fmin",
    "fmax", "floor", "ceil", "fma", "mad", "native_sqrt", "native_exp", "native_log",
];

#[derive(Default)]
pub struct AnalysisCache {
    /// Set by `target-transform-info`.
    pub target: Option<TargetInfo>,
    /// Set by `target-library-info`.
    pub library_functions: Option<HashSet<&'static str>>,
    domtrees: HashMap<String, DomTree>,
    uniformity: HashMap<String, Uniformity>,
    wi_access: HashMap<String, WorkItemAccess>,
}

impl AnalysisCache {
    /// Drop every function-level result not named in `preserved`.
    pub fn invalidate(&mut self, preserved: &[AnalysisKind]) {
        if !preserved.contains(&AnalysisKind::DomTree) {
            self.domtrees.clear();
        }
        if !preserved.contains(&AnalysisKind::Uniformity) {
            self.uniformity.clear();
        }
        if !preserved.contains(&AnalysisKind::WorkItemAccess) {
            self.wi_access.clear();
        }
    }

    pub fn has(&self, kind: AnalysisKind, function: &str) -> bool {
        match kind {
            AnalysisKind::DomTree => self.domtrees.contains_key(function),
            AnalysisKind::Uniformity => self.uniformity.contains_key(function),
            AnalysisKind::WorkItemAccess => self.wi_access.contains_key(function),
        }
    }

    pub fn dominators(&mut self, f: &Function) -> &DomTree {
        self.domtrees
            .entry(f.name.clone())
            .or_insert_with(|| Cfg::new(f).dominators())
    }

    pub fn uniformity(&mut self, f: &Function) -> Uniformity {
        self.uniformity
            .entry(f.name.clone())
            .or_insert_with(|| Uniformity::compute(f))
            .clone()
    }

    pub fn work_item_access(&mut self, f: &Function) -> WorkItemAccess {
        if let Some(found) = self.wi_access.get(&f.name) {
            return found.clone();
        }
        let uniformity = self.uniformity(f);
        let access = WorkItemAccess::compute(f, &uniformity);
        self.wi_access.insert(f.name.clone(), access.clone());
        access
    }

    /// Whether a call to `callee` has no side effects.
    pub fn is_pure_call(&self, callee: &str) -> bool {
        builtins::is_work_item_function(callee)
            || self
                .library_functions
                .as_ref()
                .is_some_and(|lib| lib.contains(callee))
    }
}

// ─── Uniformity ───────────────────────────────────────────────────

/// Which values may differ between the work-items of one work-group.
#[derive(Clone, Debug, Default)]
pub struct Uniformity {
    known: HashSet<String>,
    varying: HashSet<String>,
}

impl Uniformity {
    pub fn compute(f: &Function) -> Self {
        let mut known: HashSet<String> = f.params.iter().map(|p| p.name.clone()).collect();
        for inst in f.insts() {
            if let Some(r) = &inst.result {
                known.insert(r.clone());
            }
        }
        let has_stores = f.insts().any(|i| matches!(i.op, Op::Store { .. }));
        let divergent_branch: HashMap<&str, Option<&Value>> = f
            .blocks
            .iter()
            .map(|b| match &b.term {
                Terminator::CondBr { cond, .. } => (b.label.as_str(), Some(cond)),
                _ => (b.label.as_str(), None),
            })
            .collect();

        let mut varying: HashSet<String> = HashSet::new();
        loop {
            let mut changed = false;
            for inst in f.insts() {
                let Some(r) = &inst.result else { continue };
                if varying.contains(r) {
                    continue;
                }
                let is_varying_value =
                    |v: &Value| v.as_local().is_some_and(|n| varying.contains(n));
                let now_varying = match &inst.op {
                    Op::Alloca { .. } => true,
                    Op::Call { callee, args, .. } => {
                        if builtins::is_work_item_varying(callee) {
                            true
                        } else if builtins::is_work_item_function(callee) {
                            args.iter().any(is_varying_value)
                        } else {
                            true
                        }
                    }
                    Op::Load { ptr, .. } => {
                        is_varying_value(ptr)
                            || (has_stores && ptr.ty != Type::Ptr(addrspace::CONSTANT))
                    }
                    Op::Phi { incoming, .. } => incoming.iter().any(|(v, pred)| {
                        is_varying_value(v)
                            || divergent_branch
                                .get(pred.as_str())
                                .copied()
                                .flatten()
                                .is_some_and(is_varying_value)
                    }),
                    _ => inst.operands().into_iter().any(is_varying_value),
                };
                if now_varying {
                    varying.insert(r.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Self { known, varying }
    }

    /// Constants, globals and parameters are uniform. Locals created after
    /// the analysis ran are treated as varying.
    pub fn is_uniform(&self, v: &Value) -> bool {
        match &v.kind {
            ValueKind::Local(n) => self.known.contains(n) && !self.varying.contains(n),
            _ => true,
        }
    }

    pub fn is_uniform_name(&self, name: &str) -> bool {
        self.known.contains(name) && !self.varying.contains(name)
    }

    /// Whether the block ends in an unconditional branch or a branch on a
    /// uniform condition.
    pub fn is_uniform_branch(&self, term: &Terminator) -> bool {
        match term {
            Terminator::CondBr { cond, .. } => self.is_uniform(cond),
            _ => true,
        }
    }
}

// ─── Work-item access classes ─────────────────────────────────────

/// What a pointer may alias across work-items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerClass {
    /// Per-work-item stack memory.
    Private,
    /// Shared memory at an address that depends on the work-item.
    WorkItemIndexed,
    /// Possibly the same address for every work-item.
    Shared,
}

#[derive(Clone, Debug, Default)]
pub struct WorkItemAccess {
    classes: HashMap<String, PointerClass>,
}

impl WorkItemAccess {
    pub fn compute(f: &Function, uniformity: &Uniformity) -> Self {
        let mut classes: HashMap<String, PointerClass> = HashMap::new();
        // Definitions precede uses in block order for everything but phis,
        // which stay `Shared`.
        for inst in f.insts() {
            let Some(r) = &inst.result else { continue };
            let class_of = |v: &Value| {
                v.as_local()
                    .and_then(|n| classes.get(n).copied())
                    .unwrap_or(PointerClass::Shared)
            };
            let class = match &inst.op {
                Op::Alloca { .. } => PointerClass::Private,
                Op::Gep { base, index, .. } => match class_of(base) {
                    PointerClass::Private => PointerClass::Private,
                    PointerClass::WorkItemIndexed if uniformity.is_uniform(index) => {
                        PointerClass::WorkItemIndexed
                    }
                    PointerClass::Shared
                        if uniformity.is_uniform(base) && !uniformity.is_uniform(index) =>
                    {
                        PointerClass::WorkItemIndexed
                    }
                    _ => PointerClass::Shared,
                },
                Op::Cast { value, to, .. } if to.is_ptr() => class_of(value),
                _ => continue,
            };
            classes.insert(r.clone(), class);
        }
        Self { classes }
    }

    pub fn class_of(&self, ptr: &Value) -> PointerClass {
        ptr.as_local()
            .and_then(|n| self.classes.get(n).copied())
            .unwrap_or(PointerClass::Shared)
    }

    /// Whether no two work-items can store to the same address from the
    /// given blocks.
    pub fn stores_are_disjoint<'f>(&self, blocks: impl IntoIterator<Item = &'f crate::ir::Block>) -> bool {
        blocks.into_iter().all(|b| {
            b.insts.iter().all(|i| match &i.op {
                Op::Store { ptr, .. } => self.class_of(ptr) != PointerClass::Shared,
                _ => true,
            })
        })
    }
}

// ─── Analysis passes ──────────────────────────────────────────────

pub struct DomTreeAnalysis;

impl Pass for DomTreeAnalysis {
    fn name(&self) -> &'static str {
        "domtree"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            cx.analyses.dominators(f);
            false
        })
    }
}

pub struct UniformityAnalysis;

impl Pass for UniformityAnalysis {
    fn name(&self) -> &'static str {
        "uniformity"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            cx.analyses.uniformity(f);
            false
        })
    }
}

pub struct WorkItemAliasAnalysis;

impl Pass for WorkItemAliasAnalysis {
    fn name(&self) -> &'static str {
        "wi-aa"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            cx.analyses.work_item_access(f);
            false
        })
    }
}

pub struct TargetTransformInfo(pub Option<TargetInfo>);

impl Pass for TargetTransformInfo {
    fn name(&self) -> &'static str {
        "target-transform-info"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, _m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        if self.0.is_some() {
            cx.analyses.target = self.0;
        }
        false
    }
}

pub struct TargetLibraryInfo;

impl Pass for TargetLibraryInfo {
    fn name(&self) -> &'static str {
        "target-library-info"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, _m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        cx.analyses.library_functions = Some(LIBRARY_FUNCTIONS.iter().copied().collect());
        false
    }
}
