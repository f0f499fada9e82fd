//! Work-item builtin cleanups, handler selection and automatic locals.

use std::collections::{BTreeSet, HashMap};

use super::{for_each_defined, for_each_kernel, launch_metadata, Pass, PassContext};
use crate::config::WorkGroupMethod;
use crate::ir::callgraph::CallGraph;
use crate::ir::cfg::Cfg;
use crate::ir::{
    addrspace, builtins, CastKind, Function, Inst, Module, NameGen, Op, Param, Type, Value,
};

/// Function annotation naming the work-item handler of a kernel.
pub(crate) const HANDLER_KEY: &str = "wi.handler";

/// Largest work-group `workitemrepl` will unroll.
pub(crate) const REPLICATION_LIMIT: u64 = 16;

const SAMPLER_INITIALIZER: &str = "__translate_sampler_initializer";

fn entry_alloca_end(f: &Function) -> usize {
    f.blocks[0]
        .insts
        .iter()
        .take_while(|i| matches!(i.op, Op::Alloca { .. }))
        .count()
}

// ─── optimize-wi-func-calls ───────────────────────────────────────

/// Hoists work-item queries with constant arguments to the entry block and
/// folds repeated queries into one.
pub struct OptimizeWiFuncCalls;

impl Pass for OptimizeWiFuncCalls {
    fn name(&self) -> &'static str {
        "optimize-wi-func-calls"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            let mut first: HashMap<String, Value> = HashMap::new();
            let mut hoisted = Vec::new();
            let mut duplicates: Vec<(String, Value)> = Vec::new();
            for b in f.blocks.iter_mut() {
                let mut kept = Vec::with_capacity(b.insts.len());
                for inst in std::mem::take(&mut b.insts) {
                    let candidate = match (&inst.op, &inst.result) {
                        (Op::Call { callee, args, ret }, Some(r))
                            if builtins::is_work_item_function(callee)
                                && args.iter().all(Value::is_constant) =>
                        {
                            Some((inst.op.to_string(), Value::local(*ret, r.clone())))
                        }
                        _ => None,
                    };
                    match candidate {
                        Some((key, value)) => match first.get(&key) {
                            Some(existing) => {
                                if let Some(r) = &inst.result {
                                    duplicates.push((r.clone(), existing.clone()));
                                }
                            }
                            None => {
                                first.insert(key, value);
                                hoisted.push(inst);
                            }
                        },
                        None => kept.push(inst),
                    }
                }
                b.insts = kept;
            }
            if hoisted.is_empty() {
                return false;
            }
            let at = entry_alloca_end(f);
            f.blocks[0].insts.splice(at..at, hoisted);
            for (r, v) in &duplicates {
                f.replace_all_uses(r, v);
            }
            true
        })
    }
}

// ─── handle-samplers ──────────────────────────────────────────────

/// Sampler initializers become the integer constant they encode.
pub struct HandleSamplers;

impl Pass for HandleSamplers {
    fn name(&self) -> &'static str {
        "handle-samplers"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let changed = for_each_defined(m, |f| {
            let mut changed = false;
            for inst in f.blocks.iter_mut().flat_map(|b| b.insts.iter_mut()) {
                let Op::Call { callee, args, ret } = &inst.op else {
                    continue;
                };
                if callee != SAMPLER_INITIALIZER {
                    continue;
                }
                let Some(bits) = args.first().and_then(Value::as_int) else {
                    continue;
                };
                inst.op = Op::Cast {
                    kind: CastKind::IntToPtr,
                    value: Value::i64(bits),
                    to: *ret,
                };
                changed = true;
            }
            changed
        });
        if changed {
            m.remove_unused_declarations();
        }
        changed
    }
}

// ─── infer-address-spaces ─────────────────────────────────────────

/// Generic pointers produced by a cast from a specific address space, and
/// only used for addressing, are rewritten to stay in that space.
pub struct InferAddressSpaces;

impl InferAddressSpaces {
    /// `root` plus the geps derived from it, if every use is a memory
    /// address or a gep base.
    fn addressing_closure(f: &Function, root: &str) -> Option<BTreeSet<String>> {
        let mut closure = BTreeSet::new();
        let mut work = vec![root.to_string()];
        while let Some(name) = work.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            for b in &f.blocks {
                if b.term.operands().iter().any(|v| v.as_local() == Some(name.as_str())) {
                    return None;
                }
                for inst in &b.insts {
                    if !inst.operands().iter().any(|v| v.as_local() == Some(name.as_str())) {
                        continue;
                    }
                    match &inst.op {
                        Op::Load { .. } => {}
                        Op::Store { value, .. } if value.as_local() != Some(name.as_str()) => {}
                        Op::Gep { base, index, .. }
                            if base.as_local() == Some(name.as_str())
                                && index.as_local() != Some(name.as_str()) =>
                        {
                            work.extend(inst.result.clone());
                        }
                        _ => return None,
                    }
                }
            }
        }
        Some(closure)
    }

    fn infer(f: &mut Function) -> bool {
        let found = f.blocks.iter().enumerate().find_map(|(bi, b)| {
            b.insts.iter().enumerate().find_map(|(ii, inst)| match (&inst.op, &inst.result) {
                (
                    Op::Cast {
                        kind: CastKind::AddrSpaceCast,
                        value,
                        to: Type::Ptr(addrspace::GENERIC),
                    },
                    Some(r),
                ) if matches!(value.ty, Type::Ptr(s) if s != addrspace::GENERIC) => {
                    let closure = Self::addressing_closure(f, r)?;
                    Some((bi, ii, r.clone(), value.clone(), closure))
                }
                _ => None,
            })
        });
        let Some((bi, ii, root, source, closure)) = found else {
            return false;
        };
        f.blocks[bi].insts.remove(ii);
        f.replace_all_uses(&root, &source);
        for name in closure.iter().filter(|n| **n != root) {
            f.replace_all_uses(name, &Value::local(source.ty, name.clone()));
        }
        true
    }
}

impl Pass for InferAddressSpaces {
    fn name(&self) -> &'static str {
        "infer-address-spaces"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            let mut changed = false;
            while Self::infer(f) {
                changed = true;
            }
            changed
        })
    }
}

// ─── workitem-handler-chooser ─────────────────────────────────────

/// Records on each kernel which work-item handler will serialize it.
pub struct HandlerChooser;

impl HandlerChooser {
    fn barrier_in_loop(f: &Function, reaches_barrier: &BTreeSet<String>) -> bool {
        let cfg = Cfg::new(f);
        let dom = cfg.dominators();
        cfg.natural_loops(&dom).iter().any(|lp| {
            f.blocks
                .iter()
                .filter(|b| lp.contains(&b.label))
                .flat_map(|b| b.insts.iter())
                .any(|i| i.callee().is_some_and(|c| reaches_barrier.contains(c)))
        })
    }

    pub(crate) fn choose(
        method: WorkGroupMethod,
        static_size: Option<[u64; 3]>,
        barrier_in_loop: bool,
    ) -> &'static str {
        let small = static_size
            .and_then(|[x, y, z]| x.max(1).checked_mul(y.max(1))?.checked_mul(z.max(1)))
            .is_some_and(|n| n <= REPLICATION_LIMIT);
        match method {
            WorkGroupMethod::Auto if small && !barrier_in_loop => "repl",
            WorkGroupMethod::Auto | WorkGroupMethod::Loops | WorkGroupMethod::LoopVec => "loops",
            WorkGroupMethod::Cbs => "cbs",
            WorkGroupMethod::Repl if small => "repl",
            WorkGroupMethod::Repl => "loops",
        }
    }
}

impl Pass for HandlerChooser {
    fn name(&self) -> &'static str {
        "workitem-handler-chooser"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let static_size = launch_metadata(m).and_then(|l| l.spec.static_local_size());
        let barriers: BTreeSet<String> = m
            .functions
            .iter()
            .filter(|f| builtins::is_barrier(&f.name))
            .map(|f| f.name.clone())
            .collect();
        let reaches_barrier = CallGraph::new(m).callers_of(&barriers);
        let method = cx.opts.wg_method;
        for_each_kernel(m, |f| {
            let handler = Self::choose(method, static_size, Self::barrier_in_loop(f, &reaches_barrier));
            log::debug!("@{}: work-item handler '{}'", f.name, handler);
            f.annotations.insert(HANDLER_KEY.to_string(), handler.to_string()) != Some(handler.to_string())
        })
    }
}

// ─── automatic-locals ─────────────────────────────────────────────

/// Local-memory globals referenced by kernels become per-launch storage:
/// extra kernel arguments, or entry-block allocas.
pub struct AutomaticLocals {
    pub to_args: bool,
    pub to_allocas: bool,
}

impl Pass for AutomaticLocals {
    fn name(&self) -> &'static str {
        "automatic-locals"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        if !self.to_args && !self.to_allocas {
            return false;
        }
        let locals: Vec<(String, Type, u64, u64)> = m
            .globals
            .iter()
            .filter(|g| g.addr_space == addrspace::LOCAL && g.is_definition())
            .map(|g| (g.name.clone(), g.ty, g.count, g.size_bytes()))
            .collect();
        if locals.is_empty() {
            return false;
        }
        let local_ptr = Type::Ptr(addrspace::LOCAL);
        let changed = for_each_kernel(m, |f| {
            let mut changed = false;
            let mut names = NameGen::for_function(f);
            for (g, ty, count, bytes) in &locals {
                if !f.references_global(g) {
                    continue;
                }
                let name = names.fresh(&format!("_local_{}", g));
                if self.to_args {
                    f.params.push(Param {
                        name: name.clone(),
                        ty: local_ptr,
                    });
                    f.annotations.insert(format!("autolocal.{}", g), bytes.to_string());
                    f.replace_global_uses(g, &Value::local(local_ptr, name));
                } else {
                    let cast = names.fresh(&format!("{}.as", name));
                    let slot = Inst::new(name.clone(), Op::Alloca { ty: *ty, count: *count });
                    let as_local = Inst::new(
                        cast.clone(),
                        Op::Cast {
                            kind: CastKind::AddrSpaceCast,
                            value: Value::local(Type::Ptr(addrspace::PRIVATE), name),
                            to: local_ptr,
                        },
                    );
                    f.replace_global_uses(g, &Value::local(local_ptr, cast));
                    let at = entry_alloca_end(f);
                    f.blocks[0].insts.insert(at, as_local);
                    f.blocks[0].insts.insert(0, slot);
                }
                changed = true;
            }
            changed
        });
        if changed {
            let mut referenced: BTreeSet<String> = BTreeSet::new();
            for f in &m.functions {
                referenced.extend(f.referenced_symbols());
            }
            for g in &m.globals {
                referenced.extend(g.init_references().into_iter().map(String::from));
            }
            m.globals.retain(|g| {
                g.addr_space != addrspace::LOCAL || referenced.contains(&g.name)
            });
        }
        changed
    }
}
