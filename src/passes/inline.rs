//! Inlining discipline.
//!
//! The flattening passes only mark functions `alwaysinline`; the actual
//! work happens in `always-inline` and the size-driven `inline`.

use std::collections::{BTreeSet, HashMap};

use super::{launch_metadata, Pass, PassContext};
use crate::ir::callgraph::CallGraph;
use crate::ir::{builtins, Block, FnAttr, Function, Inst, Module, NameGen, Op, Terminator, Value};

/// Callees up to this many instructions are inlined by `inline`.
const INLINE_THRESHOLD: usize = 40;

/// Upper bound on inlined call sites per pass run.
const MAX_INLINED_SITES: usize = 10_000;

/// Annotations naming blocks that must follow a body into its caller.
const BLOCK_LIST_ANNOTATIONS: &[&str] = &["wi.loops", "wi.parallel"];

/// Inline the call at `caller.blocks[block].insts[index]`, a call to
/// `callee`. Returns the label each callee block got in the caller.
pub fn inline_call(
    caller: &mut Function,
    block: usize,
    index: usize,
    callee: &Function,
) -> HashMap<String, String> {
    let call = caller.blocks[block].insts[index].clone();
    let Op::Call { ret, args, .. } = &call.op else {
        return HashMap::new();
    };
    let mut names = NameGen::for_function(caller);

    let labels: HashMap<String, String> = callee
        .blocks
        .iter()
        .map(|b| {
            (
                b.label.clone(),
                names.fresh(&format!("{}.{}", callee.name, b.label)),
            )
        })
        .collect();
    let head_label = caller.blocks[block].label.clone();
    let cont_label = names.fresh(&format!("{}.cont", head_label));

    let mut values: HashMap<String, Value> = callee
        .params
        .iter()
        .zip(args)
        .map(|(p, a)| (p.name.clone(), a.clone()))
        .collect();
    for inst in callee.insts() {
        if let Some(r) = &inst.result {
            values.insert(r.clone(), Value::local(inst.result_type(), names.fresh(r)));
        }
    }
    let map_value = |v: &mut Value| {
        if let Some(mapped) = v.as_local().and_then(|n| values.get(n)) {
            *v = mapped.clone();
        }
    };

    // Split the calling block after the call.
    let head = &mut caller.blocks[block];
    let tail = head.insts.split_off(index + 1);
    head.insts.pop();
    let callee_entry = labels
        .get(&callee.blocks[0].label)
        .cloned()
        .unwrap_or_default();
    let old_term = std::mem::replace(&mut head.term, Terminator::Br(callee_entry));
    let mut cont = Block {
        label: cont_label.clone(),
        insts: tail,
        term: old_term,
    };
    let cont_succs: Vec<String> = cont.term.successors().iter().map(|s| s.to_string()).collect();
    for b in caller.blocks.iter_mut() {
        if !cont_succs.contains(&b.label) {
            continue;
        }
        for inst in b.insts.iter_mut() {
            if let Op::Phi { incoming, .. } = &mut inst.op {
                for (_, pred) in incoming.iter_mut() {
                    if *pred == head_label {
                        *pred = cont_label.clone();
                    }
                }
            }
        }
    }

    let mut allocas = Vec::new();
    let mut returns: Vec<(Value, String)> = Vec::new();
    let mut cloned = Vec::with_capacity(callee.blocks.len());
    for b in &callee.blocks {
        let label = labels[&b.label].clone();
        let mut insts = Vec::with_capacity(b.insts.len());
        for inst in &b.insts {
            let mut inst = inst.clone();
            if let Some(r) = &inst.result {
                inst.result = values.get(r).and_then(|v| v.as_local()).map(String::from);
            }
            for v in inst.operands_mut() {
                map_value(v);
            }
            if let Op::Phi { incoming, .. } = &mut inst.op {
                for (_, pred) in incoming.iter_mut() {
                    if let Some(l) = labels.get(pred.as_str()) {
                        *pred = l.clone();
                    }
                }
            }
            if matches!(inst.op, Op::Alloca { .. }) {
                allocas.push(inst);
            } else {
                insts.push(inst);
            }
        }
        let term = match &b.term {
            Terminator::Ret(v) => {
                if let Some(v) = v {
                    let mut v = v.clone();
                    map_value(&mut v);
                    returns.push((v, label.clone()));
                }
                Terminator::Br(cont_label.clone())
            }
            other => {
                let mut t = other.clone();
                for s in other.successors() {
                    if let Some(l) = labels.get(s) {
                        t.replace_successor(s, l);
                    }
                }
                for v in t.operands_mut() {
                    map_value(v);
                }
                t
            }
        };
        cloned.push(Block { label, insts, term });
    }

    if let Some(r) = &call.result {
        let replacement = match returns.len() {
            0 => Some(Value {
                ty: *ret,
                kind: crate::ir::ValueKind::Undef,
            }),
            1 => Some(returns.remove(0).0),
            _ => {
                cont.insts.insert(
                    0,
                    Inst::new(
                        r.clone(),
                        Op::Phi {
                            ty: *ret,
                            incoming: returns,
                        },
                    ),
                );
                None
            }
        };
        if let Some(v) = replacement {
            replace_in_block(&mut cont, r, &v);
            caller.replace_all_uses(r, &v);
        }
    }

    cloned.push(cont);
    caller.blocks.splice(block + 1..block + 1, cloned);
    let at = caller.blocks[0]
        .insts
        .iter()
        .take_while(|i| matches!(i.op, Op::Alloca { .. }))
        .count();
    caller.blocks[0].insts.splice(at..at, allocas);
    labels
}

fn replace_in_block(b: &mut Block, name: &str, with: &Value) {
    let ops = b
        .insts
        .iter_mut()
        .flat_map(|i| i.operands_mut())
        .chain(b.term.operands_mut());
    for op in ops {
        if op.as_local() == Some(name) {
            *op = with.clone();
        }
    }
}

/// Copy block-list annotations from an inlined body, renaming the blocks.
fn carry_block_annotations(caller: &mut Function, callee: &Function, labels: &HashMap<String, String>) {
    for key in BLOCK_LIST_ANNOTATIONS {
        let Some(list) = callee.annotations.get(*key) else {
            continue;
        };
        let mut merged: Vec<String> = caller
            .annotations
            .get(*key)
            .map(|s| s.split(',').filter(|l| !l.is_empty()).map(String::from).collect())
            .unwrap_or_default();
        merged.extend(
            list.split(',')
                .filter_map(|l| labels.get(l))
                .cloned(),
        );
        caller.annotations.insert(key.to_string(), merged.join(","));
    }
}

/// Functions that can reach themselves through direct calls.
fn recursive_functions(m: &Module) -> BTreeSet<String> {
    let cg = CallGraph::new(m);
    m.functions
        .iter()
        .filter(|f| {
            cg.callees(&f.name)
                .iter()
                .any(|callee| cg.closure(callee).contains(&f.name))
        })
        .map(|f| f.name.clone())
        .collect()
}

/// Inline every call site where `wanted(caller, callee)` holds, including
/// sites exposed by earlier inlining. Recursive callees are left alone.
fn inline_where(m: &mut Module, wanted: impl Fn(&Function, &Function) -> bool) -> bool {
    let recursive = recursive_functions(m);
    let mut inlined = 0;
    loop {
        let mut site = None;
        'search: for (fi, f) in m.functions.iter().enumerate() {
            for (bi, b) in f.blocks.iter().enumerate() {
                for (ii, inst) in b.insts.iter().enumerate() {
                    let Some(name) = inst.callee() else { continue };
                    if name == f.name || recursive.contains(name) {
                        continue;
                    }
                    let Some(callee) = m.function(name) else { continue };
                    if !callee.is_declaration() && wanted(f, callee) {
                        site = Some((fi, bi, ii, name.to_string()));
                        break 'search;
                    }
                }
            }
        }
        let Some((fi, bi, ii, name)) = site else { break };
        let Some(callee) = m.function(&name).cloned() else {
            break;
        };
        let caller = &mut m.functions[fi];
        let labels = inline_call(caller, bi, ii, &callee);
        carry_block_annotations(caller, &callee, &labels);
        log::trace!("inlined @{} into @{}", name, caller.name);
        inlined += 1;
        if inlined >= MAX_INLINED_SITES {
            log::warn!("stopped inlining after {} call sites", inlined);
            break;
        }
    }
    inlined > 0
}

/// Mark the non-kernel functions selected by `select` always-inline.
fn mark_always_inline(m: &mut Module, select: &BTreeSet<String>) -> bool {
    let mut changed = false;
    for f in m.functions.iter_mut() {
        if f.is_declaration() || f.is_kernel() || !select.contains(&f.name) {
            continue;
        }
        changed |= f.attrs.insert(FnAttr::AlwaysInline);
        changed |= f.attrs.remove(&FnAttr::NoInline);
    }
    changed
}

pub struct InlineKernels;

impl Pass for InlineKernels {
    fn name(&self) -> &'static str {
        "inline-kernels"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        inline_where(m, |_, callee| callee.is_kernel())
    }
}

pub struct FlattenInlineAll;

impl Pass for FlattenInlineAll {
    fn name(&self) -> &'static str {
        "flatten-inline-all"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let all = m.functions.iter().map(|f| f.name.clone()).collect();
        mark_always_inline(m, &all)
    }
}

pub struct FlattenGlobals;

impl Pass for FlattenGlobals {
    fn name(&self) -> &'static str {
        "flatten-globals"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let queries: BTreeSet<String> = m
            .functions
            .iter()
            .filter(|f| builtins::is_work_item_function(&f.name))
            .map(|f| f.name.clone())
            .collect();
        let users = CallGraph::new(m).callers_of(&queries);
        mark_always_inline(m, &users)
    }
}

pub struct FlattenBarrierSubs;

impl Pass for FlattenBarrierSubs {
    fn name(&self) -> &'static str {
        "flatten-barrier-subs"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let barriers: BTreeSet<String> = m
            .functions
            .iter()
            .filter(|f| builtins::is_barrier(&f.name))
            .map(|f| f.name.clone())
            .collect();
        let users = CallGraph::new(m).callers_of(&barriers);
        mark_always_inline(m, &users)
    }
}

pub struct AlwaysInline;

impl Pass for AlwaysInline {
    fn name(&self) -> &'static str {
        "always-inline"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let mut changed = inline_where(m, |_, callee| callee.has_attr(FnAttr::AlwaysInline));

        let aux = launch_metadata(m)
            .map(|l| l.device_aux_functions)
            .unwrap_or_default();
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for f in &m.functions {
            referenced.extend(f.referenced_symbols());
        }
        for g in &m.globals {
            referenced.extend(g.init_references().into_iter().map(String::from));
        }
        let before = m.functions.len();
        m.functions.retain(|f| {
            f.is_declaration()
                || f.is_kernel()
                || !f.has_attr(FnAttr::AlwaysInline)
                || referenced.contains(&f.name)
                || aux.contains(&f.name)
        });
        if m.functions.len() != before {
            m.remove_unused_declarations();
            changed = true;
        }
        changed
    }
}

pub struct Inline;

impl Pass for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        inline_where(m, |_, callee| {
            !callee.is_kernel()
                && !callee.has_attr(FnAttr::NoInline)
                && callee.instruction_count() <= INLINE_THRESHOLD
        })
    }
}
