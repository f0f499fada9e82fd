//! Scalar cleanups: the members of the standard optimization set plus the
//! small structural passes run around the work-group transforms.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::{for_each_defined, Pass, PassContext};
use crate::ir::cfg::{preheader, Cfg};
use crate::ir::{
    verify_module, BinOp, CastKind, CmpPred, FnAttr, Function, Inst, Module, NameGen, Op,
    Terminator, Type, Value, ValueKind,
};

// ─── Shared helpers ───────────────────────────────────────────────

/// Whether removing `inst` (when its result is unused) is safe.
fn is_removable(inst: &Inst, pure_call: &dyn Fn(&str) -> bool) -> bool {
    match &inst.op {
        Op::Store { .. } => false,
        Op::Call { callee, .. } => inst.result.is_some() && pure_call(callee),
        _ => inst.result.is_some(),
    }
}

/// Use counts of every local in `f`.
fn use_counts(f: &Function) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for b in &f.blocks {
        let ops = b.insts.iter().flat_map(|i| i.operands()).chain(b.term.operands());
        for v in ops {
            if let Some(n) = v.as_local() {
                *counts.entry(n.to_string()).or_default() += 1;
            }
        }
    }
    counts
}

/// Drop phi entries coming from `pred` in block `label`.
pub(crate) fn drop_phi_incoming(f: &mut Function, label: &str, pred: &str) {
    if let Some(b) = f.block_mut(label) {
        for inst in b.insts.iter_mut() {
            if let Op::Phi { incoming, .. } = &mut inst.op {
                incoming.retain(|(_, p)| p != pred);
            }
        }
    }
}

/// Rename `from` to `to` in the phi entries of `label`.
pub(crate) fn rename_phi_incoming(f: &mut Function, label: &str, from: &str, to: &str) {
    if let Some(b) = f.block_mut(label) {
        for inst in b.insts.iter_mut() {
            if let Op::Phi { incoming, .. } = &mut inst.op {
                for (_, p) in incoming.iter_mut() {
                    if p == from {
                        *p = to.to_string();
                    }
                }
            }
        }
    }
}

/// Remove blocks not reachable from the entry.
pub(crate) fn remove_unreachable_blocks(f: &mut Function) -> bool {
    let cfg = Cfg::new(f);
    let reachable = cfg.reachable();
    if reachable.len() == f.blocks.len() {
        return false;
    }
    let dead: HashSet<String> = (0..cfg.len())
        .filter(|i| !reachable.contains(i))
        .map(|i| cfg.label(i).to_string())
        .collect();
    f.blocks.retain(|b| !dead.contains(&b.label));
    for b in f.blocks.iter_mut() {
        for inst in b.insts.iter_mut() {
            if let Op::Phi { incoming, .. } = &mut inst.op {
                incoming.retain(|(_, p)| !dead.contains(p));
            }
        }
    }
    true
}

// ─── remove-optnone ───────────────────────────────────────────────

pub struct RemoveOptNone;

impl Pass for RemoveOptNone {
    fn name(&self) -> &'static str {
        "remove-optnone"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let mut changed = false;
        for f in m.functions.iter_mut() {
            if f.attrs.remove(&FnAttr::OptNone) {
                f.attrs.remove(&FnAttr::NoInline);
                changed = true;
            }
        }
        changed
    }
}

// ─── instcombine ──────────────────────────────────────────────────

/// Sign-extend `v` from the width of `ty`.
fn wrap(ty: Type, v: i64) -> i64 {
    match ty {
        Type::I1 => v & 1,
        Type::I8 => v as i8 as i64,
        Type::I16 => v as i16 as i64,
        Type::I32 => v as i32 as i64,
        _ => v,
    }
}

/// Zero-extend `v` from the width of `ty`.
fn unsigned(ty: Type, v: i64) -> u64 {
    match ty.bit_width() {
        64 => v as u64,
        bits => (v as u64) & ((1u64 << bits) - 1),
    }
}

fn float_of(v: &Value) -> Option<f64> {
    match v.kind {
        ValueKind::Float(x) => Some(x),
        _ => None,
    }
}

fn fold_int_binary(op: BinOp, ty: Type, a: i64, b: i64) -> Option<i64> {
    let bits = ty.bit_width() as i64;
    let r = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::SDiv => a.checked_div(b)?,
        BinOp::SRem => a.checked_rem(b)?,
        BinOp::UDiv => unsigned(ty, a).checked_div(unsigned(ty, b))? as i64,
        BinOp::URem => unsigned(ty, a).checked_rem(unsigned(ty, b))? as i64,
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl if (0..bits).contains(&b) => a.wrapping_shl(b as u32),
        BinOp::LShr if (0..bits).contains(&b) => (unsigned(ty, a) >> b) as i64,
        BinOp::AShr if (0..bits).contains(&b) => a >> b,
        _ => return None,
    };
    Some(wrap(ty, r))
}

fn fold_float_binary(op: BinOp, ty: Type, a: f64, b: f64) -> Option<f64> {
    let r = match op {
        BinOp::FAdd => a + b,
        BinOp::FSub => a - b,
        BinOp::FMul => a * b,
        BinOp::FDiv => a / b,
        _ => return None,
    };
    Some(if ty == Type::F32 { r as f32 as f64 } else { r })
}

fn fold_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Option<Value> {
    let ty = lhs.ty;
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        return fold_int_binary(op, ty, a, b).map(|r| Value::int(ty, r));
    }
    if let (Some(a), Some(b)) = (float_of(lhs), float_of(rhs)) {
        return fold_float_binary(op, ty, a, b).map(|r| Value {
            ty,
            kind: ValueKind::Float(r),
        });
    }
    let (l, r) = (lhs.as_int(), rhs.as_int());
    match op {
        BinOp::Add | BinOp::Or | BinOp::Xor if r == Some(0) => Some(lhs.clone()),
        BinOp::Add | BinOp::Or | BinOp::Xor if l == Some(0) => Some(rhs.clone()),
        BinOp::Sub | BinOp::Shl | BinOp::LShr | BinOp::AShr if r == Some(0) => Some(lhs.clone()),
        BinOp::Mul | BinOp::SDiv | BinOp::UDiv if r == Some(1) => Some(lhs.clone()),
        BinOp::Mul if l == Some(1) => Some(rhs.clone()),
        BinOp::Mul | BinOp::And if r == Some(0) || l == Some(0) => Some(Value::int(ty, 0)),
        BinOp::Sub | BinOp::Xor if lhs.as_local().is_some() && lhs == rhs => {
            Some(Value::int(ty, 0))
        }
        _ => None,
    }
}

fn fold_cmp(pred: CmpPred, lhs: &Value, rhs: &Value) -> Option<Value> {
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        let (ua, ub) = (unsigned(lhs.ty, a), unsigned(lhs.ty, b));
        let r = match pred {
            CmpPred::Eq => a == b,
            CmpPred::Ne => a != b,
            CmpPred::Slt => a < b,
            CmpPred::Sle => a <= b,
            CmpPred::Sgt => a > b,
            CmpPred::Sge => a >= b,
            CmpPred::Ult => ua < ub,
            CmpPred::Ule => ua <= ub,
            CmpPred::Ugt => ua > ub,
            CmpPred::Uge => ua >= ub,
            _ => return None,
        };
        return Some(Value::bool(r));
    }
    if let (Some(a), Some(b)) = (float_of(lhs), float_of(rhs)) {
        let r = match pred {
            CmpPred::Oeq => a == b,
            CmpPred::One => a != b && !a.is_nan() && !b.is_nan(),
            CmpPred::Olt => a < b,
            CmpPred::Ole => a <= b,
            CmpPred::Ogt => a > b,
            CmpPred::Oge => a >= b,
            _ => return None,
        };
        return Some(Value::bool(r));
    }
    None
}

fn fold_cast(kind: CastKind, value: &Value, to: Type) -> Option<Value> {
    if value.ty == to && matches!(kind, CastKind::Bitcast | CastKind::AddrSpaceCast) {
        return Some(value.clone());
    }
    match (kind, &value.kind) {
        (CastKind::ZExt, ValueKind::Int(v)) => Some(Value::int(to, unsigned(value.ty, *v) as i64)),
        (CastKind::SExt, ValueKind::Int(v)) => Some(Value::int(to, wrap(value.ty, *v))),
        (CastKind::Trunc, ValueKind::Int(v)) => Some(Value::int(to, wrap(to, *v))),
        (CastKind::SIToFP, ValueKind::Int(v)) => {
            let x = *v as f64;
            Some(Value {
                ty: to,
                kind: ValueKind::Float(if to == Type::F32 { x as f32 as f64 } else { x }),
            })
        }
        (CastKind::FPToSI, ValueKind::Float(x)) if x.is_finite() => {
            Some(Value::int(to, wrap(to, x.trunc() as i64)))
        }
        _ => None,
    }
}

/// The value `op` computes, when it can be known without executing it.
pub(crate) fn fold(op: &Op) -> Option<Value> {
    match op {
        Op::Binary { op, lhs, rhs } => fold_binary(*op, lhs, rhs),
        Op::Cmp { pred, lhs, rhs } => fold_cmp(*pred, lhs, rhs),
        Op::Select {
            cond,
            then_value,
            else_value,
        } => match cond.as_int() {
            Some(0) => Some(else_value.clone()),
            Some(_) => Some(then_value.clone()),
            None if then_value == else_value => Some(then_value.clone()),
            None => None,
        },
        Op::Cast { kind, value, to } => fold_cast(*kind, value, *to),
        Op::Gep { base, index, .. } if index.as_int() == Some(0) => Some(base.clone()),
        Op::Phi { incoming, .. } => {
            let first = &incoming.first()?.0;
            incoming.iter().all(|(v, _)| v == first).then(|| first.clone())
        }
        _ => None,
    }
}

pub(crate) fn instcombine_function(f: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut found = None;
        'scan: for (bi, b) in f.blocks.iter().enumerate() {
            for (ii, inst) in b.insts.iter().enumerate() {
                let Some(r) = &inst.result else { continue };
                if let Some(v) = fold(&inst.op) {
                    if v.as_local() != Some(r) {
                        found = Some((bi, ii, r.clone(), v));
                        break 'scan;
                    }
                }
            }
        }
        let Some((bi, ii, r, v)) = found else { break };
        f.blocks[bi].insts.remove(ii);
        f.replace_all_uses(&r, &v);
        changed = true;
    }
    changed
}

pub struct InstCombine;

impl Pass for InstCombine {
    fn name(&self) -> &'static str {
        "instcombine"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, instcombine_function)
    }
}

// ─── early-cse ────────────────────────────────────────────────────

pub struct EarlyCse;

impl EarlyCse {
    fn is_candidate(op: &Op, pure_call: &dyn Fn(&str) -> bool) -> bool {
        match op {
            Op::Binary { .. } | Op::Cmp { .. } | Op::Select { .. } | Op::Gep { .. } | Op::Cast { .. } => {
                true
            }
            Op::Call { callee, .. } => pure_call(callee),
            _ => false,
        }
    }

    fn run_function(f: &mut Function, children: &[Vec<usize>], pure_call: &dyn Fn(&str) -> bool) -> bool {
        // Dominator-tree walk with a scoped table of available expressions.
        let mut subst: HashMap<String, Value> = HashMap::new();
        let mut stack: Vec<(usize, HashMap<String, Value>)> = vec![(0, HashMap::new())];
        while let Some((b, mut avail)) = stack.pop() {
            for inst in &f.blocks[b].insts {
                let Some(r) = &inst.result else { continue };
                if !Self::is_candidate(&inst.op, pure_call) {
                    continue;
                }
                let mut probe = Inst::void(inst.op.clone());
                for v in probe.operands_mut() {
                    if let Some(s) = v.as_local().and_then(|n| subst.get(n)) {
                        *v = s.clone();
                    }
                }
                let key = probe.op.to_string();
                match avail.get(&key) {
                    Some(existing) => {
                        subst.insert(r.clone(), existing.clone());
                    }
                    None => {
                        avail.insert(key, Value::local(inst.result_type(), r.clone()));
                    }
                }
            }
            for &c in &children[b] {
                stack.push((c, avail.clone()));
            }
        }
        if subst.is_empty() {
            return false;
        }
        for b in f.blocks.iter_mut() {
            b.insts
                .retain(|i| !i.result.as_ref().is_some_and(|r| subst.contains_key(r)));
        }
        for (r, v) in &subst {
            f.replace_all_uses(r, v);
        }
        true
    }
}

impl Pass for EarlyCse {
    fn name(&self) -> &'static str {
        "early-cse"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let mut changed = false;
        for f in m.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let children = {
                let dom = cx.analyses.dominators(f);
                let mut children = vec![Vec::new(); f.blocks.len()];
                for (i, _) in f.blocks.iter().enumerate().skip(1) {
                    if let Some(d) = dom.idom(i) {
                        children[d].push(i);
                    }
                }
                children
            };
            let analyses = &cx.analyses;
            changed |= Self::run_function(f, &children, &|c| analyses.is_pure_call(c));
        }
        changed
    }
}

// ─── dce ──────────────────────────────────────────────────────────

/// Remove dead instructions and allocas that are only ever stored to.
pub(crate) fn dce_function(f: &mut Function, pure_call: &dyn Fn(&str) -> bool) -> bool {
    let mut changed = false;
    loop {
        let counts = use_counts(f);
        let mut step = false;
        for b in f.blocks.iter_mut() {
            let before = b.insts.len();
            b.insts.retain(|i| match &i.result {
                Some(r) => counts.get(r).copied().unwrap_or(0) > 0 || !is_removable(i, pure_call),
                None => true,
            });
            step |= b.insts.len() != before;
        }

        // Allocas whose every use is the address of a store.
        let mut write_only: HashSet<String> = f
            .insts()
            .filter(|i| matches!(i.op, Op::Alloca { .. }))
            .filter_map(|i| i.result.clone())
            .collect();
        for b in &f.blocks {
            for inst in &b.insts {
                let used_as_address = match &inst.op {
                    Op::Store { value, .. } => vec![value],
                    _ => inst.operands(),
                };
                for v in used_as_address {
                    if let Some(n) = v.as_local() {
                        write_only.remove(n);
                    }
                }
            }
            for v in b.term.operands() {
                if let Some(n) = v.as_local() {
                    write_only.remove(n);
                }
            }
        }
        if !write_only.is_empty() {
            for b in f.blocks.iter_mut() {
                b.insts.retain(|i| match &i.op {
                    Op::Alloca { .. } => !i.result.as_ref().is_some_and(|r| write_only.contains(r)),
                    Op::Store { ptr, .. } => !ptr.as_local().is_some_and(|p| write_only.contains(p)),
                    _ => true,
                });
            }
            step = true;
        }

        if !step {
            break;
        }
        changed = true;
    }
    changed
}

pub struct Dce;

impl Pass for Dce {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let analyses = &cx.analyses;
        for_each_defined(m, |f| dce_function(f, &|c| analyses.is_pure_call(c)))
    }
}

// ─── simplifycfg ──────────────────────────────────────────────────

fn fold_constant_branches(f: &mut Function) -> bool {
    let mut changed = false;
    for i in 0..f.blocks.len() {
        let label = f.blocks[i].label.clone();
        let Terminator::CondBr {
            cond,
            then_bb,
            else_bb,
        } = f.blocks[i].term.clone()
        else {
            continue;
        };
        let (taken, dropped) = match cond.as_int() {
            Some(0) => (else_bb, Some(then_bb)),
            Some(_) => (then_bb, Some(else_bb)),
            None if then_bb == else_bb => (then_bb, None),
            None => continue,
        };
        if let Some(d) = dropped.filter(|d| *d != taken) {
            drop_phi_incoming(f, &d, &label);
        }
        f.blocks[i].term = Terminator::Br(taken);
        changed = true;
    }
    changed
}

fn merge_into_single_predecessor(f: &mut Function) -> bool {
    let preds = f.predecessors();
    let candidate = f.blocks.iter().enumerate().skip(1).find_map(|(i, b)| {
        let ps = preds.get(&b.label)?;
        if ps.len() != 1 || ps[0] == b.label {
            return None;
        }
        let p = f.block_index(&ps[0])?;
        matches!(&f.blocks[p].term, Terminator::Br(t) if *t == b.label).then_some((p, i))
    });
    let Some((p, i)) = candidate else {
        return false;
    };
    let block = f.blocks.remove(i);
    let p = if p > i { p - 1 } else { p };
    let pred_label = f.blocks[p].label.clone();
    let mut moved = Vec::with_capacity(block.insts.len());
    let mut phi_values = Vec::new();
    for inst in block.insts {
        match (&inst.op, &inst.result) {
            (Op::Phi { incoming, ty }, Some(r)) => {
                let v = incoming.first().map(|(v, _)| v.clone()).unwrap_or(Value {
                    ty: *ty,
                    kind: ValueKind::Undef,
                });
                phi_values.push((r.clone(), v));
            }
            _ => moved.push(inst),
        }
    }
    for s in block.term.successors() {
        rename_phi_incoming(f, s, &block.label, &pred_label);
    }
    f.blocks[p].insts.extend(moved);
    f.blocks[p].term = block.term;
    for (r, v) in phi_values {
        f.replace_all_uses(&r, &v);
    }
    true
}

fn skip_forwarding_blocks(f: &mut Function) -> bool {
    let preds = f.predecessors();
    let candidate = f.blocks.iter().skip(1).find_map(|b| {
        let Terminator::Br(t) = &b.term else {
            return None;
        };
        if !b.insts.is_empty() || *t == b.label {
            return None;
        }
        let target = f.block(t)?;
        if target.insts.iter().any(|i| i.is_phi()) {
            return None;
        }
        Some((b.label.clone(), t.clone()))
    });
    let Some((label, target)) = candidate else {
        return false;
    };
    let Some(ps) = preds.get(&label) else {
        return false;
    };
    if ps.is_empty() {
        return false;
    }
    for p in ps {
        if let Some(b) = f.block_mut(p) {
            b.term.replace_successor(&label, &target);
        }
    }
    true
}

pub(crate) fn simplify_cfg(f: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let step = fold_constant_branches(f)
            | remove_unreachable_blocks(f)
            | merge_into_single_predecessor(f)
            | skip_forwarding_blocks(f);
        if !step {
            break;
        }
        changed = true;
    }
    changed
}

pub struct SimplifyCfg;

impl Pass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "simplifycfg"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, simplify_cfg)
    }
}

// ─── mem2reg ──────────────────────────────────────────────────────

/// Allocas of one element whose only uses are loads and stores of the
/// allocated type through the pointer itself.
fn promotable_allocas(f: &Function) -> BTreeMap<String, Type> {
    let mut candidates: BTreeMap<String, Type> = f
        .insts()
        .filter_map(|i| match (&i.op, &i.result) {
            (Op::Alloca { ty, count: 1 }, Some(r)) => Some((r.clone(), *ty)),
            _ => None,
        })
        .collect();
    for b in &f.blocks {
        for inst in &b.insts {
            let bad: Vec<&Value> = match &inst.op {
                Op::Load { ty, ptr } => {
                    if let Some(p) = ptr.as_local() {
                        if candidates.get(p).is_some_and(|t| t != ty) {
                            candidates.remove(p);
                        }
                    }
                    Vec::new()
                }
                Op::Store { value, ptr } => {
                    if let Some(p) = ptr.as_local() {
                        if candidates.get(p).is_some_and(|t| *t != value.ty) {
                            candidates.remove(p);
                        }
                    }
                    vec![value]
                }
                _ => inst.operands(),
            };
            for v in bad {
                if let Some(n) = v.as_local() {
                    candidates.remove(n);
                }
            }
        }
        for v in b.term.operands() {
            if let Some(n) = v.as_local() {
                candidates.remove(n);
            }
        }
    }
    candidates
}

pub(crate) fn mem2reg_function(f: &mut Function) -> bool {
    remove_unreachable_blocks(f);
    let allocas = promotable_allocas(f);
    if allocas.is_empty() {
        return false;
    }
    let cfg = Cfg::new(f);
    let dom = cfg.dominators();
    let n = cfg.len();

    // Dominance frontiers.
    let mut frontier: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for b in 0..n {
        if cfg.preds[b].len() < 2 {
            continue;
        }
        let Some(idom) = dom.idom(b) else { continue };
        for &p in &cfg.preds[b] {
            let mut runner = Some(p);
            while let Some(r) = runner {
                if r == idom {
                    break;
                }
                frontier[r].insert(b);
                runner = dom.idom(r);
            }
        }
    }

    // Phi placement on the iterated frontier of each alloca's stores.
    let mut names = NameGen::for_function(f);
    let mut phis: BTreeMap<(usize, String), String> = BTreeMap::new();
    for (a, _) in &allocas {
        let mut work: Vec<usize> = (0..n)
            .filter(|&b| {
                f.blocks[b].insts.iter().any(|i| {
                    matches!(&i.op, Op::Store { ptr, .. } if ptr.as_local() == Some(a.as_str()))
                })
            })
            .collect();
        let mut placed: HashSet<usize> = HashSet::new();
        while let Some(b) = work.pop() {
            for &d in &frontier[b] {
                if placed.insert(d) {
                    phis.insert((d, a.clone()), names.fresh(&format!("{}.phi", a)));
                    work.push(d);
                }
            }
        }
    }

    let mut children = vec![Vec::new(); n];
    for b in 1..n {
        if let Some(d) = dom.idom(b) {
            children[d].push(b);
        }
    }

    // Rename along the dominator tree.
    let mut replaced: HashMap<String, Value> = HashMap::new();
    let mut incoming: BTreeMap<(usize, String), Vec<(Value, String)>> = BTreeMap::new();
    let undef = |ty: Type| Value {
        ty,
        kind: ValueKind::Undef,
    };
    let initial: HashMap<String, Value> = allocas.iter().map(|(a, ty)| (a.clone(), undef(*ty))).collect();
    let mut stack = vec![(0usize, initial)];
    while let Some((b, mut current)) = stack.pop() {
        for (a, ty) in &allocas {
            if let Some(phi) = phis.get(&(b, a.clone())) {
                current.insert(a.clone(), Value::local(*ty, phi.clone()));
            }
        }
        for inst in &f.blocks[b].insts {
            match &inst.op {
                Op::Load { ptr, .. } => {
                    if let (Some(p), Some(r)) = (ptr.as_local(), &inst.result) {
                        if let Some(v) = current.get(p) {
                            replaced.insert(r.clone(), v.clone());
                        }
                    }
                }
                Op::Store { value, ptr } => {
                    if let Some(p) = ptr.as_local().filter(|p| allocas.contains_key(*p)) {
                        let mut v = value.clone();
                        while let Some(next) = v.as_local().and_then(|n| replaced.get(n)) {
                            v = next.clone();
                        }
                        current.insert(p.to_string(), v);
                    }
                }
                _ => {}
            }
        }
        for &s in &cfg.succs[b] {
            for (a, _) in &allocas {
                if phis.contains_key(&(s, a.clone())) {
                    let v = current.get(a).cloned().unwrap_or_else(|| undef(allocas[a]));
                    incoming
                        .entry((s, a.clone()))
                        .or_default()
                        .push((v, cfg.label(b).to_string()));
                }
            }
        }
        for &c in &children[b] {
            stack.push((c, current.clone()));
        }
    }

    // Rewrite.
    for b in f.blocks.iter_mut() {
        b.insts.retain(|i| match &i.op {
            Op::Alloca { .. } => !i.result.as_ref().is_some_and(|r| allocas.contains_key(r)),
            Op::Load { ptr, .. } | Op::Store { ptr, .. } => {
                !ptr.as_local().is_some_and(|p| allocas.contains_key(p))
            }
            _ => true,
        });
    }
    for ((b, a), name) in &phis {
        let entries = incoming.remove(&(*b, a.clone())).unwrap_or_default();
        f.blocks[*b].insts.insert(
            0,
            Inst::new(
                name.clone(),
                Op::Phi {
                    ty: allocas[a],
                    incoming: entries,
                },
            ),
        );
    }
    let resolve = |mut v: Value| {
        while let Some(next) = v.as_local().and_then(|n| replaced.get(n)) {
            v = next.clone();
        }
        v
    };
    let resolved: Vec<(String, Value)> = replaced
        .iter()
        .map(|(r, v)| (r.clone(), resolve(v.clone())))
        .collect();
    for (r, v) in resolved {
        f.replace_all_uses(&r, &v);
    }
    true
}

pub struct Mem2Reg;

impl Pass for Mem2Reg {
    fn name(&self) -> &'static str {
        "mem2reg"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, mem2reg_function)
    }
}

// ─── loop-deletion ────────────────────────────────────────────────

fn delete_one_dead_loop(f: &mut Function, pure_call: &dyn Fn(&str) -> bool) -> bool {
    let cfg = Cfg::new(f);
    let dom = cfg.dominators();
    for lp in cfg.natural_loops(&dom) {
        let Some(pre) = preheader(f, &cfg, &lp) else {
            continue;
        };
        let mut exits: BTreeSet<String> = BTreeSet::new();
        for l in &lp.blocks {
            if let Some(b) = f.block(l) {
                exits.extend(
                    b.term
                        .successors()
                        .into_iter()
                        .filter(|s| !lp.contains(s))
                        .map(String::from),
                );
            }
        }
        if exits.len() != 1 {
            continue;
        }
        let exit = exits.into_iter().next().unwrap_or_default();
        let Some(exit_block) = f.block(&exit) else {
            continue;
        };
        if exit_block.insts.iter().any(|i| i.is_phi()) {
            continue;
        }
        let body: Vec<_> = f.blocks.iter().filter(|b| lp.contains(&b.label)).collect();
        let side_effects = body.iter().flat_map(|b| b.insts.iter()).any(|i| match &i.op {
            Op::Store { .. } => true,
            Op::Call { callee, .. } => !pure_call(callee),
            _ => false,
        });
        if side_effects {
            continue;
        }
        let defined: HashSet<&str> = body
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter_map(|i| i.result.as_deref())
            .collect();
        let used_outside = f.blocks.iter().filter(|b| !lp.contains(&b.label)).any(|b| {
            b.insts
                .iter()
                .flat_map(|i| i.operands())
                .chain(b.term.operands())
                .any(|v| v.as_local().is_some_and(|n| defined.contains(n)))
        });
        if used_outside {
            continue;
        }
        if let Some(p) = f.block_mut(&pre) {
            p.term.replace_successor(&lp.header, &exit);
        }
        f.blocks.retain(|b| !lp.contains(&b.label));
        log::trace!("deleted dead loop '{}' in @{}", lp.header, f.name);
        return true;
    }
    false
}

pub struct LoopDeletion;

impl Pass for LoopDeletion {
    fn name(&self) -> &'static str {
        "loop-deletion"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let analyses = &cx.analyses;
        for_each_defined(m, |f| {
            let mut changed = false;
            while delete_one_dead_loop(f, &|c| analyses.is_pure_call(c)) {
                changed = true;
            }
            changed
        })
    }
}

// ─── allocastoentry ───────────────────────────────────────────────

pub struct AllocasToEntry;

impl Pass for AllocasToEntry {
    fn name(&self) -> &'static str {
        "allocastoentry"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            let mut moved = Vec::new();
            for b in f.blocks.iter_mut().skip(1) {
                let (allocas, rest): (Vec<Inst>, Vec<Inst>) = std::mem::take(&mut b.insts)
                    .into_iter()
                    .partition(|i| matches!(i.op, Op::Alloca { .. }));
                b.insts = rest;
                moved.extend(allocas);
            }
            if moved.is_empty() {
                return false;
            }
            let entry = &mut f.blocks[0];
            let at = entry
                .insts
                .iter()
                .take_while(|i| matches!(i.op, Op::Alloca { .. }))
                .count();
            entry.insts.splice(at..at, moved);
            true
        })
    }
}

// ─── verify ───────────────────────────────────────────────────────

pub struct Verify;

impl Pass for Verify {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn is_analysis(&self) -> bool {
        true
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let errors = verify_module(m);
        if !errors.is_empty() {
            log::debug!("verifier found {} problem(s) in '{}'", errors.len(), m.name);
            cx.verify_errors.extend(errors);
        }
        false
    }
}
