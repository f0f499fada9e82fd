//! Barrier normalization ahead of region formation.
//!
//! After this family runs, every kernel starts and ends with a barrier,
//! every barrier sits alone in a block that falls through to a single
//! successor, and loops containing barriers are bracketed by barriers on
//! their preheader and latch. The work-item loop passes rely on all of it.

use super::cleanup::rename_phi_incoming;
use super::{for_each_defined, for_each_kernel, AnalysisKind, Pass, PassContext};
use crate::ir::cfg::{preheader, Cfg};
use crate::ir::{
    block_has_barrier, builtins, function_has_barrier, is_barrier_inst, Block, Function, Inst,
    Module, NameGen, Op, Terminator, Type, Value, ValueKind,
};

const PRESERVES_UNIFORMITY: &[AnalysisKind] = &[AnalysisKind::Uniformity];

fn barrier_call() -> Inst {
    Inst::call(None, Type::Void, builtins::IMPLICIT_BARRIER, Vec::new())
}

fn declare_barrier(m: &mut Module) {
    m.declare(builtins::IMPLICIT_BARRIER, Type::Void, Vec::new());
}

fn ends_with_barrier(b: &Block) -> bool {
    b.insts.last().is_some_and(is_barrier_inst)
}

/// Move `insts[at..]` and the terminator of block `bi` into a new block
/// `label` placed right after it. Returns the new block's index.
pub(crate) fn split_block(f: &mut Function, bi: usize, at: usize, label: String) -> usize {
    let old_label = f.blocks[bi].label.clone();
    let insts = f.blocks[bi].insts.split_off(at);
    let term = std::mem::replace(&mut f.blocks[bi].term, Terminator::Br(label.clone()));
    let succs: Vec<String> = term.successors().iter().map(|s| s.to_string()).collect();
    f.blocks.insert(
        bi + 1,
        Block {
            label: label.clone(),
            insts,
            term,
        },
    );
    for s in succs {
        rename_phi_incoming(f, &s, &old_label, &label);
    }
    bi + 1
}

// ─── loop-simplify ────────────────────────────────────────────────

/// Gives every loop a dedicated preheader and a single latch.
pub struct LoopSimplify;

impl LoopSimplify {
    /// Route the edges `from -> target` through a new block `label` at
    /// `pos`, merging the target's phi entries for those edges there.
    fn insert_forwarder(
        f: &mut Function,
        names: &mut NameGen,
        target: &str,
        from: &[String],
        label: &str,
        pos: usize,
    ) {
        let mut block = Block::new(label, Terminator::Br(target.to_string()));
        if let Some(ti) = f.block_index(target) {
            for inst in f.blocks[ti].insts.iter_mut() {
                let (Op::Phi { ty, incoming }, Some(r)) = (&mut inst.op, &inst.result) else {
                    continue;
                };
                let (moved, mut kept): (Vec<_>, Vec<_>) = std::mem::take(incoming)
                    .into_iter()
                    .partition(|(_, pred)| from.contains(pred));
                let value = match moved.as_slice() {
                    [] => {
                        *incoming = kept;
                        continue;
                    }
                    [(v, _)] => v.clone(),
                    [(first, _), rest @ ..] if rest.iter().all(|(v, _)| v == first) => first.clone(),
                    _ => {
                        let name = names.fresh(&format!("{}.{}", r, label));
                        block.insts.push(Inst::new(
                            name.clone(),
                            Op::Phi {
                                ty: *ty,
                                incoming: moved,
                            },
                        ));
                        Value::local(*ty, name)
                    }
                };
                kept.push((value, label.to_string()));
                *incoming = kept;
            }
        }
        for p in from {
            if let Some(b) = f.block_mut(p) {
                b.term.replace_successor(target, label);
            }
        }
        f.blocks.insert(pos, block);
    }

    fn simplify_one(f: &mut Function) -> bool {
        let cfg = Cfg::new(f);
        let dom = cfg.dominators();
        let mut names = NameGen::for_function(f);
        for lp in cfg.natural_loops(&dom) {
            let Some(hi) = f.block_index(&lp.header) else {
                continue;
            };
            if hi == 0 {
                continue;
            }
            if preheader(f, &cfg, &lp).is_none() {
                let outside = cfg.outside_preds(&lp);
                if outside.is_empty() {
                    continue;
                }
                let label = names.fresh(&format!("{}.preheader", lp.header));
                Self::insert_forwarder(f, &mut names, &lp.header, &outside, &label, hi);
                return true;
            }
            if lp.latches.len() > 1 {
                let label = names.fresh(&format!("{}.latch", lp.header));
                let pos = lp
                    .latches
                    .iter()
                    .filter_map(|l| f.block_index(l))
                    .max()
                    .map_or(f.blocks.len(), |i| i + 1);
                Self::insert_forwarder(f, &mut names, &lp.header, &lp.latches, &label, pos);
                return true;
            }
        }
        false
    }
}

impl Pass for LoopSimplify {
    fn name(&self) -> &'static str {
        "loop-simplify"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_defined(m, |f| {
            let mut changed = false;
            while Self::simplify_one(f) {
                changed = true;
            }
            changed
        })
    }
}

// ─── phistoallocas ────────────────────────────────────────────────

/// Replaces each phi of a kernel by a stack slot: predecessors store the
/// incoming value, the phi becomes a load of the same name.
pub struct PhisToAllocas;

impl Pass for PhisToAllocas {
    fn name(&self) -> &'static str {
        "phistoallocas"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_kernel(m, |f| {
            let mut names = NameGen::for_function(f);
            let mut slots = Vec::new();
            let mut stores: Vec<(String, Inst)> = Vec::new();
            for b in f.blocks.iter_mut() {
                for inst in b.insts.iter_mut() {
                    let (Op::Phi { ty, incoming }, Some(r)) = (&inst.op, &inst.result) else {
                        continue;
                    };
                    let slot = names.fresh(&format!("{}.slot", r));
                    slots.push(Inst::new(slot.clone(), Op::Alloca { ty: *ty, count: 1 }));
                    let ptr = Value::local(Type::Ptr(crate::ir::addrspace::PRIVATE), slot);
                    for (v, pred) in incoming {
                        if v.kind == ValueKind::Undef {
                            continue;
                        }
                        stores.push((
                            pred.clone(),
                            Inst::void(Op::Store {
                                value: v.clone(),
                                ptr: ptr.clone(),
                            }),
                        ));
                    }
                    inst.op = Op::Load { ty: *ty, ptr };
                }
            }
            if slots.is_empty() {
                return false;
            }
            for (pred, store) in stores {
                if let Some(b) = f.block_mut(&pred) {
                    b.insts.push(store);
                }
            }
            f.blocks[0].insts.splice(0..0, slots);
            true
        })
    }
}

// ─── isolate-regions ──────────────────────────────────────────────

/// Splits blocks so every barrier is alone in a non-entry block that
/// branches unconditionally to its successor.
pub struct IsolateRegions;

impl IsolateRegions {
    fn isolate_one(f: &mut Function, names: &mut NameGen) -> bool {
        let found = f.blocks.iter().enumerate().find_map(|(bi, b)| {
            let ii = b.insts.iter().position(is_barrier_inst)?;
            let isolated = bi != 0 && b.insts.len() == 1 && matches!(b.term, Terminator::Br(_));
            (!isolated).then_some((bi, ii))
        });
        let Some((mut bi, ii)) = found else {
            return false;
        };
        if ii > 0 || bi == 0 {
            let label = names.fresh(&format!("{}.barrier", f.blocks[bi].label));
            bi = split_block(f, bi, ii, label);
        }
        let block = &f.blocks[bi];
        if block.insts.len() > 1 || !matches!(block.term, Terminator::Br(_)) {
            let label = names.fresh(&format!("{}.tail", block.label));
            split_block(f, bi, 1, label);
        }
        true
    }
}

impl Pass for IsolateRegions {
    fn name(&self) -> &'static str {
        "isolate-regions"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_kernel(m, |f| {
            let mut names = NameGen::for_function(f);
            let mut changed = false;
            while Self::isolate_one(f, &mut names) {
                changed = true;
            }
            changed
        })
    }
}

// ─── implicit-loop-barriers ───────────────────────────────────────

/// Puts a barrier at the header of barrier-free loops whose trip count is
/// the same for every work-item, turning each iteration into a region.
pub struct ImplicitLoopBarriers;

impl Pass for ImplicitLoopBarriers {
    fn name(&self) -> &'static str {
        "implicit-loop-barriers"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let mut changed = false;
        for f in m
            .functions
            .iter_mut()
            .filter(|f| f.is_kernel() && !f.is_declaration() && function_has_barrier(f))
        {
            let uniformity = cx.analyses.uniformity(f);
            let cfg = Cfg::new(f);
            let dom = cfg.dominators();
            let mut headers = Vec::new();
            for lp in cfg.natural_loops(&dom) {
                let body: Vec<&Block> = f.blocks.iter().filter(|b| lp.contains(&b.label)).collect();
                if body.iter().any(|b| block_has_barrier(b)) {
                    continue;
                }
                let exits_uniform = body.iter().all(|b| {
                    b.term.successors().iter().all(|s| lp.contains(s))
                        || uniformity.is_uniform_branch(&b.term)
                });
                let mut reached_uniformly = true;
                let mut cur = cfg.idx(&lp.header).and_then(|h| dom.idom(h));
                while let Some(c) = cur {
                    if !uniformity.is_uniform_branch(&f.blocks[c].term) {
                        reached_uniformly = false;
                        break;
                    }
                    cur = dom.idom(c);
                }
                if exits_uniform && reached_uniformly {
                    headers.push(lp.header.clone());
                }
            }
            for h in headers {
                if let Some(b) = f.block_mut(&h) {
                    let at = b.first_non_phi();
                    b.insts.insert(at, barrier_call());
                    log::trace!("@{}: implicit barrier at loop header '{}'", f.name, h);
                    changed = true;
                }
            }
        }
        if changed {
            declare_barrier(m);
        }
        changed
    }
}

// ─── implicit-cond-barriers ───────────────────────────────────────

/// A barrier under a condition gets a companion barrier at the start of the
/// branch arm leading to it, so the branch itself ends a region.
pub struct ImplicitCondBarriers;

impl ImplicitCondBarriers {
    fn arm_starts(f: &Function) -> Vec<String> {
        let cfg = Cfg::new(f);
        let dom = cfg.dominators();
        let pdom = cfg.post_dominators();
        let mut arms = Vec::new();
        for (bi, b) in f.blocks.iter().enumerate() {
            if !block_has_barrier(b) {
                continue;
            }
            let mut below = bi;
            let mut cur = dom.idom(bi);
            while let Some(c) = cur {
                let conditional = matches!(f.blocks[c].term, Terminator::CondBr { .. });
                if conditional && !pdom.dominates(bi, c) {
                    if below != bi {
                        arms.push(f.blocks[below].label.clone());
                    }
                    break;
                }
                below = c;
                cur = dom.idom(c);
            }
        }
        arms
    }
}

impl Pass for ImplicitCondBarriers {
    fn name(&self) -> &'static str {
        "implicit-cond-barriers"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let changed = for_each_kernel(m, |f| {
            let mut changed = false;
            for arm in Self::arm_starts(f) {
                let Some(b) = f.block_mut(&arm) else { continue };
                let at = b.first_non_phi();
                if b.insts.get(at).is_some_and(is_barrier_inst) {
                    continue;
                }
                b.insts.insert(at, barrier_call());
                changed = true;
            }
            changed
        });
        if changed {
            declare_barrier(m);
        }
        changed
    }
}

// ─── loop-barriers ────────────────────────────────────────────────

/// Loops with barriers get one at the end of the preheader and one at the
/// end of the latch, so each iteration starts a fresh region.
pub struct LoopBarriers;

impl Pass for LoopBarriers {
    fn name(&self) -> &'static str {
        "loop-barriers"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let changed = for_each_kernel(m, |f| {
            let cfg = Cfg::new(f);
            let dom = cfg.dominators();
            let mut ends = Vec::new();
            for lp in cfg.natural_loops(&dom) {
                let has_barrier = f
                    .blocks
                    .iter()
                    .any(|b| lp.contains(&b.label) && block_has_barrier(b));
                if !has_barrier {
                    continue;
                }
                ends.extend(preheader(f, &cfg, &lp));
                ends.extend(lp.latches.iter().cloned());
            }
            let mut changed = false;
            for label in ends {
                let Some(b) = f.block_mut(&label) else { continue };
                if !ends_with_barrier(b) {
                    b.insts.push(barrier_call());
                    changed = true;
                }
            }
            changed
        });
        if changed {
            declare_barrier(m);
        }
        changed
    }
}

// ─── barriertails ─────────────────────────────────────────────────

/// Collapses back-to-back barriers and gives each barrier-ending block a
/// successor of its own.
pub struct BarrierTails;

impl BarrierTails {
    fn collapse(f: &mut Function) -> bool {
        let mut changed = false;
        for b in f.blocks.iter_mut() {
            let before = b.insts.len();
            let mut previous_was_barrier = false;
            b.insts.retain(|i| {
                let is_barrier = is_barrier_inst(i);
                let keep = !(is_barrier && previous_was_barrier);
                previous_was_barrier = is_barrier;
                keep
            });
            changed |= b.insts.len() != before;
        }
        let preds = f.predecessors();
        let mut redundant = Vec::new();
        for (bi, b) in f.blocks.iter().enumerate() {
            if !b.insts.first().is_some_and(is_barrier_inst) {
                continue;
            }
            let Some([p]) = preds.get(&b.label).map(Vec::as_slice) else {
                continue;
            };
            let Some(pred) = f.block(p) else { continue };
            if matches!(&pred.term, Terminator::Br(t) if *t == b.label) && ends_with_barrier(pred) {
                redundant.push(bi);
            }
        }
        for bi in redundant {
            f.blocks[bi].insts.remove(0);
            changed = true;
        }
        changed
    }

    fn private_successors(f: &mut Function) -> bool {
        let preds = f.predecessors();
        let mut names = NameGen::for_function(f);
        let mut added = Vec::new();
        for (bi, b) in f.blocks.iter().enumerate() {
            let Terminator::Br(s) = &b.term else { continue };
            if !ends_with_barrier(b) || preds.get(s).map_or(0, Vec::len) < 2 {
                continue;
            }
            let label = names.fresh(&format!("{}.tail", b.label));
            added.push((bi, b.label.clone(), s.clone(), label));
        }
        let changed = !added.is_empty();
        for (bi, from, succ, label) in added.into_iter().rev() {
            f.blocks[bi].term = Terminator::Br(label.clone());
            rename_phi_incoming(f, &succ, &from, &label);
            f.blocks.insert(bi + 1, Block::new(label, Terminator::Br(succ)));
        }
        changed
    }
}

impl Pass for BarrierTails {
    fn name(&self) -> &'static str {
        "barriertails"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        for_each_kernel(m, |f| Self::collapse(f) | Self::private_successors(f))
    }
}

// ─── barriers ─────────────────────────────────────────────────────

/// Brackets each kernel with barriers at entry and before every return.
pub struct Barriers;

impl Pass for Barriers {
    fn name(&self) -> &'static str {
        "barriers"
    }

    fn preserves(&self) -> &'static [AnalysisKind] {
        PRESERVES_UNIFORMITY
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let changed = for_each_kernel(m, |f| {
            let mut changed = false;
            let entry = &mut f.blocks[0];
            let at = entry
                .insts
                .iter()
                .take_while(|i| matches!(i.op, Op::Alloca { .. }))
                .count();
            if !entry.insts.get(at).is_some_and(is_barrier_inst) {
                entry.insts.insert(at, barrier_call());
                changed = true;
            }
            for b in f.blocks.iter_mut() {
                if matches!(b.term, Terminator::Ret(_)) && !ends_with_barrier(b) {
                    b.insts.push(barrier_call());
                    changed = true;
                }
            }
            changed
        });
        if changed {
            declare_barrier(m);
        }
        changed
    }
}

// ─── remove-barriers ──────────────────────────────────────────────

/// Deletes barrier calls. Devices that synchronize in hardware keep the
/// barriers the program wrote and lose only the compiler's own.
pub struct RemoveBarriers {
    pub keep_explicit: bool,
}

impl Pass for RemoveBarriers {
    fn name(&self) -> &'static str {
        "remove-barriers"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let keep_explicit = self.keep_explicit;
        let changed = for_each_defined(m, |f| {
            let mut changed = false;
            for b in f.blocks.iter_mut() {
                let before = b.insts.len();
                b.insts.retain(|i| match i.callee() {
                    Some(c) if keep_explicit => c != builtins::IMPLICIT_BARRIER,
                    Some(c) => !builtins::is_barrier(c),
                    None => true,
                });
                changed |= b.insts.len() != before;
            }
            changed
        });
        if changed {
            m.remove_unused_declarations();
        }
        changed
    }
}
