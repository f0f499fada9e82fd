//! Vectorization planning over work-item loops.
//!
//! The portable IR has no vector types, so these passes decide widths and
//! record them as function annotations for the backend; the work-item loops
//! themselves stay scalar.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{Pass, PassContext};
use crate::ir::cfg::Cfg;
use crate::ir::{BinOp, Function, Module, Op};

/// Annotation prefix carrying the chosen width of a vectorized loop.
pub(crate) const WIDTH_PREFIX: &str = "vectorize.width.";

fn label_list(f: &Function, key: &str) -> Vec<String> {
    f.annotations
        .get(key)
        .map(|s| s.split(',').filter(|l| !l.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

/// Widest scalar touched by memory operations in `blocks`, in bits.
fn widest_access(f: &Function, blocks: &BTreeSet<String>) -> u32 {
    f.blocks
        .iter()
        .filter(|b| blocks.contains(&b.label))
        .flat_map(|b| b.insts.iter())
        .filter_map(|i| match &i.op {
            Op::Load { ty, .. } if !ty.is_ptr() => Some(ty.bit_width()),
            Op::Store { value, .. } if !value.ty.is_ptr() => Some(value.ty.bit_width()),
            _ => None,
        })
        .max()
        .unwrap_or(32)
}

pub struct LoopVectorize;

impl Pass for LoopVectorize {
    fn name(&self) -> &'static str {
        "loop-vectorize"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        let mut changed = false;
        for f in m.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let headers = label_list(f, "wi.loops");
            if headers.is_empty() {
                continue;
            }
            let parallel: HashSet<String> = label_list(f, "wi.parallel").into_iter().collect();
            let cfg = Cfg::new(f);
            let dom = cfg.dominators();
            let loops = cfg.natural_loops(&dom);
            for h in &headers {
                let Some(lp) = loops.iter().find(|l| l.header == *h) else {
                    continue;
                };
                if !parallel.contains(h) {
                    cx.remark(format!(
                        "@{}: loop '{}' not vectorized: stores may overlap between work-items",
                        f.name, h
                    ));
                    continue;
                }
                let bits = widest_access(f, &lp.blocks);
                let lanes = cx.analyses.target.map(|t| t.lanes(bits)).unwrap_or(0);
                if lanes < 2 {
                    cx.remark(format!(
                        "@{}: loop '{}' not vectorized: no vector unit for {}-bit lanes",
                        f.name, h, bits
                    ));
                    continue;
                }
                let key = format!("{}{}", WIDTH_PREFIX, h);
                let width = lanes.to_string();
                if f.annotations.insert(key, width.clone()) != Some(width) {
                    changed = true;
                }
                cx.remark(format!("@{}: vectorized loop '{}' (width {})", f.name, h, lanes));
            }
        }
        changed
    }
}

/// Counts groups of independent, isomorphic float operations that could be
/// packed together.
pub struct SlpVectorizer;

impl SlpVectorizer {
    fn groups(f: &Function) -> usize {
        let mut total = 0;
        for b in &f.blocks {
            let mut by_op: BTreeMap<(String, String), Vec<&str>> = BTreeMap::new();
            for inst in &b.insts {
                let (Op::Binary { op, lhs, .. }, Some(r)) = (&inst.op, &inst.result) else {
                    continue;
                };
                if !matches!(op, BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv) {
                    continue;
                }
                let members = by_op
                    .entry((op.mnemonic().to_string(), lhs.ty.to_string()))
                    .or_default();
                let depends = inst
                    .operands()
                    .iter()
                    .any(|v| v.as_local().is_some_and(|n| members.contains(&n)));
                if !depends {
                    members.push(r.as_str());
                }
            }
            total += by_op.values().filter(|m| m.len() >= 2).count();
        }
        total
    }
}

impl Pass for SlpVectorizer {
    fn name(&self) -> &'static str {
        "slp-vectorizer"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        if cx.analyses.target.map(|t| t.lanes(32)).unwrap_or(0) < 2 {
            return false;
        }
        let mut changed = false;
        for f in m.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let groups = Self::groups(f);
            if groups == 0 {
                continue;
            }
            let value = groups.to_string();
            if f.annotations.insert("slp.groups".to_string(), value.clone()) != Some(value) {
                changed = true;
                cx.remark(format!("@{}: {} SLP group(s)", f.name, groups));
            }
        }
        changed
    }
}
