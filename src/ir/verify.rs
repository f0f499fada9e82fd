//! Structural IR verifier.
//!
//! Returns every problem found instead of stopping at the first one so a
//! build log can show the whole picture.

use std::collections::{HashMap, HashSet};

use super::cfg::Cfg;
use super::{Function, Module, Op, Type};

/// Verify a module. An empty result means the module is well formed.
pub fn verify_module(m: &Module) -> Vec<String> {
    let mut errors = Vec::new();

    let mut symbols: HashSet<&str> = HashSet::new();
    for g in &m.globals {
        if !symbols.insert(&g.name) {
            errors.push(format!("duplicate symbol '@{}'", g.name));
        }
        for r in g.init_references() {
            if !m.has_symbol(r) {
                errors.push(format!(
                    "initializer of '@{}' refers to undefined '@{}'",
                    g.name, r
                ));
            }
        }
    }
    for f in &m.functions {
        if !symbols.insert(&f.name) {
            errors.push(format!("duplicate symbol '@{}'", f.name));
        }
    }

    for f in &m.functions {
        if !f.is_declaration() {
            verify_function(m, f, &mut errors);
        }
    }
    errors
}

fn verify_function(m: &Module, f: &Function, errors: &mut Vec<String>) {
    let ctx = |msg: String| format!("in function '@{}': {}", f.name, msg);

    let mut labels: HashSet<&str> = HashSet::new();
    for b in &f.blocks {
        if !labels.insert(&b.label) {
            errors.push(ctx(format!("duplicate block label '{}'", b.label)));
        }
    }

    // Definition sites: params are (None), instructions are (block, index).
    let mut defs: HashMap<&str, Option<(usize, usize)>> = HashMap::new();
    for p in &f.params {
        if defs.insert(&p.name, None).is_some() {
            errors.push(ctx(format!("duplicate parameter '%{}'", p.name)));
        }
    }
    for (bi, b) in f.blocks.iter().enumerate() {
        for (ii, inst) in b.insts.iter().enumerate() {
            if let Some(r) = &inst.result {
                if defs.insert(r, Some((bi, ii))).is_some() {
                    errors.push(ctx(format!("value '%{}' defined more than once", r)));
                }
            }
        }
    }

    let cfg = Cfg::new(f);
    let dom = cfg.dominators();
    let preds = f.predecessors();

    if let Some(entry) = f.entry() {
        if preds.get(&entry.label).is_some_and(|p| !p.is_empty()) {
            errors.push(ctx("entry block has predecessors".to_string()));
        }
    }

    // A use at (block, index) must be dominated by its definition.
    let check_use = |name: &str, at_block: usize, at_index: usize, errors: &mut Vec<String>| {
        match defs.get(name) {
            None => errors.push(ctx(format!("use of undefined value '%{}'", name))),
            Some(None) => {}
            Some(Some((db, di))) => {
                let ok = if *db == at_block {
                    *di < at_index
                } else {
                    dom.dominates(*db, at_block)
                };
                if !ok {
                    errors.push(ctx(format!(
                        "value '%{}' does not dominate its use in '{}'",
                        name, f.blocks[at_block].label
                    )));
                }
            }
        }
    };

    for (bi, b) in f.blocks.iter().enumerate() {
        for s in b.term.successors() {
            if !labels.contains(s) {
                errors.push(ctx(format!(
                    "block '{}' branches to unknown label '{}'",
                    b.label, s
                )));
            }
        }

        let first_non_phi = b.first_non_phi();
        for (ii, inst) in b.insts.iter().enumerate() {
            if let Op::Phi { incoming, .. } = &inst.op {
                if ii >= first_non_phi {
                    errors.push(ctx(format!("phi not at the start of block '{}'", b.label)));
                }
                let block_preds = preds.get(&b.label).cloned().unwrap_or_default();
                for (v, from) in incoming {
                    if !block_preds.contains(from) {
                        errors.push(ctx(format!(
                            "phi in '{}' names '{}' which is not a predecessor",
                            b.label, from
                        )));
                        continue;
                    }
                    if let Some(name) = v.as_local() {
                        if let Some(pi) = cfg.idx(from) {
                            let end = f.blocks[pi].insts.len();
                            check_use(name, pi, end, errors);
                        }
                    }
                }
                for p in &block_preds {
                    if !incoming.iter().any(|(_, from)| from == p) {
                        errors.push(ctx(format!(
                            "phi in '{}' has no entry for predecessor '{}'",
                            b.label, p
                        )));
                    }
                }
                continue;
            }

            for v in inst.operands() {
                if let Some(name) = v.as_local() {
                    check_use(name, bi, ii, errors);
                }
                if let Some(g) = v.as_global() {
                    if !m.has_symbol(g) {
                        errors.push(ctx(format!("reference to undefined symbol '@{}'", g)));
                    }
                }
            }

            match &inst.op {
                Op::Call { callee, args, ret } => match m.function(callee) {
                    None => errors.push(ctx(format!("call to undefined function '@{}'", callee))),
                    Some(target) => {
                        if target.params.len() != args.len() {
                            errors.push(ctx(format!(
                                "call to '@{}' passes {} arguments, expected {}",
                                callee,
                                args.len(),
                                target.params.len()
                            )));
                        }
                        if target.ret != *ret {
                            errors.push(ctx(format!(
                                "call to '@{}' expects return type {}, callee returns {}",
                                callee, ret, target.ret
                            )));
                        }
                    }
                },
                Op::Load { ptr, .. } | Op::Store { ptr, .. } | Op::Gep { base: ptr, .. } => {
                    if !ptr.ty.is_ptr() {
                        errors.push(ctx(format!("memory operand {} is not a pointer", ptr)));
                    }
                }
                _ => {}
            }
        }

        for v in b.term.operands() {
            if let Some(name) = v.as_local() {
                check_use(name, bi, b.insts.len(), errors);
            }
        }
        if let super::Terminator::Ret(rv) = &b.term {
            let ty = rv.as_ref().map(|v| v.ty).unwrap_or(Type::Void);
            if ty != f.ret {
                errors.push(ctx(format!(
                    "block '{}' returns {} from a function returning {}",
                    b.label, ty, f.ret
                )));
            }
        }
    }
}
