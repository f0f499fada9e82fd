//! Assembly listing shared by all architectures.
//!
//! Each IR instruction becomes one line: the architecture's mnemonic
//! followed by the operands in IR naming. Branches refer to function-local
//! `.L` labels.

use std::fmt::Write as _;

use super::{ArchLowering, TargetMachine};
use crate::ir::{Function, Inst, Module, Op, Terminator, Value, ValueKind};

fn operand(v: &Value) -> String {
    match &v.kind {
        ValueKind::Local(n) => format!("%{}", n),
        ValueKind::Global(n) => n.clone(),
        other => other.to_string(),
    }
}

fn local_label(func: &str, block: &str) -> String {
    format!(".L{}_{}", func, block)
}

fn inst_line(lowering: &dyn ArchLowering, inst: &Inst) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(r) = &inst.result {
        parts.push(format!("%{}", r));
    }
    match &inst.op {
        Op::Alloca { ty, count } => parts.push(format!("{}", ty.size_bytes() * count)),
        Op::Call { callee, args, .. } => {
            parts.push(callee.clone());
            parts.extend(args.iter().map(operand));
        }
        Op::Gep { elem, base, index } => {
            parts.push(operand(base));
            parts.push(operand(index));
            parts.push(format!("{}", elem.size_bytes()));
        }
        _ => parts.extend(inst.operands().into_iter().map(operand)),
    }
    format!("\t{}\t{}", lowering.mnemonic(inst), parts.join(", "))
}

fn terminator_lines(lowering: &dyn ArchLowering, func: &str, term: &Terminator) -> Vec<String> {
    let mn = lowering.terminator_mnemonic(term);
    match term {
        Terminator::Br(t) => vec![format!("\t{}\t{}", mn, local_label(func, t))],
        Terminator::CondBr {
            cond,
            then_bb,
            else_bb,
        } => {
            let jump = lowering.terminator_mnemonic(&Terminator::Br(String::new()));
            vec![
                format!("\t{}\t{}, {}", mn, operand(cond), local_label(func, then_bb)),
                format!("\t{}\t{}", jump, local_label(func, else_bb)),
            ]
        }
        Terminator::Ret(Some(v)) => vec![format!("\t{}\t{}", mn, operand(v))],
        Terminator::Ret(None) | Terminator::Unreachable => vec![format!("\t{}", mn)],
    }
}

/// Instruction lines of one function, labels included.
pub(super) fn body_lines(lowering: &dyn ArchLowering, f: &Function) -> Vec<String> {
    let mut lines = Vec::new();
    for (key, value) in &f.annotations {
        if let Some(header) = key.strip_prefix("vectorize.width.") {
            lines.push(format!(
                "\t{} loop {} vectorized x{}",
                lowering.comment(),
                header,
                value
            ));
        }
    }
    for b in &f.blocks {
        lines.push(format!("{}:", local_label(&f.name, &b.label)));
        for inst in &b.insts {
            lines.push(inst_line(lowering, inst));
        }
        lines.extend(terminator_lines(lowering, &f.name, &b.term));
    }
    lines
}

/// Full listing of a module.
pub(super) fn listing(lowering: &dyn ArchLowering, machine: &TargetMachine, module: &Module) -> String {
    let mut out = String::new();
    for line in lowering.file_header(machine, module) {
        let _ = writeln!(out, "{}", line);
    }
    let _ = writeln!(out, "\t.text");
    for f in module.functions.iter().filter(|f| !f.is_declaration()) {
        let _ = writeln!(out, "\t.globl\t{}", f.name);
        let _ = writeln!(out, "\t.p2align\t4");
        let _ = writeln!(out, "\t.type\t{},{}", f.name, lowering.symbol_type());
        let _ = writeln!(out, "{}:", f.name);
        for line in body_lines(lowering, f) {
            let _ = writeln!(out, "{}", line);
        }
        let _ = writeln!(out, ".Lfunc_end_{}:", f.name);
        let _ = writeln!(out, "\t.size\t{}, .Lfunc_end_{}-{}", f.name, f.name, f.name);
    }
    out
}

/// Encoded body of every defined function, in module order. The code
/// section carries the lowered instruction stream, one line per
/// instruction, NUL-terminated.
pub(super) fn function_bodies(lowering: &dyn ArchLowering, module: &Module) -> Vec<(String, Vec<u8>)> {
    module
        .functions
        .iter()
        .filter(|f| !f.is_declaration())
        .map(|f| {
            let mut bytes = body_lines(lowering, f).join("\n").into_bytes();
            bytes.push(0);
            (f.name.clone(), bytes)
        })
        .collect()
}
