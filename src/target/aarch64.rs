//! AArch64 instruction selection.

use super::{Arch, ArchLowering, TargetMachine};
use crate::ir::{BinOp, CastKind, Inst, Module, Op, Terminator};

pub struct Aarch64Lowering;

impl ArchLowering for Aarch64Lowering {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn elf_machine(&self) -> Option<u16> {
        Some(183)
    }

    fn file_header(&self, _machine: &TargetMachine, module: &Module) -> Vec<String> {
        vec![format!("\t.file\t\"{}\"", module.name)]
    }

    fn mnemonic(&self, inst: &Inst) -> &'static str {
        match &inst.op {
            Op::Alloca { .. } => "sub",
            Op::Load { .. } => "ldr",
            Op::Store { .. } => "str",
            Op::Binary { op, .. } => match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "mul",
                BinOp::SDiv => "sdiv",
                BinOp::UDiv => "udiv",
                BinOp::SRem | BinOp::URem => "msub",
                BinOp::And => "and",
                BinOp::Or => "orr",
                BinOp::Xor => "eor",
                BinOp::Shl => "lsl",
                BinOp::LShr => "lsr",
                BinOp::AShr => "asr",
                BinOp::FAdd => "fadd",
                BinOp::FSub => "fsub",
                BinOp::FMul => "fmul",
                BinOp::FDiv => "fdiv",
            },
            Op::Cmp { pred, .. } => {
                if pred.is_float() {
                    "fcmp"
                } else {
                    "cmp"
                }
            }
            Op::Select { .. } => "csel",
            Op::Gep { .. } => "add",
            Op::Cast { kind, .. } => match kind {
                CastKind::ZExt => "uxtw",
                CastKind::SExt => "sxtw",
                CastKind::SIToFP => "scvtf",
                CastKind::FPToSI => "fcvtzs",
                _ => "mov",
            },
            Op::Call { .. } => "bl",
            Op::Phi { .. } => "mov",
        }
    }

    fn terminator_mnemonic(&self, term: &Terminator) -> &'static str {
        match term {
            Terminator::Br(_) => "b",
            Terminator::CondBr { .. } => "cbnz",
            Terminator::Ret(_) => "ret",
            Terminator::Unreachable => "brk",
        }
    }

    fn comment(&self) -> &'static str {
        "//"
    }

    fn symbol_type(&self) -> &'static str {
        "%function"
    }

    fn vector_bits(&self, machine: &TargetMachine) -> u32 {
        if machine.has_feature("neon") {
            128
        } else {
            0
        }
    }
}
