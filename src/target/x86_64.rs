//! x86-64 instruction selection.

use super::{Arch, ArchLowering, TargetMachine};
use crate::ir::{BinOp, CastKind, Inst, Module, Op, Terminator};

pub struct X86_64Lowering;

/// CPUs with 256-bit AVX registers.
const AVX_CPUS: &[&str] = &["haswell", "skylake", "znver2", "znver3", "znver4", "native"];

impl ArchLowering for X86_64Lowering {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn elf_machine(&self) -> Option<u16> {
        Some(62)
    }

    fn file_header(&self, _machine: &TargetMachine, module: &Module) -> Vec<String> {
        vec![format!("\t.file\t\"{}\"", module.name)]
    }

    fn mnemonic(&self, inst: &Inst) -> &'static str {
        match &inst.op {
            Op::Alloca { .. } => "sub",
            Op::Load { .. } | Op::Store { .. } => "mov",
            Op::Binary { op, .. } => match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "imul",
                BinOp::SDiv | BinOp::SRem => "idiv",
                BinOp::UDiv | BinOp::URem => "div",
                BinOp::And => "and",
                BinOp::Or => "or",
                BinOp::Xor => "xor",
                BinOp::Shl => "shl",
                BinOp::LShr => "shr",
                BinOp::AShr => "sar",
                BinOp::FAdd => "addss",
                BinOp::FSub => "subss",
                BinOp::FMul => "mulss",
                BinOp::FDiv => "divss",
            },
            Op::Cmp { pred, .. } => {
                if pred.is_float() {
                    "ucomiss"
                } else {
                    "cmp"
                }
            }
            Op::Select { .. } => "cmov",
            Op::Gep { .. } => "lea",
            Op::Cast { kind, .. } => match kind {
                CastKind::ZExt => "movzx",
                CastKind::SExt => "movsx",
                CastKind::SIToFP => "cvtsi2ss",
                CastKind::FPToSI => "cvttss2si",
                _ => "mov",
            },
            Op::Call { .. } => "call",
            Op::Phi { .. } => "mov",
        }
    }

    fn terminator_mnemonic(&self, term: &Terminator) -> &'static str {
        match term {
            Terminator::Br(_) => "jmp",
            Terminator::CondBr { .. } => "jnz",
            Terminator::Ret(_) => "ret",
            Terminator::Unreachable => "ud2",
        }
    }

    fn vector_bits(&self, machine: &TargetMachine) -> u32 {
        if machine.has_feature("avx512f") {
            512
        } else if machine.has_feature("avx2") || AVX_CPUS.contains(&machine.cpu.as_str()) {
            256
        } else {
            128
        }
    }
}
