//! RISC-V (RV64) instruction selection. Assembly only: objects come from
//! the external assembler.

use super::{Arch, ArchLowering, TargetMachine};
use crate::config::FloatAbi;
use crate::ir::{BinOp, CastKind, Inst, Module, Op, Terminator, Type};

pub struct RiscVLowering;

/// Module metadata key that suppresses `.attribute` directives.
pub const NO_ATTRIBUTES_KEY: &str = "riscv_no_attributes";

impl RiscVLowering {
    fn arch_string(machine: &TargetMachine) -> String {
        let mut arch = "rv64i".to_string();
        for ext in ["m", "a", "f", "d", "c", "v"] {
            if machine.has_feature(ext) {
                arch.push_str(ext);
            }
        }
        arch
    }
}

impl ArchLowering for RiscVLowering {
    fn arch(&self) -> Arch {
        Arch::RiscV64
    }

    fn elf_machine(&self) -> Option<u16> {
        None
    }

    fn file_header(&self, machine: &TargetMachine, module: &Module) -> Vec<String> {
        let mut lines = vec![format!("\t.file\t\"{}\"", module.name)];
        let abi = match machine.float_abi {
            FloatAbi::Soft => "lp64",
            FloatAbi::Hard => "lp64f",
        };
        lines.push(format!("\t# abi {}", abi));
        if module.meta_bool(NO_ATTRIBUTES_KEY) != Some(true) {
            lines.push(format!(
                "\t.attribute\tarch, \"{}\"",
                Self::arch_string(machine)
            ));
        }
        lines
    }

    fn mnemonic(&self, inst: &Inst) -> &'static str {
        match &inst.op {
            Op::Alloca { .. } => "addi",
            Op::Load { ty, .. } => match ty {
                Type::F32 => "flw",
                Type::F64 => "fld",
                Type::I64 | Type::Ptr(_) => "ld",
                _ => "lw",
            },
            Op::Store { value, .. } => match value.ty {
                Type::F32 => "fsw",
                Type::F64 => "fsd",
                Type::I64 | Type::Ptr(_) => "sd",
                _ => "sw",
            },
            Op::Binary { op, .. } => match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "mul",
                BinOp::SDiv => "div",
                BinOp::UDiv => "divu",
                BinOp::SRem => "rem",
                BinOp::URem => "remu",
                BinOp::And => "and",
                BinOp::Or => "or",
                BinOp::Xor => "xor",
                BinOp::Shl => "sll",
                BinOp::LShr => "srl",
                BinOp::AShr => "sra",
                BinOp::FAdd => "fadd.s",
                BinOp::FSub => "fsub.s",
                BinOp::FMul => "fmul.s",
                BinOp::FDiv => "fdiv.s",
            },
            Op::Cmp { pred, .. } => {
                if pred.is_float() {
                    "flt.s"
                } else {
                    "slt"
                }
            }
            Op::Select { .. } => "czero",
            Op::Gep { .. } => "add",
            Op::Cast { kind, .. } => match kind {
                CastKind::SExt => "sext.w",
                CastKind::SIToFP => "fcvt.s.l",
                CastKind::FPToSI => "fcvt.l.s",
                _ => "mv",
            },
            Op::Call { .. } => "call",
            Op::Phi { .. } => "mv",
        }
    }

    fn terminator_mnemonic(&self, term: &Terminator) -> &'static str {
        match term {
            Terminator::Br(_) => "j",
            Terminator::CondBr { .. } => "bnez",
            Terminator::Ret(_) => "ret",
            Terminator::Unreachable => "unimp",
        }
    }

    fn vector_bits(&self, machine: &TargetMachine) -> u32 {
        if machine.has_feature("v") {
            128
        } else {
            0
        }
    }
}
