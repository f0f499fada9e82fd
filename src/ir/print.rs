//! Text serialization of the IR.
//!
//! Output is deterministic: metadata is sorted by key, globals and
//! functions keep module order, floats are printed as raw bit patterns.

use std::fmt;

use super::*;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F32 => write!(f, "float"),
            Type::F64 => write!(f, "double"),
            Type::Ptr(0) => write!(f, "ptr"),
            Type::Ptr(n) => write!(f, "ptr addrspace({})", n),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Local(n) => write!(f, "%{}", n),
            ValueKind::Global(n) => write!(f, "@{}", n),
            ValueKind::Int(v) => write!(f, "{}", v),
            ValueKind::Float(v) => write!(f, "0x{:016X}", v.to_bits()),
            ValueKind::Null => write!(f, "null"),
            ValueKind::Undef => write!(f, "undef"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ty, self.kind)
    }
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::SDiv => "sdiv",
            BinOp::UDiv => "udiv",
            BinOp::SRem => "srem",
            BinOp::URem => "urem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
        }
    }

    pub const ALL: [BinOp; 17] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::SDiv,
        BinOp::UDiv,
        BinOp::SRem,
        BinOp::URem,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::LShr,
        BinOp::AShr,
        BinOp::FAdd,
        BinOp::FSub,
        BinOp::FMul,
        BinOp::FDiv,
    ];
}

impl CmpPred {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
            CmpPred::Sgt => "sgt",
            CmpPred::Sge => "sge",
            CmpPred::Ult => "ult",
            CmpPred::Ule => "ule",
            CmpPred::Ugt => "ugt",
            CmpPred::Uge => "uge",
            CmpPred::Oeq => "oeq",
            CmpPred::One => "one",
            CmpPred::Olt => "olt",
            CmpPred::Ole => "ole",
            CmpPred::Ogt => "ogt",
            CmpPred::Oge => "oge",
        }
    }

    pub const ALL: [CmpPred; 16] = [
        CmpPred::Eq,
        CmpPred::Ne,
        CmpPred::Slt,
        CmpPred::Sle,
        CmpPred::Sgt,
        CmpPred::Sge,
        CmpPred::Ult,
        CmpPred::Ule,
        CmpPred::Ugt,
        CmpPred::Uge,
        CmpPred::Oeq,
        CmpPred::One,
        CmpPred::Olt,
        CmpPred::Ole,
        CmpPred::Ogt,
        CmpPred::Oge,
    ];
}

impl CastKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CastKind::ZExt => "zext",
            CastKind::SExt => "sext",
            CastKind::Trunc => "trunc",
            CastKind::Bitcast => "bitcast",
            CastKind::AddrSpaceCast => "addrspacecast",
            CastKind::PtrToInt => "ptrtoint",
            CastKind::IntToPtr => "inttoptr",
            CastKind::SIToFP => "sitofp",
            CastKind::FPToSI => "fptosi",
        }
    }

    pub const ALL: [CastKind; 9] = [
        CastKind::ZExt,
        CastKind::SExt,
        CastKind::Trunc,
        CastKind::Bitcast,
        CastKind::AddrSpaceCast,
        CastKind::PtrToInt,
        CastKind::IntToPtr,
        CastKind::SIToFP,
        CastKind::FPToSI,
    ];
}

impl FnAttr {
    pub fn keyword(self) -> &'static str {
        match self {
            FnAttr::Kernel => "kernel",
            FnAttr::AlwaysInline => "alwaysinline",
            FnAttr::NoInline => "noinline",
            FnAttr::OptNone => "optnone",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Alloca { ty, count } => write!(f, "alloca {}, {}", ty, count),
            Op::Load { ty, ptr } => write!(f, "load {}, {}", ty, ptr),
            Op::Store { value, ptr } => write!(f, "store {}, {}", value, ptr),
            Op::Binary { op, lhs, rhs } => write!(f, "{} {}, {}", op.mnemonic(), lhs, rhs),
            Op::Cmp { pred, lhs, rhs } => {
                let kw = if pred.is_float() { "fcmp" } else { "icmp" };
                write!(f, "{} {} {}, {}", kw, pred.mnemonic(), lhs, rhs)
            }
            Op::Select {
                cond,
                then_value,
                else_value,
            } => write!(f, "select {}, {}, {}", cond, then_value, else_value),
            Op::Gep { elem, base, index } => write!(f, "gep {}, {}, {}", elem, base, index),
            Op::Cast { kind, value, to } => write!(f, "{} {} to {}", kind.mnemonic(), value, to),
            Op::Call { ret, callee, args } => {
                write!(f, "call {} @{}(", ret, callee)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Op::Phi { ty, incoming } => {
                write!(f, "phi {} ", ty)?;
                for (i, (v, bb)) in incoming.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{}, %{}]", v, bb)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Some(r) => write!(f, "%{} = {}", r, self.op),
            None => write!(f, "{}", self.op),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Br(t) => write!(f, "br label %{}", t),
            Terminator::CondBr {
                cond,
                then_bb,
                else_bb,
            } => write!(f, "br {}, label %{}, label %{}", cond, then_bb, else_bb),
            Terminator::Ret(None) => write!(f, "ret void"),
            Terminator::Ret(Some(v)) => write!(f, "ret {}", v),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for inst in &self.insts {
            writeln!(f, "  {}", inst)?;
        }
        writeln!(f, "  {}", self.term)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.is_declaration() {
            "declare"
        } else {
            "define"
        };
        write!(f, "{} {} @{}(", keyword, self.ret, self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if p.name.is_empty() {
                write!(f, "{}", p.ty)?;
            } else {
                write!(f, "{} %{}", p.ty, p.name)?;
            }
        }
        write!(f, ")")?;
        for attr in &self.attrs {
            write!(f, " {}", attr.keyword())?;
        }
        for (k, v) in &self.annotations {
            write!(f, " \"{}\"=\"{}\"", escape(k), escape(v))?;
        }
        if self.is_declaration() {
            return writeln!(f);
        }
        writeln!(f, " {{")?;
        for b in &self.blocks {
            write!(f, "{}", b)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{} = addrspace({}) {} {} x {} ",
            self.name,
            self.addr_space,
            if self.constant { "constant" } else { "global" },
            self.ty,
            self.count
        )?;
        match &self.init {
            Init::External => write!(f, "external"),
            Init::Zero => write!(f, "zeroinitializer"),
            Init::Values(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => write!(f, "\"{}\"", escape(s)),
            MetaValue::Int(v) => write!(f, "i64 {}", v),
            MetaValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "source_filename = \"{}\"", escape(&self.name))?;
        writeln!(f, "target datalayout = \"{}\"", escape(&self.data_layout))?;
        writeln!(f, "target triple = \"{}\"", escape(&self.triple))?;
        if !self.metadata.is_empty() {
            writeln!(f)?;
            for (k, v) in &self.metadata {
                writeln!(f, "!{} = {}", k, v)?;
            }
        }
        if !self.globals.is_empty() {
            writeln!(f)?;
            for g in &self.globals {
                writeln!(f, "{}", g)?;
            }
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
