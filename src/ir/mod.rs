//! Portable kernel IR.
//!
//! A small SSA IR in the spirit of LLVM IR, carrying exactly what the
//! work-group compiler needs: typed values, basic blocks with explicit
//! terminators, address-spaced pointers, module-level named metadata and
//! function attributes. The textual form (see `print` and `parse`) is the
//! portable serialization passed between the program context, the
//! pipeline, external tools and the on-disk cache.

pub mod callgraph;
pub mod cfg;
pub mod lexer;
pub mod parse;
pub mod print;
pub mod verify;


use std::collections::{BTreeMap, BTreeSet, HashSet};

pub use parse::parse_module;
pub use verify::verify_module;

// ─── Address Spaces ───────────────────────────────────────────────

/// SPIR address-space numbering used by program IR.
pub mod addrspace {
    pub const PRIVATE: u32 = 0;
    pub const GLOBAL: u32 = 1;
    pub const CONSTANT: u32 = 2;
    pub const LOCAL: u32 = 3;
    pub const GENERIC: u32 = 4;
}

// ─── Types ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Opaque pointer into the given address space.
    Ptr(u32),
}

impl Type {
    pub fn is_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_ptr(self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    /// Storage size in bytes (pointers are 64-bit).
    pub fn size_bytes(self) -> u64 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 | Type::Ptr(_) => 8,
        }
    }

    pub fn bit_width(self) -> u32 {
        match self {
            Type::I1 => 1,
            other => (other.size_bytes() * 8) as u32,
        }
    }
}

// ─── Values ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    /// `%name`: a parameter or instruction result.
    Local(String),
    /// `@name`: a global variable or function address.
    Global(String),
    Int(i64),
    Float(f64),
    Null,
    Undef,
}

/// A typed operand.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    pub ty: Type,
    pub kind: ValueKind,
}

impl Value {
    pub fn local(ty: Type, name: impl Into<String>) -> Self {
        Self {
            ty,
            kind: ValueKind::Local(name.into()),
        }
    }

    pub fn global(ty: Type, name: impl Into<String>) -> Self {
        Self {
            ty,
            kind: ValueKind::Global(name.into()),
        }
    }

    pub fn int(ty: Type, v: i64) -> Self {
        Self {
            ty,
            kind: ValueKind::Int(v),
        }
    }

    pub fn i32(v: i64) -> Self {
        Self::int(Type::I32, v)
    }

    pub fn i64(v: i64) -> Self {
        Self::int(Type::I64, v)
    }

    pub fn bool(v: bool) -> Self {
        Self::int(Type::I1, v as i64)
    }

    pub fn as_local(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Local(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Global(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Int(_) | ValueKind::Float(_) | ValueKind::Null | ValueKind::Undef
        )
    }
}

// ─── Instructions ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
    /// Ordered float comparisons.
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
}

impl CmpPred {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            CmpPred::Oeq | CmpPred::One | CmpPred::Olt | CmpPred::Ole | CmpPred::Ogt | CmpPred::Oge
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CastKind {
    ZExt,
    SExt,
    Trunc,
    Bitcast,
    AddrSpaceCast,
    PtrToInt,
    IntToPtr,
    SIToFP,
    FPToSI,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Stack slot of `count` elements of `ty`; yields `ptr`.
    Alloca { ty: Type, count: u64 },
    Load { ty: Type, ptr: Value },
    Store { value: Value, ptr: Value },
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Cmp { pred: CmpPred, lhs: Value, rhs: Value },
    Select { cond: Value, then_value: Value, else_value: Value },
    /// Pointer arithmetic: `base + index * sizeof(elem)`.
    Gep { elem: Type, base: Value, index: Value },
    Cast { kind: CastKind, value: Value, to: Type },
    Call { ret: Type, callee: String, args: Vec<Value> },
    Phi { ty: Type, incoming: Vec<(Value, String)> },
}

/// One instruction, optionally naming its result.
#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    pub result: Option<String>,
    pub op: Op,
}

impl Inst {
    pub fn new(result: impl Into<String>, op: Op) -> Self {
        Self {
            result: Some(result.into()),
            op,
        }
    }

    pub fn void(op: Op) -> Self {
        Self { result: None, op }
    }

    pub fn call(result: Option<String>, ret: Type, callee: &str, args: Vec<Value>) -> Self {
        Self {
            result,
            op: Op::Call {
                ret,
                callee: callee.to_string(),
                args,
            },
        }
    }

    /// Type of the value this instruction produces.
    pub fn result_type(&self) -> Type {
        match &self.op {
            Op::Alloca { .. } => Type::Ptr(addrspace::PRIVATE),
            Op::Load { ty, .. } => *ty,
            Op::Store { .. } => Type::Void,
            Op::Binary { lhs, .. } => lhs.ty,
            Op::Cmp { .. } => Type::I1,
            Op::Select { then_value, .. } => then_value.ty,
            Op::Gep { base, .. } => base.ty,
            Op::Cast { to, .. } => *to,
            Op::Call { ret, .. } => *ret,
            Op::Phi { ty, .. } => *ty,
        }
    }

    pub fn callee(&self) -> Option<&str> {
        match &self.op {
            Op::Call { callee, .. } => Some(callee),
            _ => None,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.op, Op::Phi { .. })
    }

    pub fn operands(&self) -> Vec<&Value> {
        match &self.op {
            Op::Alloca { .. } => Vec::new(),
            Op::Load { ptr, .. } => vec![ptr],
            Op::Store { value, ptr } => vec![value, ptr],
            Op::Binary { lhs, rhs, .. } | Op::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Select {
                cond,
                then_value,
                else_value,
            } => vec![cond, then_value, else_value],
            Op::Gep { base, index, .. } => vec![base, index],
            Op::Cast { value, .. } => vec![value],
            Op::Call { args, .. } => args.iter().collect(),
            Op::Phi { incoming, .. } => incoming.iter().map(|(v, _)| v).collect(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match &mut self.op {
            Op::Alloca { .. } => Vec::new(),
            Op::Load { ptr, .. } => vec![ptr],
            Op::Store { value, ptr } => vec![value, ptr],
            Op::Binary { lhs, rhs, .. } | Op::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Select {
                cond,
                then_value,
                else_value,
            } => vec![cond, then_value, else_value],
            Op::Gep { base, index, .. } => vec![base, index],
            Op::Cast { value, .. } => vec![value],
            Op::Call { args, .. } => args.iter_mut().collect(),
            Op::Phi { incoming, .. } => incoming.iter_mut().map(|(v, _)| v).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Br(String),
    CondBr {
        cond: Value,
        then_bb: String,
        else_bb: String,
    },
    Ret(Option<Value>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Terminator::Br(t) => vec![t.as_str()],
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => {
                if then_bb == else_bb {
                    vec![then_bb.as_str()]
                } else {
                    vec![then_bb.as_str(), else_bb.as_str()]
                }
            }
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        }
    }

    /// Retarget every edge to `from` so it goes to `to`.
    pub fn replace_successor(&mut self, from: &str, to: &str) {
        match self {
            Terminator::Br(t) => {
                if t == from {
                    *t = to.to_string();
                }
            }
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => {
                if then_bb == from {
                    *then_bb = to.to_string();
                }
                if else_bb == from {
                    *else_bb = to.to_string();
                }
            }
            Terminator::Ret(_) | Terminator::Unreachable => {}
        }
    }

    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Terminator::CondBr { cond, .. } => vec![cond],
            Terminator::Ret(Some(v)) => vec![v],
            _ => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::CondBr { cond, .. } => vec![cond],
            Terminator::Ret(Some(v)) => vec![v],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub label: String,
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

impl Block {
    pub fn new(label: impl Into<String>, term: Terminator) -> Self {
        Self {
            label: label.into(),
            insts: Vec::new(),
            term,
        }
    }

    /// Index of the first non-phi instruction.
    pub fn first_non_phi(&self) -> usize {
        self.insts.iter().take_while(|i| i.is_phi()).count()
    }
}

// ─── Functions ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FnAttr {
    Kernel,
    AlwaysInline,
    NoInline,
    OptNone,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    /// Empty for declarations.
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    pub attrs: BTreeSet<FnAttr>,
    /// String annotations, `"key"="value"` in text form.
    pub annotations: BTreeMap<String, String>,
    /// Empty for declarations.
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn declaration(name: impl Into<String>, ret: Type, params: Vec<Type>) -> Self {
        Self {
            name: name.into(),
            ret,
            params: params
                .into_iter()
                .map(|ty| Param {
                    name: String::new(),
                    ty,
                })
                .collect(),
            attrs: BTreeSet::new(),
            annotations: BTreeMap::new(),
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_kernel(&self) -> bool {
        self.attrs.contains(&FnAttr::Kernel)
    }

    pub fn has_attr(&self, attr: FnAttr) -> bool {
        self.attrs.contains(&attr)
    }

    pub fn entry(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_mut(&mut self, label: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    /// Predecessor labels of each block, in block order, without duplicates.
    pub fn predecessors(&self) -> BTreeMap<String, Vec<String>> {
        let mut preds: BTreeMap<String, Vec<String>> = self
            .blocks
            .iter()
            .map(|b| (b.label.clone(), Vec::new()))
            .collect();
        for b in &self.blocks {
            for s in b.term.successors() {
                if let Some(list) = preds.get_mut(s) {
                    if !list.contains(&b.label) {
                        list.push(b.label.clone());
                    }
                }
            }
        }
        preds
    }

    /// Every instruction in block order.
    pub fn insts(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }

    /// Names of all SSA values (parameters and results) and labels.
    pub fn used_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.params.iter().map(|p| p.name.clone()).collect();
        for b in &self.blocks {
            names.insert(b.label.clone());
            for inst in &b.insts {
                if let Some(r) = &inst.result {
                    names.insert(r.clone());
                }
            }
        }
        names
    }

    /// Find the definition of a local value.
    pub fn def_site(&self, name: &str) -> Option<(usize, usize)> {
        for (bi, b) in self.blocks.iter().enumerate() {
            for (ii, inst) in b.insts.iter().enumerate() {
                if inst.result.as_deref() == Some(name) {
                    return Some((bi, ii));
                }
            }
        }
        None
    }

    /// Replace every use of local `name` with `with`.
    pub fn replace_all_uses(&mut self, name: &str, with: &Value) {
        for b in &mut self.blocks {
            for inst in &mut b.insts {
                for v in inst.operands_mut() {
                    if v.as_local() == Some(name) {
                        *v = with.clone();
                    }
                }
            }
            for v in b.term.operands_mut() {
                if v.as_local() == Some(name) {
                    *v = with.clone();
                }
            }
        }
    }

    /// Replace every `@name` operand with `with`.
    pub fn replace_global_uses(&mut self, name: &str, with: &Value) {
        for b in &mut self.blocks {
            for inst in &mut b.insts {
                for v in inst.operands_mut() {
                    if v.as_global() == Some(name) {
                        *v = with.clone();
                    }
                }
            }
            for v in b.term.operands_mut() {
                if v.as_global() == Some(name) {
                    *v = with.clone();
                }
            }
        }
    }

    /// Number of uses of local `name` (operands of instructions and terminators).
    pub fn use_count(&self, name: &str) -> usize {
        let mut n = 0;
        for b in &self.blocks {
            for inst in &b.insts {
                n += inst
                    .operands()
                    .iter()
                    .filter(|v| v.as_local() == Some(name))
                    .count();
            }
            n += b
                .term
                .operands()
                .iter()
                .filter(|v| v.as_local() == Some(name))
                .count();
        }
        n
    }

    /// Whether any instruction or terminator references `@name`.
    pub fn references_global(&self, name: &str) -> bool {
        self.blocks.iter().any(|b| {
            b.insts.iter().any(|i| {
                i.callee() == Some(name) || i.operands().iter().any(|v| v.as_global() == Some(name))
            }) || b.term.operands().iter().any(|v| v.as_global() == Some(name))
        })
    }

    /// Names of all `@` symbols this function refers to (callees included).
    pub fn referenced_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for b in &self.blocks {
            for inst in &b.insts {
                if let Some(c) = inst.callee() {
                    out.insert(c.to_string());
                }
                for v in inst.operands() {
                    if let Some(g) = v.as_global() {
                        out.insert(g.to_string());
                    }
                }
            }
            for v in b.term.operands() {
                if let Some(g) = v.as_global() {
                    out.insert(g.to_string());
                }
            }
        }
        out
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len() + 1).sum()
    }
}

// ─── Fresh Names ──────────────────────────────────────────────────

/// Hands out SSA value and block names that do not collide with any name
/// already present in a function.
pub struct NameGen {
    taken: HashSet<String>,
    counter: usize,
}

impl NameGen {
    pub fn for_function(f: &Function) -> Self {
        Self {
            taken: f.used_names(),
            counter: 0,
        }
    }

    pub fn fresh(&mut self, base: &str) -> String {
        if !self.taken.contains(base) {
            self.taken.insert(base.to_string());
            return base.to_string();
        }
        loop {
            self.counter += 1;
            let candidate = format!("{}.{}", base, self.counter);
            if !self.taken.contains(&candidate) {
                self.taken.insert(candidate.clone());
                return candidate;
            }
        }
    }
}

// ─── Globals ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Init {
    /// Defined elsewhere.
    External,
    Zero,
    Values(Vec<Value>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Global {
    pub name: String,
    pub addr_space: u32,
    pub constant: bool,
    pub ty: Type,
    /// Element count (1 for scalars).
    pub count: u64,
    pub init: Init,
}

impl Global {
    pub fn size_bytes(&self) -> u64 {
        self.ty.size_bytes() * self.count
    }

    pub fn is_definition(&self) -> bool {
        !matches!(self.init, Init::External)
    }

    /// Symbols referenced from the initializer.
    pub fn init_references(&self) -> Vec<&str> {
        match &self.init {
            Init::Values(vals) => vals.iter().filter_map(|v| v.as_global()).collect(),
            _ => Vec::new(),
        }
    }
}

// ─── Metadata ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaValue {
    Str(String),
    Int(u64),
    Bool(bool),
}

// ─── Module ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Module {
    pub name: String,
    pub triple: String,
    pub data_layout: String,
    pub metadata: BTreeMap<String, MetaValue>,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// An empty module sharing `parent`'s triple and data layout.
    pub fn sibling_of(name: impl Into<String>, parent: &Module) -> Self {
        Self {
            name: name.into(),
            triple: parent.triple.clone(),
            data_layout: parent.data_layout.clone(),
            ..Default::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.function(name).is_some() || self.global(name).is_some()
    }

    pub fn kernels(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| f.is_kernel())
    }

    pub fn kernel_names(&self) -> Vec<String> {
        self.kernels().map(|f| f.name.clone()).collect()
    }

    /// Add a declaration unless a function of that name already exists.
    pub fn declare(&mut self, name: &str, ret: Type, params: Vec<Type>) {
        if self.function(name).is_none() {
            self.functions.push(Function::declaration(name, ret, params));
        }
    }

    /// Drop declarations nothing refers to anymore.
    pub fn remove_unused_declarations(&mut self) {
        let mut referenced: HashSet<String> = HashSet::new();
        for f in &self.functions {
            referenced.extend(f.referenced_symbols());
        }
        for g in &self.globals {
            referenced.extend(g.init_references().into_iter().map(String::from));
        }
        self.functions
            .retain(|f| !f.is_declaration() || referenced.contains(&f.name));
    }

    pub fn set_meta(&mut self, key: &str, value: MetaValue) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(MetaValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn meta_int(&self, key: &str) -> Option<u64> {
        match self.metadata.get(key) {
            Some(MetaValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        match self.metadata.get(key) {
            Some(MetaValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Serialize to the portable text form.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

// ─── Work-item builtins ───────────────────────────────────────────

/// Names of the OpenCL work-item query functions.
pub mod builtins {
    pub const GET_LOCAL_ID: &str = "get_local_id";
    pub const GET_GLOBAL_ID: &str = "get_global_id";
    pub const GET_GROUP_ID: &str = "get_group_id";
    pub const GET_LOCAL_SIZE: &str = "get_local_size";
    pub const GET_GLOBAL_SIZE: &str = "get_global_size";
    pub const GET_NUM_GROUPS: &str = "get_num_groups";
    pub const GET_GLOBAL_OFFSET: &str = "get_global_offset";
    pub const GET_WORK_DIM: &str = "get_work_dim";

    pub const BARRIER: &str = "barrier";
    pub const WORK_GROUP_BARRIER: &str = "work_group_barrier";
    /// Barriers the compiler inserts itself.
    pub const IMPLICIT_BARRIER: &str = "_wg_barrier";

    /// Work-item queries: pure functions of their (dimension) argument.
    pub const WORK_ITEM_FUNCTIONS: &[&str] = &[
        GET_LOCAL_ID,
        GET_GLOBAL_ID,
        GET_GROUP_ID,
        GET_LOCAL_SIZE,
        GET_GLOBAL_SIZE,
        GET_NUM_GROUPS,
        GET_GLOBAL_OFFSET,
        GET_WORK_DIM,
    ];

    pub fn is_barrier(name: &str) -> bool {
        name == BARRIER || name == WORK_GROUP_BARRIER || name == IMPLICIT_BARRIER
    }

    pub fn is_work_item_function(name: &str) -> bool {
        WORK_ITEM_FUNCTIONS.contains(&name)
    }

    /// Values that differ between work-items of one work-group.
    pub fn is_work_item_varying(name: &str) -> bool {
        name == GET_LOCAL_ID || name == GET_GLOBAL_ID
    }
}

/// Whether the instruction is a call to a barrier.
pub fn is_barrier_inst(inst: &Inst) -> bool {
    inst.callee().is_some_and(builtins::is_barrier)
}

/// Whether the block contains a barrier call.
pub fn block_has_barrier(block: &Block) -> bool {
    block.insts.iter().any(is_barrier_inst)
}

/// Whether the function contains any barrier.
pub fn function_has_barrier(f: &Function) -> bool {
    f.blocks.iter().any(block_has_barrier)
}
