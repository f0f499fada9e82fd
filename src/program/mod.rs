//! Programs and the pieces cut out of them.
//!
//! A [`Program`] holds the parsed IR of one OpenCL program per device.
//! [`ProgramContext`] wraps a single program module for kernel extraction.
//! The free functions here do the module surgery both rely on: splitting
//! program-scope variables into their own module and copying a kernel's
//! call-graph closure into a fresh one.

mod context;

pub use context::ProgramContext;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CompilerError, Result};
use crate::ir::parse::parse_module_bytes;
use crate::ir::{addrspace, Function, Global, Init, Inst, MetaValue, Module, NameGen, Op, Type, Value};

/// Returns the base address of the program-scope storage block.
pub const SCOPE_BASE_FN: &str = "_cl_program_scope_base";

/// Module metadata holding the byte size of the program-scope storage.
pub const SCOPE_SIZE_KEY: &str = "program_scope_storage_size";

/// Name given to the module holding program-scope variables.
pub const GLOBALS_MODULE_NAME: &str = "program_gvars";

/// Name given to extracted kernel modules.
pub const KERNEL_MODULE_NAME: &str = "parallel_bc";

// ─── Program ──────────────────────────────────────────────────────

/// One program's binaries and their parsed IR, per device.
#[derive(Debug, Default)]
pub struct Program {
    binaries: Vec<Vec<u8>>,
    irs: Vec<Option<Module>>,
    hashes: Vec<Option<blake3::Hash>>,
    scope_sizes: Vec<u64>,
}

impl Program {
    /// A program with one binary per device. An empty binary means the IR
    /// is read from a file instead.
    pub fn new(binaries: Vec<Vec<u8>>) -> Self {
        let n = binaries.len();
        Self {
            binaries,
            irs: vec![None; n],
            hashes: vec![None; n],
            scope_sizes: vec![0; n],
        }
    }

    pub fn num_devices(&self) -> usize {
        self.binaries.len()
    }

    pub fn binary(&self, device_i: usize) -> &[u8] {
        self.binaries.get(device_i).map_or(&[], |b| b.as_slice())
    }

    pub fn is_loaded(&self, device_i: usize) -> bool {
        matches!(self.irs.get(device_i), Some(Some(_)))
    }

    pub fn ir(&self, device_i: usize) -> Result<&Module> {
        self.irs
            .get(device_i)
            .and_then(Option::as_ref)
            .ok_or(CompilerError::ProgramNotLoaded(device_i))
    }

    /// Content hash of the IR loaded for `device_i`.
    pub fn hash(&self, device_i: usize) -> Result<blake3::Hash> {
        self.hashes
            .get(device_i)
            .copied()
            .flatten()
            .ok_or(CompilerError::ProgramNotLoaded(device_i))
    }

    /// Bytes of program-scope storage the device's IR needs.
    pub fn scope_storage_size(&self, device_i: usize) -> u64 {
        self.scope_sizes.get(device_i).copied().unwrap_or(0)
    }

    /// Parse `bytes` as the IR for `device_i`.
    pub(crate) fn load(&mut self, device_i: usize, bytes: &[u8], record_scope: bool) -> Result<()> {
        if device_i >= self.binaries.len() {
            return Err(CompilerError::ProgramNotLoaded(device_i));
        }
        let module = parse_module_bytes(bytes).map_err(CompilerError::Parse)?;
        if record_scope {
            self.scope_sizes[device_i] = module.meta_int(SCOPE_SIZE_KEY).unwrap_or(0);
        }
        self.hashes[device_i] = Some(blake3::hash(bytes));
        self.irs[device_i] = Some(module);
        Ok(())
    }

    /// Drop the IR for `device_i`; true when there was one.
    pub(crate) fn unload(&mut self, device_i: usize) -> bool {
        match self.irs.get_mut(device_i) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }
}

// ─── Program-scope variables ──────────────────────────────────────

/// Where each program-scope variable lives in the storage block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramScope {
    pub offsets: BTreeMap<String, u64>,
    pub size: u64,
}

impl ProgramScope {
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

fn is_program_scope_variable(g: &Global) -> bool {
    g.is_definition() && g.addr_space == addrspace::GLOBAL
}

fn align_up(offset: u64, align: u64) -> u64 {
    offset.div_ceil(align) * align
}

/// Move the program-scope variables of `program` into a new sibling module.
///
/// Each variable gets a naturally aligned byte offset in one storage block
/// and takes the local address space in the new module. Functions their
/// initializers need are copied along; globals those functions use that
/// stay behind are declared external. In `program`, every use of a moved
/// variable becomes `@_cl_program_scope_base()` plus its offset. Both
/// modules record the block size under [`SCOPE_SIZE_KEY`].
pub fn split_program_scope(program: &mut Module) -> (Module, ProgramScope) {
    let mut globals = Module::sibling_of(GLOBALS_MODULE_NAME, program);

    let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut program.globals)
        .into_iter()
        .partition(is_program_scope_variable);
    program.globals = kept;

    let mut scope = ProgramScope::default();
    let mut offset = 0;
    for g in &moved {
        offset = align_up(offset, g.ty.size_bytes().max(1));
        scope.offsets.insert(g.name.clone(), offset);
        offset += g.size_bytes();
    }
    scope.size = offset;

    // A kept global whose initializer points at a moved one (directly or
    // through another such global) is defined in the globals module too.
    // The program keeps it as an external declaration.
    let mut anchored: BTreeSet<String> = moved.iter().map(|g| g.name.clone()).collect();
    let mut pulled: Vec<Global> = Vec::new();
    loop {
        let next: Vec<Global> = program
            .globals
            .iter()
            .filter(|g| g.is_definition() && !anchored.contains(&g.name))
            .filter(|g| g.init_references().iter().any(|r| anchored.contains(*r)))
            .cloned()
            .collect();
        if next.is_empty() {
            break;
        }
        anchored.extend(next.iter().map(|g| g.name.clone()));
        pulled.extend(next);
    }
    for g in program.globals.iter_mut() {
        if pulled.iter().any(|p| p.name == g.name) {
            g.init = Init::External;
        }
    }

    let mut pending: Vec<String> = moved
        .iter()
        .chain(&pulled)
        .flat_map(|g| g.init_references())
        .map(String::from)
        .collect();
    globals.globals = moved
        .into_iter()
        .map(|mut g| {
            g.addr_space = addrspace::LOCAL;
            g
        })
        .chain(pulled)
        .collect();

    // Initializer closure: helpers are copied, kernels and globals that
    // stay in the program are only declared.
    let mut seen = BTreeSet::new();
    while let Some(sym) = pending.pop() {
        if !seen.insert(sym.clone()) || anchored.contains(&sym) {
            continue;
        }
        if let Some(f) = program.function(&sym) {
            if f.is_kernel() {
                let params = f.params.iter().map(|p| p.ty).collect();
                globals.functions.push(Function::declaration(&f.name, f.ret, params));
            } else {
                pending.extend(f.referenced_symbols());
                globals.functions.push(f.clone());
            }
        } else if let Some(g) = program.global(&sym) {
            let mut decl = g.clone();
            decl.init = Init::External;
            globals.globals.push(decl);
        }
    }

    let mut rewritten = false;
    for f in program.functions.iter_mut().filter(|f| !f.is_declaration()) {
        rewritten |= rebase_scope_uses(f, &scope);
    }
    if rewritten {
        program.declare(SCOPE_BASE_FN, Type::Ptr(addrspace::GLOBAL), Vec::new());
    }

    program.set_meta(SCOPE_SIZE_KEY, MetaValue::Int(scope.size));
    globals.set_meta(SCOPE_SIZE_KEY, MetaValue::Int(scope.size));
    log::debug!(
        "moved {} program-scope variables ({} bytes) out of '{}'",
        scope.offsets.len(),
        scope.size,
        program.name
    );
    (globals, scope)
}

/// Point every use of a moved variable in `f` at its slot in the storage
/// block. The address computations go at the top of the entry block.
fn rebase_scope_uses(f: &mut Function, scope: &ProgramScope) -> bool {
    let used: Vec<(&String, u64)> = scope
        .offsets
        .iter()
        .filter(|(name, _)| f.references_global(name))
        .map(|(name, off)| (name, *off))
        .collect();
    if used.is_empty() {
        return false;
    }

    let ptr = Type::Ptr(addrspace::GLOBAL);
    let mut names = NameGen::for_function(f);
    let base = names.fresh("scope.base");
    let mut prologue = vec![Inst::call(Some(base.clone()), ptr, SCOPE_BASE_FN, Vec::new())];
    let mut replacements = Vec::new();
    for (name, off) in used {
        let addr = names.fresh(&format!("{}.addr", name));
        prologue.push(Inst::new(
            addr.clone(),
            Op::Gep {
                elem: Type::I8,
                base: Value::local(ptr, base.clone()),
                index: Value::i64(off as i64),
            },
        ));
        replacements.push((name.clone(), Value::local(ptr, addr)));
    }
    for (name, with) in &replacements {
        f.replace_global_uses(name, with);
    }
    if let Some(entry) = f.blocks.first_mut() {
        entry.insts.splice(0..0, prologue);
    }
    true
}

// ─── Kernel extraction ────────────────────────────────────────────

/// Copy `kernel` with everything it references into a fresh module that
/// shares the program's triple and data layout. `aux` names extra
/// functions to bring along when the program has them.
pub fn copy_kernel(program: &Module, kernel: &str, aux: &[String]) -> Result<Module> {
    match program.function(kernel) {
        Some(f) if f.is_kernel() && !f.is_declaration() => {}
        _ => return Err(CompilerError::KernelNotFound(kernel.to_string())),
    }

    let mut wanted: BTreeSet<String> = BTreeSet::new();
    let mut pending = vec![kernel.to_string()];
    pending.extend(aux.iter().filter(|a| program.has_symbol(a)).cloned());
    while let Some(sym) = pending.pop() {
        if !wanted.insert(sym.clone()) {
            continue;
        }
        if let Some(f) = program.function(&sym) {
            pending.extend(f.referenced_symbols());
        } else if let Some(g) = program.global(&sym) {
            pending.extend(g.init_references().into_iter().map(String::from));
        }
    }

    let mut out = Module::sibling_of(KERNEL_MODULE_NAME, program);
    out.globals = program
        .globals
        .iter()
        .filter(|g| wanted.contains(&g.name))
        .cloned()
        .collect();
    out.functions = program
        .functions
        .iter()
        .filter(|f| wanted.contains(&f.name))
        .cloned()
        .collect();
    if let Some(size) = program.meta_int(SCOPE_SIZE_KEY) {
        out.set_meta(SCOPE_SIZE_KEY, MetaValue::Int(size));
    }
    log::trace!(
        "copied kernel '{}': {} functions, {} globals",
        kernel,
        out.functions.len(),
        out.globals.len()
    );
    Ok(out)
}
