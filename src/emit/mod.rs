//! Native code emission.
//!
//! The backend writes an object file straight into memory when it can.
//! Otherwise, and always in cross-compiling builds, it prints assembly
//! that the configured driver assembles (`driver in.s -c -o out.o`).

#[cfg(test)]
mod tests;

use std::ffi::OsStr;
use std::fmt;

use crate::config::CompilerOptions;
use crate::error::Result;
use crate::ir::Module;
use crate::target::{Backend, FileType};
use crate::tools;

/// Which route produced an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitPath {
    Object,
    Assembler,
}

impl fmt::Display for EmitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitPath::Object => f.write_str("object"),
            EmitPath::Assembler => f.write_str("assembler"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Emitted {
    pub bytes: Vec<u8>,
    pub path: EmitPath,
}

/// Lower `module` to a relocatable object.
///
/// # Panics
///
/// If the backend can produce neither an object nor assembly, or if the
/// assembler succeeds but its output cannot be read back.
pub fn codegen(backend: &Backend, module: &Module, opts: &CompilerOptions) -> Result<Emitted> {
    if !opts.cross_compile {
        if let Some(bytes) = backend.emit(module, FileType::Object) {
            log::debug!(
                "emitted {} bytes of object code for '{}'",
                bytes.len(),
                module.name
            );
            return Ok(Emitted {
                bytes,
                path: EmitPath::Object,
            });
        }
    }

    let Some(asm) = backend.emit(module, FileType::Assembly) else {
        panic!(
            "target '{}' can emit neither object files nor assembly",
            backend.machine().triple
        );
    };
    let bytes = assemble(&asm, opts)?;
    log::debug!(
        "assembled {} bytes of object code for '{}'",
        bytes.len(),
        module.name
    );
    Ok(Emitted {
        bytes,
        path: EmitPath::Assembler,
    })
}

/// Run the assembler driver over `asm` and return the object it wrote.
fn assemble(asm: &[u8], opts: &CompilerOptions) -> Result<Vec<u8>> {
    let asm_file = tools::scratch_file(opts, "clwg-", ".s")?;
    let obj_file = tools::scratch_file(opts, "clwg-", ".o")?;
    log::debug!("assembly written to {}", asm_file.path().display());

    let result = tools::write_file(asm_file.path(), asm)
        .and_then(|()| {
            let args = [
                asm_file.path().as_os_str(),
                OsStr::new("-c"),
                OsStr::new("-o"),
                obj_file.path().as_os_str(),
            ];
            tools::run_capture(&opts.assembler_driver, args)
        })
        .and_then(|out| out.check(&opts.assembler_driver))
        .map(|_| match std::fs::read(obj_file.path()) {
            Ok(bytes) => bytes,
            Err(e) => panic!(
                "could not read assembled object {}: {}",
                obj_file.path().display(),
                e
            ),
        });

    tools::finish_scratch(asm_file, opts);
    tools::finish_scratch(obj_file, opts);
    result
}
