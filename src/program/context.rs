use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{copy_kernel, split_program_scope, ProgramScope};
use crate::config::CompilerOptions;
use crate::error::{CompilerError, Result};
use crate::ir::parse::parse_module_bytes;
use crate::ir::{verify_module, Module};
use crate::{spirv, tools};

/// A parsed program ready for per-kernel extraction.
///
/// Construction splits the program-scope variables off into a globals
/// module. The program module itself sits behind a mutex, so extractions
/// from one context run one at a time. Every context owns its modules
/// outright; nothing is shared between contexts.
pub struct ProgramContext {
    program: Mutex<Module>,
    globals: Module,
    globals_path: PathBuf,
    scope: ProgramScope,
    opts: CompilerOptions,
    #[cfg(test)]
    pub(crate) probe: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl std::fmt::Debug for ProgramContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramContext")
            .field("globals_path", &self.globals_path)
            .field("scope", &self.scope)
            .finish()
    }
}

impl ProgramContext {
    /// Parse `bytes`, split off the program-scope variables and write the
    /// globals module to `globals_path`.
    pub fn init(bytes: &[u8], globals_path: &Path, opts: &CompilerOptions) -> Result<Self> {
        let mut program = parse_module_bytes(bytes).map_err(CompilerError::Parse)?;
        let (globals, scope) = split_program_scope(&mut program);

        tools::write_file(globals_path, globals.to_text().as_bytes())?;
        if opts.verify_modules {
            let errors = verify_module(&globals);
            if !errors.is_empty() {
                return Err(CompilerError::Verify(errors));
            }
        }
        log::debug!(
            "program context for '{}': globals module at {}",
            program.name,
            globals_path.display()
        );
        Ok(Self {
            program: Mutex::new(program),
            globals,
            globals_path: globals_path.to_path_buf(),
            scope,
            opts: opts.clone(),
            #[cfg(test)]
            probe: None,
        })
    }

    /// Copy kernel `name` and its call graph into a fresh module and write
    /// it to `out_path`. Failures are also appended to `build_log`.
    pub fn extract_kernel(&self, name: &str, out_path: &Path, build_log: &mut String) -> Result<()> {
        let result = self
            .extract_locked(name)
            .and_then(|m| tools::write_file(out_path, m.to_text().as_bytes()));
        if let Err(e) = &result {
            e.log_to(build_log);
        }
        result
    }

    fn extract_locked(&self, name: &str) -> Result<Module> {
        let program = self.program.lock().unwrap_or_else(PoisonError::into_inner);
        self.mark_critical(name);
        let module = copy_kernel(&program, name, &[])?;
        if self.opts.verify_modules {
            let mut errors = verify_module(&module);
            if !errors.is_empty() {
                errors.insert(0, "Failed to verify Kernel Module".to_string());
                return Err(CompilerError::Verify(errors));
            }
        }
        self.mark_critical(name);
        Ok(module)
    }

    #[cfg(test)]
    fn mark_critical(&self, name: &str) {
        if let Some(probe) = &self.probe {
            probe(name);
        }
    }

    #[cfg(not(test))]
    fn mark_critical(&self, _name: &str) {}

    /// [`ProgramContext::init`] plus SPIR-V conversion of the globals
    /// module. The globals module goes to a scratch file.
    pub fn create_for_program(
        bytes: &[u8],
        opts: &CompilerOptions,
        build_log: &mut String,
    ) -> Result<(Self, Vec<u8>)> {
        let scratch = tools::scratch_file(opts, "clwg-gvars-", ".bc")?;
        let result = Self::init(bytes, scratch.path(), opts).and_then(|ctx| {
            let spirv = spirv::convert_file(scratch.path(), opts, build_log)?;
            Ok((ctx, spirv))
        });
        tools::finish_scratch(scratch, opts);
        if let Err(e) = &result {
            if !matches!(e, CompilerError::ExternalTool { .. }) {
                e.log_to(build_log);
            }
        }
        result
    }

    /// Extract kernel `name` and convert it to SPIR-V.
    pub fn extract_kernel_spirv(&self, name: &str, build_log: &mut String) -> Result<Vec<u8>> {
        let module = match self.extract_locked(name) {
            Ok(m) => m,
            Err(e) => {
                e.log_to(build_log);
                return Err(e);
            }
        };
        spirv::convert_module(&module, &self.opts, build_log)
    }

    /// The program-scope variables split off at construction.
    pub fn globals(&self) -> &Module {
        &self.globals
    }

    pub fn globals_path(&self) -> &Path {
        &self.globals_path
    }

    pub fn scope(&self) -> &ProgramScope {
        &self.scope
    }

    /// Names of the kernels in the program.
    pub fn kernel_names(&self) -> Vec<String> {
        self.program
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kernel_names()
    }

    /// Snapshot of the program module as it stands after the split.
    pub fn program_text(&self) -> String {
        self.program
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_text()
    }

    /// Tear the context down.
    pub fn release(self) {
        log::debug!("released program context ({})", self.globals_path.display());
    }
}
