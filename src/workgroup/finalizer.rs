use crate::config::CompilerOptions;
use crate::error::{CompilerError, Result};
use crate::ir::parse::parse_module_bytes;
use crate::ir::Module;
use crate::tools;

/// Hand `module` to the finalizer shell command and read back what it
/// leaves in the file. `%(bc)` in `command` becomes the quoted file path.
pub fn run_finalizer(command: &str, module: &Module, opts: &CompilerOptions) -> Result<Module> {
    let file = tools::scratch_file(opts, "clwg-parallel-", ".bc")?;
    let cmdline = tools::substitute_bc(command, file.path());

    let result = tools::write_file(file.path(), module.to_text().as_bytes())
        .and_then(|()| tools::run_shell(&cmdline))
        .and_then(|out| {
            if out.success() {
                return Ok(());
            }
            Err(CompilerError::Finalizer(format!(
                "'{}' exited with {}\n{}",
                cmdline, out.status, out.output
            )))
        })
        .and_then(|()| tools::read_file(file.path()))
        .and_then(|bytes| parse_module_bytes(&bytes).map_err(CompilerError::Parse));

    tools::finish_scratch(file, opts);
    if result.is_ok() {
        log::debug!("finalizer '{}' done", cmdline);
    }
    result
}
