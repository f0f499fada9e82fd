//! External tool invocation and scratch files.
//!
//! Tools run as plain subprocesses with their arguments passed through
//! untouched. The one shell invocation is the bitcode finalizer, whose
//! template has its `%(bc)` token replaced by a quoted path.

use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use tempfile::NamedTempFile;

use crate::config::CompilerOptions;
use crate::error::{CompilerError, Result};

/// Captured tool output is cut off after this many bytes.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Placeholder in the finalizer command for the module path.
pub const BC_TOKEN: &str = "%(bc)";

/// Exit status and combined stdout/stderr of a finished tool.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turn a failed run into an [`CompilerError::ExternalTool`].
    pub fn check(self, tool: &str) -> Result<String> {
        if self.status.success() {
            return Ok(self.output);
        }
        Err(CompilerError::ExternalTool {
            tool: tool.to_string(),
            status: self.status.to_string(),
            output: self.output,
        })
    }
}

/// Read at most [`MAX_CAPTURED_OUTPUT`] bytes of `stream`, then drain the
/// rest so the child never blocks on a full pipe.
fn read_bounded(stream: Option<impl Read>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        (&mut stream)
            .take(MAX_CAPTURED_OUTPUT as u64)
            .read_to_end(&mut buf)?;
        io::copy(&mut stream, &mut io::sink())?;
    }
    Ok(buf)
}

fn capture(tool: &str, cmd: &mut Command) -> Result<ToolOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CompilerError::io(tool, e))?;

    let stderr = child.stderr.take();
    let stderr_reader = thread::spawn(move || read_bounded(stderr));
    let stdout = read_bounded(child.stdout.take());
    let stderr = stderr_reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("stderr reader panicked")));
    let status = child.wait().map_err(|e| CompilerError::io(tool, e))?;

    let mut combined = stdout.map_err(|e| CompilerError::io(tool, e))?;
    combined.extend(stderr.map_err(|e| CompilerError::io(tool, e))?);
    combined.truncate(MAX_CAPTURED_OUTPUT);
    log::debug!("{} exited with {}", tool, status);
    Ok(ToolOutput {
        status,
        output: String::from_utf8_lossy(&combined).into_owned(),
    })
}

/// Run `program` with `args` and capture what it prints.
pub fn run_capture<I, S>(program: &str, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    log::debug!("running {:?}", cmd);
    capture(program, &mut cmd)
}

/// Run a command line through `sh -c`.
pub fn run_shell(command: &str) -> Result<ToolOutput> {
    log::debug!("running shell command: {}", command);
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    capture("sh", &mut cmd)
}

/// Single-quote `path` for a POSIX shell.
pub fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for c in raw.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Replace every `%(bc)` in `template` with the quoted `path`.
pub fn substitute_bc(template: &str, path: &Path) -> String {
    template.replace(BC_TOKEN, &shell_quote(path))
}

// ─── Scratch files ────────────────────────────────────────────────

/// A named scratch file under the configured temp root.
pub fn scratch_file(opts: &CompilerOptions, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
    let root = opts.temp_root();
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(&root)
        .map_err(|e| CompilerError::io(root, e))
}

/// Delete a scratch file, or keep it on disk when the options ask for it.
/// Returns the kept path.
pub fn finish_scratch(file: NamedTempFile, opts: &CompilerOptions) -> Option<PathBuf> {
    if !opts.leave_temp_files {
        return None;
    }
    match file.keep() {
        Ok((_, path)) => {
            log::info!("kept temp file {}", path.display());
            Some(path)
        }
        Err(e) => {
            log::warn!("could not keep temp file {}: {}", e.file.path().display(), e.error);
            None
        }
    }
}

/// Read a file, mapping failure to [`CompilerError::Io`].
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| CompilerError::io(path, e))
}

/// Write a file, mapping failure to [`CompilerError::Io`].
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| CompilerError::io(path, e))
}

/// Write `body` as an executable shell script. Test helper for the
/// stand-in tools.
#[cfg(all(test, unix))]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_path() {
        assert_eq!(shell_quote(Path::new("/tmp/a b.bc")), "'/tmp/a b.bc'");
    }

    #[test]
    fn test_quote_embedded_quote() {
        assert_eq!(shell_quote(Path::new("/tmp/it's.bc")), "'/tmp/it'\\''s.bc'");
    }

    #[test]
    fn test_substitute_every_token() {
        let cmd = substitute_bc("opt %(bc) -o %(bc)", Path::new("/t/x.bc"));
        assert_eq!(cmd, "opt '/t/x.bc' -o '/t/x.bc'");
    }

    #[test]
    fn test_template_without_token_is_unchanged() {
        assert_eq!(substitute_bc("true", Path::new("/t/x.bc")), "true");
    }

    #[cfg(unix)]
    #[test]
    fn test_large_stdout_is_bounded() {
        let out = run_shell("head -c 8388608 /dev/zero | tr '\\0' x; echo tail >&2").unwrap();
        assert!(out.success());
        assert_eq!(out.output.len(), MAX_CAPTURED_OUTPUT);
        assert!(out.output.bytes().all(|b| b == b'x'));
    }

    #[cfg(unix)]
    #[test]
    fn test_large_stderr_does_not_block_the_tool() {
        let out = run_shell("head -c 8388608 /dev/zero | tr '\\0' y >&2; echo done").unwrap();
        assert!(out.success());
        assert_eq!(out.output.len(), MAX_CAPTURED_OUTPUT);
        assert!(out.output.starts_with("done\nyyy"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_reports_output() {
        let out = run_shell("echo broken; exit 3").unwrap();
        assert!(!out.success());
        let err = out.check("stand-in").unwrap_err();
        match err {
            CompilerError::ExternalTool { tool, output, .. } => {
                assert_eq!(tool, "stand-in");
                assert_eq!(output, "broken\n");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let err = run_capture("clwg-no-such-tool-here", ["--version"]).unwrap_err();
        assert!(matches!(err, CompilerError::Io { .. }));
    }

    #[test]
    fn test_scratch_files_removed_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CompilerOptions::default().with_temp_dir(dir.path());

        let f = scratch_file(&opts, "clwg-", ".bc").unwrap();
        let path = f.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(finish_scratch(f, &opts).is_none());
        assert!(!path.exists());

        let keep = opts.with_leave_temp_files(true);
        let f = scratch_file(&keep, "clwg-", ".s").unwrap();
        let kept = finish_scratch(f, &keep).unwrap();
        assert!(kept.exists());
        assert_eq!(kept.extension().unwrap(), "s");
    }
}
