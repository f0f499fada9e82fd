//! Recoverable compiler errors.
//!
//! Every variant here maps to a failed request plus a line in the caller's
//! build log. Programmer errors (an unresolvable pass name, a backend that
//! can emit nothing at all) are not represented: they panic.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::diagnostic::Diagnostic;

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("failed to parse program IR: {0}")]
    Parse(Diagnostic),

    #[error("IR verification failed:\n{}", .0.join("\n"))]
    Verify(Vec<String>),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("kernel '{0}' not found in program")]
    KernelNotFound(String),

    #[error("no native backend for target triple '{0}'")]
    NoBackend(String),

    #[error("{tool} failed with status {status}:\n{output}")]
    ExternalTool {
        tool: String,
        status: String,
        output: String,
    },

    #[error("invalid launch metadata: {0}")]
    InvalidMetadata(String),

    #[error("bitcode finalizer failed: {0}")]
    Finalizer(String),

    #[error("program IR for device {0} is not loaded")]
    ProgramNotLoaded(usize),
}

impl CompilerError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CompilerError::Io {
            path: path.into(),
            source,
        }
    }

    /// Append this error to a build log, one entry per line.
    pub fn log_to(&self, build_log: &mut String) {
        build_log.push_str(&self.to_string());
        if !build_log.ends_with('\n') {
            build_log.push('\n');
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_lists_every_problem() {
        let e = CompilerError::Verify(vec!["first".into(), "second".into()]);
        assert_eq!(e.to_string(), "IR verification failed:\nfirst\nsecond");
    }

    #[test]
    fn test_log_to_terminates_lines() {
        let mut log = String::from("earlier\n");
        CompilerError::KernelNotFound("k".into()).log_to(&mut log);
        assert_eq!(log, "earlier\nkernel 'k' not found in program\n");
    }

    #[test]
    fn test_external_tool_carries_output() {
        let e = CompilerError::ExternalTool {
            tool: "clang".into(),
            status: "exit status: 1".into(),
            output: "bad.s:1: error".into(),
        };
        let text = e.to_string();
        assert!(text.starts_with("clang failed with status exit status: 1"));
        assert!(text.ends_with("bad.s:1: error"));
    }

    #[test]
    fn test_io_error_names_path() {
        let e = CompilerError::io(
            "/nowhere/x.bc",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(e.to_string().contains("/nowhere/x.bc"));
    }
}
