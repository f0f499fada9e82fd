//! Compiler options.
//!
//! Defaults come from cargo features, then environment variables override
//! them, then callers may override again with the `with_*` builders:
//!
//! | Variable | Field |
//! |---|---|
//! | `CLWG_LLVM_VERIFY` | `verify_modules` |
//! | `CLWG_LEAVE_KERNEL_COMPILER_TEMP_FILES` | `leave_temp_files` |
//! | `CLWG_VECTORIZER_REMARKS` | `vectorizer_remarks` |
//! | `CLWG_BITCODE_FINALIZER` | `bitcode_finalizer` |
//! | `CLWG_WORK_GROUP_METHOD` | `wg_method` |
//! | `CLWG_SPIRV` | `spirv_converter` |
//! | `CLWG_ASSEMBLER` | `assembler_driver` |
//! | `CLWG_CACHE_DIR` | `cache_dir` |

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// How work-items of one work-group are serialized on a CPU core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkGroupMethod {
    /// Let `workitem-handler-chooser` decide per kernel.
    Auto,
    Loops,
    /// Work-item loops with the vectorizers enabled.
    LoopVec,
    /// Continuation-based synchronization: sub-CFGs between barriers.
    Cbs,
    /// Full replication of the kernel body per work-item.
    Repl,
}

impl WorkGroupMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkGroupMethod::Auto => "auto",
            WorkGroupMethod::Loops => "loops",
            WorkGroupMethod::LoopVec => "loopvec",
            WorkGroupMethod::Cbs => "cbs",
            WorkGroupMethod::Repl => "repl",
        }
    }

    /// Whether the standard optimization pipeline should vectorize.
    pub fn wants_vectorizer(self) -> bool {
        matches!(self, WorkGroupMethod::LoopVec | WorkGroupMethod::Cbs)
    }
}

impl FromStr for WorkGroupMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(WorkGroupMethod::Auto),
            "loops" | "workitemloops" => Ok(WorkGroupMethod::Loops),
            "loopvec" => Ok(WorkGroupMethod::LoopVec),
            "cbs" => Ok(WorkGroupMethod::Cbs),
            "repl" | "workitemrepl" => Ok(WorkGroupMethod::Repl),
            other => Err(format!("unknown work-group method '{}'", other)),
        }
    }
}

impl fmt::Display for WorkGroupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatAbi {
    Soft,
    Hard,
}

impl FloatAbi {
    /// The float ABI this build was configured with.
    pub fn build_default() -> Self {
        if cfg!(feature = "soft-float") {
            FloatAbi::Soft
        } else {
            FloatAbi::Hard
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompilerOptions {
    pub verify_modules: bool,
    pub leave_temp_files: bool,
    pub vectorizer_remarks: bool,
    /// Shell command run on the work-group module; `%(bc)` is replaced by
    /// the quoted path of the module file.
    pub bitcode_finalizer: Option<String>,
    pub wg_method: WorkGroupMethod,
    pub float_abi: FloatAbi,
    /// Skip direct object emission and always go through the assembler.
    pub cross_compile: bool,
    pub spirv_converter: String,
    pub assembler_driver: String,
    pub opaque_pointers: bool,
    pub cache_dir: Option<PathBuf>,
    /// Where temp files are created; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            verify_modules: cfg!(debug_assertions),
            leave_temp_files: false,
            vectorizer_remarks: false,
            bitcode_finalizer: None,
            wg_method: WorkGroupMethod::LoopVec,
            float_abi: FloatAbi::build_default(),
            cross_compile: cfg!(feature = "cross-compilation"),
            spirv_converter: "llvm-spirv".to_string(),
            assembler_driver: "clang".to_string(),
            opaque_pointers: true,
            cache_dir: None,
            temp_dir: None,
        }
    }
}

/// Interpret a boolean environment value. Unset or unparsable is `None`.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl CompilerOptions {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its
    /// value. Split out from `from_env` so tests need not touch the real
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        let flag = |key: &str, current: bool| match lookup(key) {
            Some(v) => parse_flag(&v).unwrap_or_else(|| {
                log::warn!("ignoring {}={:?}: not a boolean", key, v);
                current
            }),
            None => current,
        };
        opts.verify_modules = flag("CLWG_LLVM_VERIFY", opts.verify_modules);
        opts.leave_temp_files = flag("CLWG_LEAVE_KERNEL_COMPILER_TEMP_FILES", opts.leave_temp_files);
        opts.vectorizer_remarks = flag("CLWG_VECTORIZER_REMARKS", opts.vectorizer_remarks);

        if let Some(cmd) = lookup("CLWG_BITCODE_FINALIZER") {
            if !cmd.trim().is_empty() {
                opts.bitcode_finalizer = Some(cmd);
            }
        }
        if let Some(method) = lookup("CLWG_WORK_GROUP_METHOD") {
            match method.parse() {
                Ok(m) => opts.wg_method = m,
                Err(e) => log::warn!("{}; keeping {}", e, opts.wg_method),
            }
        }
        if let Some(path) = lookup("CLWG_SPIRV") {
            opts.spirv_converter = path;
        }
        if let Some(path) = lookup("CLWG_ASSEMBLER") {
            opts.assembler_driver = path;
        }
        if let Some(dir) = lookup("CLWG_CACHE_DIR") {
            opts.cache_dir = Some(PathBuf::from(dir));
        }
        opts
    }

    pub fn with_verify(mut self, on: bool) -> Self {
        self.verify_modules = on;
        self
    }

    pub fn with_leave_temp_files(mut self, on: bool) -> Self {
        self.leave_temp_files = on;
        self
    }

    pub fn with_vectorizer_remarks(mut self, on: bool) -> Self {
        self.vectorizer_remarks = on;
        self
    }

    pub fn with_finalizer(mut self, command: impl Into<String>) -> Self {
        self.bitcode_finalizer = Some(command.into());
        self
    }

    pub fn with_wg_method(mut self, method: WorkGroupMethod) -> Self {
        self.wg_method = method;
        self
    }

    pub fn with_cross_compile(mut self, on: bool) -> Self {
        self.cross_compile = on;
        self
    }

    pub fn with_spirv_converter(mut self, path: impl Into<String>) -> Self {
        self.spirv_converter = path.into();
        self
    }

    pub fn with_assembler(mut self, path: impl Into<String>) -> Self {
        self.assembler_driver = path.into();
        self
    }

    pub fn with_opaque_pointers(mut self, on: bool) -> Self {
        self.opaque_pointers = on;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Directory for scratch files.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
