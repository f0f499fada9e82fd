//! On-disk locations of work-group modules and final binaries.
//!
//! Entries are keyed by the blake3 hash of the program IR:
//!
//! ```text
//! <root>/
//! └── <program_hash_hex>/
//!     └── <device_index>/
//!         └── <kernel>/
//!             └── <variant>/
//!                 ├── parallel.bc
//!                 └── <kernel>.so
//! ```
//!
//! The variant directory names the launch specialization, so a generic
//! build and a specialized one never share a file. Entries are write-once:
//! an existing file is never replaced.

use std::path::{Path, PathBuf};

use crate::config::CompilerOptions;
use crate::error::{CompilerError, Result};
use crate::ir::Module;
use crate::launch::WgSpecialization;

pub const WORK_GROUP_FILE: &str = "parallel.bc";

/// Where compiled kernels live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelCache {
    root: PathBuf,
}

impl KernelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from the options, else `~/.cache/clwg/kcache`, else a directory
    /// under the temp root.
    pub fn from_options(opts: &CompilerOptions) -> Self {
        if let Some(dir) = &opts.cache_dir {
            return Self::new(dir);
        }
        match std::env::var("HOME") {
            Ok(home) => Self::new(Path::new(&home).join(".cache").join("clwg").join("kcache")),
            Err(_) => Self::new(opts.temp_root().join("clwg-kcache")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn variant_dir(
        &self,
        program_hash: &blake3::Hash,
        device_i: usize,
        kernel: &str,
        spec: &WgSpecialization,
    ) -> PathBuf {
        self.root
            .join(program_hash.to_hex().as_str())
            .join(device_i.to_string())
            .join(kernel)
            .join(spec.variant_name())
    }

    /// Path of the work-group module for one kernel variant.
    pub fn work_group_path(
        &self,
        program_hash: &blake3::Hash,
        device_i: usize,
        kernel: &str,
        spec: &WgSpecialization,
    ) -> PathBuf {
        self.variant_dir(program_hash, device_i, kernel, spec)
            .join(WORK_GROUP_FILE)
    }

    /// Path of the linked binary for one kernel variant.
    pub fn final_binary_path(
        &self,
        program_hash: &blake3::Hash,
        device_i: usize,
        kernel: &str,
        spec: &WgSpecialization,
    ) -> PathBuf {
        self.variant_dir(program_hash, device_i, kernel, spec)
            .join(format!("{}.so", kernel))
    }

    /// Store `module` at `path` unless something is already there. The text
    /// goes to a sibling temp file first and is renamed into place, so a
    /// reader never sees a partial module.
    pub fn store_module(&self, path: &Path, module: &Module) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(|e| CompilerError::io(dir, e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".clwg-")
            .tempfile_in(dir)
            .map_err(|e| CompilerError::io(dir, e))?;
        std::io::Write::write_all(&mut tmp, module.to_text().as_bytes())
            .map_err(|e| CompilerError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| CompilerError::io(path, e.error))?;
        log::debug!("stored work-group module at {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::launch::LaunchCommand;

    #[test]
    fn test_paths_follow_layout() {
        let cache = KernelCache::new("/cache");
        let hash = blake3::hash(b"program");
        let spec = WgSpecialization::generic();
        let wg = cache.work_group_path(&hash, 1, "vector_add", &spec);
        assert_eq!(
            wg,
            PathBuf::from(format!("/cache/{}/1/vector_add/generic/parallel.bc", hash.to_hex()))
        );
        let so = cache.final_binary_path(&hash, 1, "vector_add", &spec);
        assert_eq!(so.parent(), wg.parent());
        assert_eq!(so.file_name().unwrap(), "vector_add.so");
    }

    #[test]
    fn test_variants_do_not_collide() {
        let cache = KernelCache::new("/cache");
        let hash = blake3::hash(b"program");
        let cmd = LaunchCommand::with_local_size([8, 1, 1]);
        let generic = WgSpecialization::resolve(&cmd, false, 0);
        let special = WgSpecialization::resolve(&cmd, true, 0);
        assert_ne!(
            cache.work_group_path(&hash, 0, "k", &generic),
            cache.work_group_path(&hash, 0, "k", &special)
        );
        let other = blake3::hash(b"other program");
        assert_ne!(
            cache.work_group_path(&hash, 0, "k", &generic),
            cache.work_group_path(&other, 0, "k", &generic)
        );
    }

    #[test]
    fn test_options_pick_the_root() {
        let opts = CompilerOptions::default().with_cache_dir("/somewhere/kcache");
        assert_eq!(KernelCache::from_options(&opts).root(), Path::new("/somewhere/kcache"));
    }

    #[test]
    fn test_store_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KernelCache::new(dir.path());
        let path = dir.path().join("h").join("0").join("k").join("generic").join(WORK_GROUP_FILE);
        let first = parse_module(include_str!("../tests/fixtures/vector_add.ir")).unwrap();
        cache.store_module(&path, &first).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.to_text());

        let second = parse_module(include_str!("../tests/fixtures/two_kernels.ir")).unwrap();
        cache.store_module(&path, &second).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.to_text());
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
