//! Compiler contexts and the process-wide toolchain they share.
//!
//! A [`Toolchain`] holds the per-device backend and pipeline caches. It is
//! created once, handed to every [`CompilerContext`] through an `Arc` and
//! torn down with an explicit [`Toolchain::shutdown`].
//!
//! A [`CompilerContext`] serializes all compiler work of one OpenCL
//! context: each entry point holds the compilation mutex until it returns.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cache::KernelCache;
use crate::config::CompilerOptions;
use crate::device::DeviceDescriptor;
use crate::emit::{self, Emitted};
use crate::error::{CompilerError, Result};
use crate::ir::Module;
use crate::pipeline::{Pipeline, PipelineCache};
use crate::program::Program;
use crate::target::{Backend, BackendFactory};
use crate::tools;
use crate::workgroup::{build_work_group_module, WorkGroupRequest};

// ─── Toolchain ────────────────────────────────────────────────────

/// Backends and pipelines, one of each per device.
#[derive(Default)]
pub struct Toolchain {
    backends: BackendFactory,
    pipelines: PipelineCache,
}

impl Toolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn backend(&self, device: &DeviceDescriptor, opts: &CompilerOptions) -> Option<Arc<Backend>> {
        self.backends.get(device, opts)
    }

    pub fn pipeline(&self, device: &DeviceDescriptor, opts: &CompilerOptions) -> Arc<Pipeline> {
        self.pipelines.pipeline_for(device, opts, &self.backends)
    }

    pub fn backends(&self) -> &BackendFactory {
        &self.backends
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Drop every cached backend and pipeline.
    pub fn shutdown(&self) {
        log::debug!(
            "toolchain shutdown: {} pipelines, {} backends",
            self.pipelines.len(),
            self.backends.len()
        );
        self.pipelines.clear();
        self.backends.clear();
    }
}

// ─── Compiler context ─────────────────────────────────────────────

/// State guarded by the compilation mutex.
#[derive(Debug, Default)]
pub struct ContextState {
    /// IR modules handed out and not yet released.
    live_irs: usize,
}

/// Outcome of [`CompilerContext::generate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generated {
    /// A work-group module or final binary was already on disk.
    Cached(PathBuf),
    /// A new work-group module was written.
    Written(PathBuf),
}

impl Generated {
    pub fn path(&self) -> &Path {
        match self {
            Generated::Cached(p) | Generated::Written(p) => p,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, Generated::Cached(_))
    }
}

pub struct CompilerContext {
    state: Mutex<ContextState>,
    opts: CompilerOptions,
    toolchain: Arc<Toolchain>,
    cache: KernelCache,
}

impl CompilerContext {
    pub fn new(opts: CompilerOptions, toolchain: Arc<Toolchain>) -> Self {
        let cache = KernelCache::from_options(&opts);
        Self {
            state: Mutex::new(ContextState::default()),
            opts,
            toolchain,
            cache,
        }
    }

    pub fn with_cache(mut self, cache: KernelCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.opts
    }

    pub fn toolchain(&self) -> &Arc<Toolchain> {
        &self.toolchain
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    /// Number of IR modules currently alive in this context.
    pub fn live_irs(&self) -> usize {
        self.lock().live_irs
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse the program IR for `device_i` unless it is already loaded. The
    /// program's binary is used when it has one, else the file at `path`.
    pub fn read_program_ir(
        &self,
        program: &mut Program,
        device_i: usize,
        device: &DeviceDescriptor,
        path: Option<&Path>,
    ) -> Result<()> {
        let mut state = self.lock();
        if program.is_loaded(device_i) {
            return Ok(());
        }
        let bytes = match (program.binary(device_i), path) {
            (bin, _) if !bin.is_empty() => bin.to_vec(),
            (_, Some(path)) => tools::read_file(path)?,
            (_, None) => return Err(CompilerError::ProgramNotLoaded(device_i)),
        };
        program.load(device_i, &bytes, device.program_scope_variables_pass)?;
        state.live_irs += 1;
        log::debug!(
            "loaded program IR for device {} ({} bytes of program-scope storage)",
            device_i,
            program.scope_storage_size(device_i)
        );
        Ok(())
    }

    pub fn free_program_ir(&self, program: &mut Program, device_i: usize) {
        let mut state = self.lock();
        if program.unload(device_i) {
            state.live_irs = state.live_irs.saturating_sub(1);
        }
    }

    /// Release a module returned by [`CompilerContext::generate_nowrite`].
    pub fn destroy_module(&self, module: Module) {
        let mut state = self.lock();
        drop(module);
        state.live_irs = state.live_irs.saturating_sub(1);
    }

    /// Build the work-group module for `req` and hand it to the caller.
    pub fn generate_nowrite(&self, program: &Program, req: &WorkGroupRequest<'_>) -> Result<Module> {
        let mut state = self.lock();
        self.generate_locked(&mut state, program, req)
    }

    fn generate_locked(
        &self,
        state: &mut ContextState,
        program: &Program,
        req: &WorkGroupRequest<'_>,
    ) -> Result<Module> {
        let ir = program.ir(req.device_i)?;
        let pipeline = self.toolchain.pipeline(req.device, &self.opts);
        let module = build_work_group_module(ir, req, &pipeline, &self.opts)?;
        state.live_irs += 1;
        Ok(module)
    }

    /// Make sure the work-group module for `req` is in the kernel cache.
    /// Nothing is compiled when it, or the final binary, is already there.
    pub fn generate(
        &self,
        program: &Program,
        req: &WorkGroupRequest<'_>,
        build_log: &mut String,
    ) -> Result<Generated> {
        let mut state = self.lock();
        let result = self.generate_cached(&mut state, program, req);
        if let Err(e) = &result {
            e.log_to(build_log);
        }
        result
    }

    fn generate_cached(
        &self,
        state: &mut ContextState,
        program: &Program,
        req: &WorkGroupRequest<'_>,
    ) -> Result<Generated> {
        let hash = program.hash(req.device_i)?;
        let spec = req.specialization();
        let wg_path = self.cache.work_group_path(&hash, req.device_i, req.kernel, &spec);
        if wg_path.exists() {
            log::debug!("cache hit: {}", wg_path.display());
            return Ok(Generated::Cached(wg_path));
        }
        let binary = self.cache.final_binary_path(&hash, req.device_i, req.kernel, &spec);
        if binary.exists() {
            log::debug!("cache hit: {}", binary.display());
            return Ok(Generated::Cached(binary));
        }

        let module = self.generate_locked(state, program, req)?;
        let stored = self.cache.store_module(&wg_path, &module);
        drop(module);
        state.live_irs = state.live_irs.saturating_sub(1);
        stored.map(|()| Generated::Written(wg_path))
    }

    /// Lower `module` to an object for `device`.
    pub fn codegen(&self, device: &DeviceDescriptor, module: &Module) -> Result<Emitted> {
        let _state = self.lock();
        let backend = self
            .toolchain
            .backend(device, &self.opts)
            .ok_or_else(|| CompilerError::NoBackend(device.triple.clone()))?;
        emit::codegen(&backend, module, &self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchCommand;

    const VECTOR_ADD: &str = include_str!("../tests/fixtures/vector_add.ir");

    fn setup(dir: &Path) -> (CompilerContext, Program, DeviceDescriptor) {
        let opts = CompilerOptions::default().with_verify(true).with_temp_dir(dir);
        let cx = CompilerContext::new(opts, Toolchain::shared())
            .with_cache(KernelCache::new(dir.join("kcache")));
        let program = Program::new(vec![VECTOR_ADD.as_bytes().to_vec()]);
        (cx, program, DeviceDescriptor::host_cpu())
    }

    #[test]
    fn test_read_program_ir_once() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, mut program, device) = setup(dir.path());
        cx.read_program_ir(&mut program, 0, &device, None).unwrap();
        cx.read_program_ir(&mut program, 0, &device, None).unwrap();
        assert_eq!(cx.live_irs(), 1);
        cx.free_program_ir(&mut program, 0);
        assert_eq!(cx.live_irs(), 0);
        assert!(!program.is_loaded(0));
        cx.free_program_ir(&mut program, 0);
        assert_eq!(cx.live_irs(), 0);
    }

    #[test]
    fn test_read_program_ir_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, _, device) = setup(dir.path());
        let path = dir.path().join("program.ir");
        std::fs::write(&path, VECTOR_ADD).unwrap();
        let mut program = Program::new(vec![Vec::new()]);
        assert!(matches!(
            cx.read_program_ir(&mut program, 0, &device, None),
            Err(CompilerError::ProgramNotLoaded(0))
        ));
        cx.read_program_ir(&mut program, 0, &device, Some(&path)).unwrap();
        assert_eq!(program.hash(0).unwrap(), blake3::hash(VECTOR_ADD.as_bytes()));
    }

    #[test]
    fn test_nowrite_hands_out_a_module() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, mut program, device) = setup(dir.path());
        cx.read_program_ir(&mut program, 0, &device, None).unwrap();
        let cmd = LaunchCommand::with_local_size([4, 1, 1]);
        let req = WorkGroupRequest::new(0, &device, "vector_add", &cmd);
        let m = cx.generate_nowrite(&program, &req).unwrap();
        assert_eq!(cx.live_irs(), 2);
        assert!(m.function("_wg_vector_add").is_some());
        cx.destroy_module(m);
        assert_eq!(cx.live_irs(), 1);
    }

    #[test]
    fn test_generate_hits_cache_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, mut program, device) = setup(dir.path());
        cx.read_program_ir(&mut program, 0, &device, None).unwrap();
        let cmd = LaunchCommand::with_local_size([8, 1, 1]);
        let req = WorkGroupRequest::new(0, &device, "vector_add", &cmd).specialized(true);
        let mut log = String::new();

        let first = cx.generate(&program, &req, &mut log).unwrap();
        assert!(!first.was_cached());
        assert!(first.path().exists());
        let runs = cx.toolchain().pipeline(&device, cx.options()).runs();
        assert_eq!(runs, 1);

        let second = cx.generate(&program, &req, &mut log).unwrap();
        assert!(second.was_cached());
        assert_eq!(second.path(), first.path());
        assert_eq!(cx.toolchain().pipeline(&device, cx.options()).runs(), runs);
        assert_eq!(cx.live_irs(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_generate_unknown_kernel_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, mut program, device) = setup(dir.path());
        cx.read_program_ir(&mut program, 0, &device, None).unwrap();
        let cmd = LaunchCommand::default();
        let req = WorkGroupRequest::new(0, &device, "missing", &cmd);
        let mut log = String::new();
        assert!(cx.generate(&program, &req, &mut log).is_err());
        assert_eq!(log, "kernel 'missing' not found in program\n");
    }

    #[test]
    fn test_codegen_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (cx, _, _) = setup(dir.path());
        let spir = DeviceDescriptor::spmd_gpu()
            .with_id(7)
            .with_triple("spir64-unknown-unknown");
        let m = crate::ir::parse_module(VECTOR_ADD).unwrap();
        let err = cx.codegen(&spir, &m).unwrap_err();
        assert!(matches!(err, CompilerError::NoBackend(ref t) if t == "spir64-unknown-unknown"));
    }

    #[test]
    fn test_shutdown_clears_caches() {
        let tc = Toolchain::new();
        let opts = CompilerOptions::default();
        let device = DeviceDescriptor::host_cpu();
        let p = tc.pipeline(&device, &opts);
        assert!(tc.backend(&device, &opts).is_some());
        tc.shutdown();
        assert!(tc.pipelines().is_empty());
        assert!(tc.backends().is_empty());
        assert!(!Arc::ptr_eq(&p, &tc.pipeline(&device, &opts)));
    }
}
