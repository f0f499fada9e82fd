//! Work-group function generation.
//!
//! A request names a kernel and a launch shape. The kernel is copied out
//! of the program together with the device's auxiliary functions, the
//! resolved specialization is written into the module as launch metadata,
//! and the device pipeline turns the per-work-item kernel into a
//! per-work-group function. A configured finalizer command gets the last
//! word on the result.
//!
//! The finalizer sees the module after the pipeline and before code
//! generation. Its output is parsed back and returned as is; the pipeline
//! does not run again.

mod finalizer;
#[cfg(test)]
mod tests;

pub use finalizer::run_finalizer;

use crate::config::CompilerOptions;
use crate::device::DeviceDescriptor;
use crate::error::{CompilerError, Result};
use crate::ir::Module;
use crate::launch::{LaunchCommand, LaunchMetadata, WgSpecialization};
use crate::pipeline::Pipeline;
use crate::program::copy_kernel;

/// One work-group function to build.
#[derive(Clone, Copy, Debug)]
pub struct WorkGroupRequest<'a> {
    pub device_i: usize,
    pub device: &'a DeviceDescriptor,
    pub kernel: &'a str,
    pub command: &'a LaunchCommand,
    pub specialize: bool,
}

impl<'a> WorkGroupRequest<'a> {
    pub fn new(
        device_i: usize,
        device: &'a DeviceDescriptor,
        kernel: &'a str,
        command: &'a LaunchCommand,
    ) -> Self {
        Self {
            device_i,
            device,
            kernel,
            command,
            specialize: false,
        }
    }

    pub fn specialized(mut self, on: bool) -> Self {
        self.specialize = on;
        self
    }

    /// What the variant may assume, given the device's grid-width limit.
    pub fn specialization(&self) -> WgSpecialization {
        WgSpecialization::resolve(
            self.command,
            self.specialize,
            self.device.grid_width_specialization_limit,
        )
    }
}

/// Build the work-group module for `req` from the program's IR.
pub fn build_work_group_module(
    program: &Module,
    req: &WorkGroupRequest<'_>,
    pipeline: &Pipeline,
    opts: &CompilerOptions,
) -> Result<Module> {
    let spec = req.specialization();
    if spec.static_local_size().is_some() {
        let max = req.device.max_work_group_size;
        if spec.static_work_items().map_or(true, |n| n > max) {
            let [x, y, z] = spec.local_size;
            return Err(CompilerError::InvalidMetadata(format!(
                "local size {}x{}x{} exceeds the device limit of {} work-items",
                x, y, z, max
            )));
        }
    }
    let mut module = copy_kernel(program, req.kernel, &req.device.device_aux_functions)?;

    log::debug!(
        "generating work-group function for '{}' on {} ({})",
        req.kernel,
        req.device.id,
        spec.variant_name()
    );
    LaunchMetadata::new(req.device, req.kernel, spec).write(&mut module);

    let remarks = pipeline.run(&mut module, opts)?;
    if opts.vectorizer_remarks {
        for remark in &remarks {
            log::info!("{}: {}", req.kernel, remark);
        }
    }

    match &opts.bitcode_finalizer {
        Some(command) => run_finalizer(command, &module, opts),
        None => Ok(module),
    }
}
