//! Device descriptors.
//!
//! A descriptor is owned by whoever enumerates devices; the compiler only
//! reads it. The CLI loads descriptors from JSON.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, Result};
use crate::target::TargetMachine;

/// Stable identity of a device, used as the key of the process-wide
/// backend and pipeline caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Device families that need their own passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    #[default]
    Generic,
    /// RISC-V based Vortex GPGPU.
    Vortex,
}

/// Hook run once on every freshly created target machine of a device.
#[derive(Clone)]
pub struct InitHook(pub Arc<dyn Fn(&mut TargetMachine) + Send + Sync>);

impl InitHook {
    pub fn new(f: impl Fn(&mut TargetMachine) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for InitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InitHook(..)")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub triple: String,
    pub cpu: String,
    pub family: DeviceFamily,
    /// Work-items run in lock-step on hardware; no work-item loops.
    pub spmd: bool,
    pub address_bits: u32,

    pub global_as_id: u32,
    pub local_as_id: u32,
    pub constant_as_id: u32,
    pub args_as_id: u32,
    pub context_as_id: u32,

    pub max_work_item_dimensions: u32,
    pub max_work_item_sizes: [u64; 3],
    pub max_work_group_size: u64,
    /// Grid width up to which launchers may be specialized for small grids.
    pub grid_width_specialization_limit: u64,
    /// Functions the device links into every kernel module.
    pub device_aux_functions: Vec<String>,

    pub workgroup_pass: bool,
    pub arg_buffer_launcher: bool,
    pub grid_launcher: bool,
    pub device_side_printf: bool,
    pub device_alloca_locals: bool,
    pub program_scope_variables_pass: bool,
    pub autolocals_to_args: bool,

    #[serde(skip)]
    pub init_target_machine: Option<InitHook>,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self::host_cpu()
    }
}

impl DeviceDescriptor {
    /// A multi-core x86-64 CPU device: work-item loops, argument-buffer
    /// launcher, automatic locals passed as arguments.
    pub fn host_cpu() -> Self {
        Self {
            id: DeviceId(0),
            name: "cpu".to_string(),
            triple: "x86_64-unknown-linux-gnu".to_string(),
            cpu: "x86-64".to_string(),
            family: DeviceFamily::Generic,
            spmd: false,
            address_bits: 64,
            global_as_id: 1,
            local_as_id: 3,
            constant_as_id: 2,
            args_as_id: 0,
            context_as_id: 0,
            max_work_item_dimensions: 3,
            max_work_item_sizes: [4096, 4096, 4096],
            max_work_group_size: 4096,
            grid_width_specialization_limit: 1 << 32,
            device_aux_functions: Vec::new(),
            workgroup_pass: true,
            arg_buffer_launcher: true,
            grid_launcher: false,
            device_side_printf: true,
            device_alloca_locals: false,
            program_scope_variables_pass: true,
            autolocals_to_args: true,
            init_target_machine: None,
        }
    }

    /// A lock-step device: hardware provides work-item ids, no launcher.
    pub fn spmd_gpu() -> Self {
        Self {
            id: DeviceId(1),
            name: "spmd-gpu".to_string(),
            spmd: true,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            workgroup_pass: false,
            arg_buffer_launcher: false,
            device_side_printf: false,
            device_alloca_locals: true,
            program_scope_variables_pass: false,
            autolocals_to_args: false,
            ..Self::host_cpu()
        }
    }

    /// A Vortex RISC-V GPGPU.
    pub fn vortex() -> Self {
        Self {
            id: DeviceId(2),
            name: "vortex".to_string(),
            triple: "riscv64-unknown-elf".to_string(),
            cpu: "generic-rv64".to_string(),
            family: DeviceFamily::Vortex,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 1024],
            grid_launcher: true,
            device_aux_functions: vec!["vx_num_warps".to_string()],
            ..Self::host_cpu()
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = DeviceId(id);
        self
    }

    pub fn with_triple(mut self, triple: impl Into<String>) -> Self {
        self.triple = triple.into();
        self
    }

    pub fn with_init_hook(mut self, hook: InitHook) -> Self {
        self.init_target_machine = Some(hook);
        self
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CompilerError::io(path, e))?;
        Self::from_json(&text).map_err(|e| {
            CompilerError::InvalidMetadata(format!("{}: {}", path.display(), e))
        })
    }

    /// Whether the triple names a pure-IR target with no native code.
    pub fn is_spir(&self) -> bool {
        let arch = self.triple.split('-').next().unwrap_or("");
        arch == "spir" || arch == "spir64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_fills_defaults() {
        let d = DeviceDescriptor::from_json(r#"{"id": 7, "spmd": true, "family": "vortex"}"#)
            .unwrap();
        assert_eq!(d.id, DeviceId(7));
        assert!(d.spmd);
        assert_eq!(d.family, DeviceFamily::Vortex);
        assert_eq!(d.triple, "x86_64-unknown-linux-gnu");
        assert!(d.init_target_machine.is_none());
    }

    #[test]
    fn test_json_rejects_unknown_family() {
        assert!(DeviceDescriptor::from_json(r#"{"family": "fpga"}"#).is_err());
    }

    #[test]
    fn test_json_round_trip_skips_hook() {
        let d = DeviceDescriptor::host_cpu().with_init_hook(InitHook::new(|_| {}));
        let text = serde_json::to_string(&d).unwrap();
        assert!(!text.contains("init_target_machine"));
        let back = DeviceDescriptor::from_json(&text).unwrap();
        assert_eq!(back.max_work_item_sizes, d.max_work_item_sizes);
        assert!(back.init_target_machine.is_none());
    }

    #[test]
    fn test_spir_detection() {
        assert!(DeviceDescriptor::host_cpu().with_triple("spir64-unknown-unknown").is_spir());
        assert!(DeviceDescriptor::host_cpu().with_triple("spir").is_spir());
        assert!(!DeviceDescriptor::host_cpu().is_spir());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = DeviceDescriptor::load(&path).unwrap_err();
        assert!(err.to_string().contains("dev.json"));
    }
}
