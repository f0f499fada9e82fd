//! Launch shapes and the launch metadata attached to kernel modules.
//!
//! The generator resolves a [`WgSpecialization`] from a [`LaunchCommand`],
//! bundles it with the device facts the passes need into a
//! [`LaunchMetadata`], and writes that once into module metadata. Passes
//! read it back as typed values.

use crate::device::DeviceDescriptor;
use crate::error::{CompilerError, Result};
use crate::ir::{MetaValue, Module};

/// Shape of one kernel enqueue, as seen by the compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LaunchCommand {
    pub local_size: [u64; 3],
    pub global_offset: [u64; 3],
    /// Number of work-groups per dimension.
    pub num_groups: [u64; 3],
    /// Never specialize for a small grid.
    pub force_large_grid_wg_func: bool,
}

impl LaunchCommand {
    pub fn with_local_size(local_size: [u64; 3]) -> Self {
        Self {
            local_size,
            num_groups: [1, 1, 1],
            ..Default::default()
        }
    }

    /// Widest grid dimension in work-items.
    pub fn max_grid_dim_width(&self) -> u64 {
        (0..3)
            .map(|d| self.local_size[d].saturating_mul(self.num_groups[d]))
            .max()
            .unwrap_or(0)
    }
}

/// What a work-group function variant may assume about its launches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WgSpecialization {
    pub local_size: [u64; 3],
    pub dynamic_local_size: bool,
    pub assume_zero_global_offset: bool,
    /// Zero means no small-grid specialization.
    pub max_grid_dim_width: u64,
}

impl WgSpecialization {
    /// The generic variant usable for every launch.
    pub fn generic() -> Self {
        Self {
            local_size: [0, 0, 0],
            dynamic_local_size: true,
            assume_zero_global_offset: false,
            max_grid_dim_width: 0,
        }
    }

    pub fn resolve(command: &LaunchCommand, specialize: bool, device_limit: u64) -> Self {
        if !specialize {
            return Self::generic();
        }
        let dynamic_local_size = command.local_size == [0, 0, 0];
        let assume_zero_global_offset = command.global_offset == [0, 0, 0];
        let max_grid_dim_width = if command.force_large_grid_wg_func
            || command.max_grid_dim_width() >= device_limit
        {
            0
        } else {
            device_limit
        };
        Self {
            local_size: command.local_size,
            dynamic_local_size,
            assume_zero_global_offset,
            max_grid_dim_width,
        }
    }

    /// Local size fixed at compile time, if any.
    pub fn static_local_size(&self) -> Option<[u64; 3]> {
        if self.dynamic_local_size {
            None
        } else {
            Some(self.local_size)
        }
    }

    /// Work-items in one group of a static local size; `None` when the size
    /// is dynamic or the product does not fit in a `u64`.
    pub fn static_work_items(&self) -> Option<u64> {
        let [x, y, z] = self.static_local_size()?;
        x.max(1).checked_mul(y.max(1))?.checked_mul(z.max(1))
    }

    /// Directory component naming this variant in the kernel cache.
    pub fn variant_name(&self) -> String {
        if *self == Self::generic() {
            return "generic".to_string();
        }
        let mut name = if self.dynamic_local_size {
            "dynamic".to_string()
        } else {
            format!(
                "{}-{}-{}",
                self.local_size[0], self.local_size[1], self.local_size[2]
            )
        };
        if self.assume_zero_global_offset {
            name.push_str("-goffs0");
        }
        if self.max_grid_dim_width != 0 {
            name.push_str("-smallgrid");
        }
        name
    }
}

/// Device address-space numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpaceIds {
    pub global: u32,
    pub local: u32,
    pub constant: u32,
    pub args: u32,
    pub context: u32,
}

/// Everything the pipeline learns about the launch through module metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchMetadata {
    pub kernel_name: String,
    pub device_aux_functions: Vec<String>,
    pub address_bits: u32,
    pub arg_buffer_launcher: bool,
    pub grid_launcher: bool,
    pub spmd: bool,
    pub spec: WgSpecialization,
    pub address_spaces: AddressSpaceIds,
    pub device_side_printf: bool,
    pub alloca_locals: bool,
    pub max_work_item_dimensions: u32,
    pub max_work_item_sizes: [u64; 3],
    pub max_work_group_size: u64,
}

mod key {
    pub const AUX_FUNCTIONS: &str = "device_aux_functions";
    pub const ADDRESS_BITS: &str = "device_address_bits";
    pub const ARG_BUFFER_LAUNCHER: &str = "device_arg_buffer_launcher";
    pub const GRID_LAUNCHER: &str = "device_grid_launcher";
    pub const IS_SPMD: &str = "device_is_spmd";
    pub const KERNEL_NAME: &str = "KernelName";
    pub const MAX_GRID_DIM_WIDTH: &str = "WGMaxGridDimWidth";
    pub const LOCAL_SIZE: [&str; 3] = ["WGLocalSizeX", "WGLocalSizeY", "WGLocalSizeZ"];
    pub const DYNAMIC_LOCAL_SIZE: &str = "WGDynamicLocalSize";
    pub const ZERO_GLOBAL_OFFSET: &str = "WGAssumeZeroGlobalOffset";
    pub const GLOBAL_AS: &str = "device_global_as_id";
    pub const LOCAL_AS: &str = "device_local_as_id";
    pub const CONSTANT_AS: &str = "device_constant_as_id";
    pub const ARGS_AS: &str = "device_args_as_id";
    pub const CONTEXT_AS: &str = "device_context_as_id";
    pub const PRINTF: &str = "device_side_printf";
    pub const ALLOCA_LOCALS: &str = "device_alloca_locals";
    pub const MAX_WI_DIM: &str = "device_max_witem_dim";
    pub const MAX_WI_SIZES: [&str; 3] = [
        "device_max_witem_sizes_0",
        "device_max_witem_sizes_1",
        "device_max_witem_sizes_2",
    ];
    pub const MAX_WG_SIZE: &str = "device_max_wg_size";
}

impl LaunchMetadata {
    pub fn new(device: &DeviceDescriptor, kernel_name: &str, spec: WgSpecialization) -> Self {
        Self {
            kernel_name: kernel_name.to_string(),
            device_aux_functions: device.device_aux_functions.clone(),
            address_bits: device.address_bits,
            arg_buffer_launcher: device.arg_buffer_launcher,
            grid_launcher: device.grid_launcher,
            spmd: device.spmd,
            spec,
            address_spaces: AddressSpaceIds {
                global: device.global_as_id,
                local: device.local_as_id,
                constant: device.constant_as_id,
                args: device.args_as_id,
                context: device.context_as_id,
            },
            device_side_printf: device.device_side_printf,
            alloca_locals: device.device_alloca_locals,
            max_work_item_dimensions: device.max_work_item_dimensions,
            max_work_item_sizes: device.max_work_item_sizes,
            max_work_group_size: device.max_work_group_size,
        }
    }

    pub fn write(&self, m: &mut Module) {
        m.set_meta(key::AUX_FUNCTIONS, MetaValue::Str(self.device_aux_functions.join(";")));
        m.set_meta(key::ADDRESS_BITS, MetaValue::Int(self.address_bits as u64));
        m.set_meta(key::ARG_BUFFER_LAUNCHER, MetaValue::Bool(self.arg_buffer_launcher));
        m.set_meta(key::GRID_LAUNCHER, MetaValue::Bool(self.grid_launcher));
        m.set_meta(key::IS_SPMD, MetaValue::Bool(self.spmd));
        m.set_meta(key::KERNEL_NAME, MetaValue::Str(self.kernel_name.clone()));
        m.set_meta(key::MAX_GRID_DIM_WIDTH, MetaValue::Int(self.spec.max_grid_dim_width));
        for d in 0..3 {
            m.set_meta(key::LOCAL_SIZE[d], MetaValue::Int(self.spec.local_size[d]));
            m.set_meta(key::MAX_WI_SIZES[d], MetaValue::Int(self.max_work_item_sizes[d]));
        }
        m.set_meta(key::DYNAMIC_LOCAL_SIZE, MetaValue::Bool(self.spec.dynamic_local_size));
        m.set_meta(
            key::ZERO_GLOBAL_OFFSET,
            MetaValue::Bool(self.spec.assume_zero_global_offset),
        );
        let a = &self.address_spaces;
        m.set_meta(key::GLOBAL_AS, MetaValue::Int(a.global as u64));
        m.set_meta(key::LOCAL_AS, MetaValue::Int(a.local as u64));
        m.set_meta(key::CONSTANT_AS, MetaValue::Int(a.constant as u64));
        m.set_meta(key::ARGS_AS, MetaValue::Int(a.args as u64));
        m.set_meta(key::CONTEXT_AS, MetaValue::Int(a.context as u64));
        m.set_meta(key::PRINTF, MetaValue::Bool(self.device_side_printf));
        m.set_meta(key::ALLOCA_LOCALS, MetaValue::Bool(self.alloca_locals));
        m.set_meta(key::MAX_WI_DIM, MetaValue::Int(self.max_work_item_dimensions as u64));
        m.set_meta(key::MAX_WG_SIZE, MetaValue::Int(self.max_work_group_size));
    }

    pub fn read(m: &Module) -> Result<Self> {
        let missing = |k: &str| CompilerError::InvalidMetadata(format!("missing or mistyped '!{}'", k));
        let int = |k: &str| m.meta_int(k).ok_or_else(|| missing(k));
        let flag = |k: &str| m.meta_bool(k).ok_or_else(|| missing(k));
        let text = |k: &str| m.meta_str(k).ok_or_else(|| missing(k));
        let small = |k: &str| -> Result<u32> {
            let v = int(k)?;
            u32::try_from(v).map_err(|_| {
                CompilerError::InvalidMetadata(format!("'!{}' out of range: {}", k, v))
            })
        };

        let aux = text(key::AUX_FUNCTIONS)?;
        let device_aux_functions = aux
            .split(';')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Ok(Self {
            kernel_name: text(key::KERNEL_NAME)?.to_string(),
            device_aux_functions,
            address_bits: small(key::ADDRESS_BITS)?,
            arg_buffer_launcher: flag(key::ARG_BUFFER_LAUNCHER)?,
            grid_launcher: flag(key::GRID_LAUNCHER)?,
            spmd: flag(key::IS_SPMD)?,
            spec: WgSpecialization {
                local_size: [
                    int(key::LOCAL_SIZE[0])?,
                    int(key::LOCAL_SIZE[1])?,
                    int(key::LOCAL_SIZE[2])?,
                ],
                dynamic_local_size: flag(key::DYNAMIC_LOCAL_SIZE)?,
                assume_zero_global_offset: flag(key::ZERO_GLOBAL_OFFSET)?,
                max_grid_dim_width: int(key::MAX_GRID_DIM_WIDTH)?,
            },
            address_spaces: AddressSpaceIds {
                global: small(key::GLOBAL_AS)?,
                local: small(key::LOCAL_AS)?,
                constant: small(key::CONSTANT_AS)?,
                args: small(key::ARGS_AS)?,
                context: small(key::CONTEXT_AS)?,
            },
            device_side_printf: flag(key::PRINTF)?,
            alloca_locals: flag(key::ALLOCA_LOCALS)?,
            max_work_item_dimensions: small(key::MAX_WI_DIM)?,
            max_work_item_sizes: [
                int(key::MAX_WI_SIZES[0])?,
                int(key::MAX_WI_SIZES[1])?,
                int(key::MAX_WI_SIZES[2])?,
            ],
            max_work_group_size: int(key::MAX_WG_SIZE)?,
        })
    }

    /// Upper bound on work-items per group, for sizing per-work-item storage.
    /// A static size larger than the device maximum falls back to the maximum.
    pub fn work_group_capacity(&self) -> u64 {
        let max = self.max_work_group_size.max(1);
        match self.spec.static_work_items() {
            Some(n) if n <= max => n,
            _ => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(local: [u64; 3], offset: [u64; 3], groups: [u64; 3]) -> LaunchCommand {
        LaunchCommand {
            local_size: local,
            global_offset: offset,
            num_groups: groups,
            force_large_grid_wg_func: false,
        }
    }

    #[test]
    fn test_unspecialized_is_generic() {
        let cmd = command([8, 4, 1], [0, 0, 0], [2, 2, 1]);
        let spec = WgSpecialization::resolve(&cmd, false, 1024);
        assert_eq!(spec, WgSpecialization::generic());
        assert!(spec.dynamic_local_size);
        assert_eq!(spec.variant_name(), "generic");
    }

    #[test]
    fn test_zero_local_size_is_dynamic() {
        let cmd = command([0, 0, 0], [0, 0, 0], [1, 1, 1]);
        let spec = WgSpecialization::resolve(&cmd, true, 1024);
        assert!(spec.dynamic_local_size);
        assert_eq!(spec.local_size, [0, 0, 0]);
        assert_eq!(spec.static_local_size(), None);
    }

    #[test]
    fn test_zero_offsets_assumed() {
        let spec = WgSpecialization::resolve(&command([8, 1, 1], [0, 0, 0], [4, 1, 1]), true, 1024);
        assert!(spec.assume_zero_global_offset);
        let spec = WgSpecialization::resolve(&command([8, 1, 1], [0, 16, 0], [4, 1, 1]), true, 1024);
        assert!(!spec.assume_zero_global_offset);
    }

    #[test]
    fn test_grid_width_limit() {
        // 8 * 4 = 32 work-items wide: under the limit.
        let small = command([8, 1, 1], [0, 0, 0], [4, 1, 1]);
        assert_eq!(WgSpecialization::resolve(&small, true, 1024).max_grid_dim_width, 1024);
        // Exactly at the limit.
        let wide = command([8, 1, 1], [0, 0, 0], [128, 1, 1]);
        assert_eq!(WgSpecialization::resolve(&wide, true, 1024).max_grid_dim_width, 0);
        let mut forced = small.clone();
        forced.force_large_grid_wg_func = true;
        assert_eq!(WgSpecialization::resolve(&forced, true, 1024).max_grid_dim_width, 0);
    }

    #[test]
    fn test_variant_names_differ() {
        let a = WgSpecialization::resolve(&command([8, 1, 1], [0, 0, 0], [4, 1, 1]), true, 1024);
        let b = WgSpecialization::resolve(&command([8, 1, 1], [1, 0, 0], [4, 1, 1]), true, 1024);
        assert_eq!(a.variant_name(), "8-1-1-goffs0-smallgrid");
        assert_eq!(b.variant_name(), "8-1-1-smallgrid");
    }

    #[test]
    fn test_metadata_written_and_read_back() {
        let device = DeviceDescriptor::host_cpu();
        let spec = WgSpecialization::resolve(&command([16, 2, 1], [0, 0, 0], [1, 1, 1]), true, 1 << 20);
        let meta = LaunchMetadata::new(&device, "reduce", spec);
        let mut m = Module::new("k");
        meta.write(&mut m);
        assert_eq!(m.meta_str("KernelName"), Some("reduce"));
        assert_eq!(m.meta_int("WGLocalSizeY"), Some(2));
        assert_eq!(m.meta_bool("WGDynamicLocalSize"), Some(false));
        assert_eq!(LaunchMetadata::read(&m).unwrap(), meta);
        assert_eq!(meta.work_group_capacity(), 32);
    }

    #[test]
    fn test_metadata_survives_text_form() {
        let mut device = DeviceDescriptor::host_cpu();
        device.device_aux_functions = vec!["a".into(), "b".into()];
        let meta = LaunchMetadata::new(&device, "k", WgSpecialization::generic());
        let mut m = Module::new("k");
        meta.write(&mut m);
        let back = crate::ir::parse_module(&m.to_text()).unwrap();
        let read = LaunchMetadata::read(&back).unwrap();
        assert_eq!(read.device_aux_functions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(read.work_group_capacity(), device.max_work_group_size);
    }

    #[test]
    fn test_capacity_of_oversized_local_size() {
        let device = DeviceDescriptor::host_cpu();
        let cmd = command([1 << 22; 3], [0; 3], [1; 3]);
        let spec = WgSpecialization::resolve(&cmd, true, device.grid_width_specialization_limit);
        assert_eq!(spec.static_work_items(), None);
        let meta = LaunchMetadata::new(&device, "k", spec);
        assert_eq!(meta.work_group_capacity(), device.max_work_group_size);

        let cmd = command([4096, 2, 1], [0; 3], [1; 3]);
        let spec = WgSpecialization::resolve(&cmd, true, device.grid_width_specialization_limit);
        assert_eq!(spec.static_work_items(), Some(8192));
        let meta = LaunchMetadata::new(&device, "k", spec);
        assert_eq!(meta.work_group_capacity(), 4096);
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let err = LaunchMetadata::read(&Module::new("bare")).unwrap_err();
        assert!(matches!(err, CompilerError::InvalidMetadata(_)));
    }
}
