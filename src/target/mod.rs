//! Native targets and the per-device backend factory.
//!
//! A [`Target`] is a static registry entry found by triple. A
//! [`TargetMachine`] binds a target to a CPU, a feature string and code
//! generation options. A [`Backend`] wraps a machine with the lowering for
//! its architecture and emits object files or assembly text.

mod aarch64;
mod asm;
pub mod object;
mod riscv;
mod x86_64;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{CompilerOptions, FloatAbi};
use crate::device::{DeviceDescriptor, DeviceId};
use crate::ir::{Inst, Module, Terminator};

pub use aarch64::Aarch64Lowering;
pub use riscv::{RiscVLowering, NO_ATTRIBUTES_KEY as RISCV_NO_ATTRIBUTES_KEY};
pub use x86_64::X86_64Lowering;

// ─── Registry ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    RiscV64,
    /// Placeholder matched by every triple; has no code generator.
    Cpp,
}

/// A registered native target.
#[derive(Debug)]
pub struct Target {
    pub name: &'static str,
    pub arch: Arch,
    pub description: &'static str,
}

impl Target {
    /// Whether this entry can actually generate code.
    pub fn is_usable(&self) -> bool {
        self.arch != Arch::Cpp
    }
}

static TARGETS: [Target; 4] = [
    Target {
        name: "x86-64",
        arch: Arch::X86_64,
        description: "64-bit X86: EM64T and AMD64",
    },
    Target {
        name: "aarch64",
        arch: Arch::Aarch64,
        description: "AArch64 (little endian)",
    },
    Target {
        name: "riscv64",
        arch: Arch::RiscV64,
        description: "64-bit RISC-V",
    },
    Target {
        name: "cpp",
        arch: Arch::Cpp,
        description: "C++ source fallback",
    },
];

/// Find the target for a triple. Triples with an unknown architecture get
/// the `cpp` catch-all; pure-IR (`spir`, `spir64`) triples get nothing.
pub fn lookup_target(triple: &str) -> Option<&'static Target> {
    let arch = triple.split('-').next().unwrap_or("");
    let wanted = match arch {
        "spir" | "spir64" => return None,
        "x86_64" | "amd64" => Arch::X86_64,
        "aarch64" | "arm64" => Arch::Aarch64,
        "riscv64" => Arch::RiscV64,
        _ => Arch::Cpp,
    };
    TARGETS.iter().find(|t| t.arch == wanted)
}

pub fn registered_targets() -> &'static [Target] {
    &TARGETS
}

// ─── Target machine ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocModel {
    Static,
    Pic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeModel {
    Small,
    Large,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    None,
    Less,
    Default,
    Aggressive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Object,
    Assembly,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetMachine {
    pub triple: String,
    pub cpu: String,
    pub features: String,
    pub float_abi: FloatAbi,
    pub reloc: RelocModel,
    pub code_model: CodeModel,
    pub opt_level: OptLevel,
}

impl TargetMachine {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features
            .split(',')
            .any(|f| f.trim_start_matches('+') == feature.trim_start_matches('+'))
    }
}

/// Feature string a target family starts from.
pub fn default_features(arch: Arch) -> &'static str {
    match arch {
        Arch::RiscV64 => "+m,+f",
        Arch::Aarch64 => "+neon",
        Arch::X86_64 | Arch::Cpp => "",
    }
}

/// Facts about the target the optimization pipeline may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetInfo {
    pub arch: Arch,
    /// Widest vector register in bits, 0 when there is no vector unit.
    pub vector_bits: u32,
    pub pointer_bits: u32,
}

impl TargetInfo {
    /// Number of `elem_bits`-wide lanes in one vector register.
    pub fn lanes(&self, elem_bits: u32) -> u32 {
        if elem_bits == 0 {
            return 0;
        }
        self.vector_bits / elem_bits
    }
}

// ─── Lowering ─────────────────────────────────────────────────────

/// Per-architecture instruction selection for the assembly listing.
pub trait ArchLowering: Send + Sync {
    fn arch(&self) -> Arch;

    /// ELF `e_machine`, or `None` when this backend cannot write objects.
    fn elf_machine(&self) -> Option<u16>;

    /// File-level directives opening the listing.
    fn file_header(&self, machine: &TargetMachine, module: &Module) -> Vec<String>;

    fn mnemonic(&self, inst: &Inst) -> &'static str;

    fn terminator_mnemonic(&self, term: &Terminator) -> &'static str;

    /// Line comment leader.
    fn comment(&self) -> &'static str {
        "#"
    }

    /// Argument of the `.type` directive for functions.
    fn symbol_type(&self) -> &'static str {
        "@function"
    }

    fn vector_bits(&self, machine: &TargetMachine) -> u32;
}

fn lowering_for(arch: Arch) -> Option<Box<dyn ArchLowering>> {
    match arch {
        Arch::X86_64 => Some(Box::new(X86_64Lowering)),
        Arch::Aarch64 => Some(Box::new(Aarch64Lowering)),
        Arch::RiscV64 => Some(Box::new(RiscVLowering)),
        Arch::Cpp => None,
    }
}

// ─── Backend ──────────────────────────────────────────────────────

/// A native code generator bound to one device's target machine.
pub struct Backend {
    target: &'static Target,
    machine: TargetMachine,
    lowering: Box<dyn ArchLowering>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("target", &self.target.name)
            .field("machine", &self.machine)
            .finish()
    }
}

impl Backend {
    /// Create the backend for a device, or `None` when its triple has no
    /// usable target.
    pub fn create(device: &DeviceDescriptor, opts: &CompilerOptions) -> Option<Self> {
        let Some(target) = lookup_target(&device.triple) else {
            if !device.is_spir() {
                log::warn!("no target registered for triple '{}'", device.triple);
            }
            return None;
        };
        if !target.is_usable() {
            log::warn!(
                "triple '{}' only matches the '{}' fallback; no native backend",
                device.triple,
                target.name
            );
            return None;
        }
        let lowering = lowering_for(target.arch)?;
        let mut machine = TargetMachine {
            triple: device.triple.clone(),
            cpu: device.cpu.clone(),
            features: default_features(target.arch).to_string(),
            float_abi: opts.float_abi,
            reloc: RelocModel::Pic,
            code_model: CodeModel::Small,
            opt_level: OptLevel::Aggressive,
        };
        if let Some(hook) = &device.init_target_machine {
            (hook.0)(&mut machine);
        }
        log::debug!(
            "created {} backend for {} (cpu '{}', features '{}')",
            target.name,
            device.id,
            machine.cpu,
            machine.features
        );
        Some(Self {
            target,
            machine,
            lowering,
        })
    }

    pub fn target(&self) -> &'static Target {
        self.target
    }

    pub fn machine(&self) -> &TargetMachine {
        &self.machine
    }

    pub fn target_info(&self) -> TargetInfo {
        TargetInfo {
            arch: self.target.arch,
            vector_bits: self.lowering.vector_bits(&self.machine),
            pointer_bits: 64,
        }
    }

    pub fn supports(&self, file_type: FileType) -> bool {
        match file_type {
            FileType::Assembly => true,
            FileType::Object => self.lowering.elf_machine().is_some(),
        }
    }

    /// Lower `module` to the requested file type, or `None` when this
    /// backend cannot produce it.
    pub fn emit(&self, module: &Module, file_type: FileType) -> Option<Vec<u8>> {
        if !self.supports(file_type) {
            return None;
        }
        match file_type {
            FileType::Assembly => {
                Some(asm::listing(self.lowering.as_ref(), &self.machine, module).into_bytes())
            }
            FileType::Object => {
                let e_machine = self.lowering.elf_machine()?;
                let functions = asm::function_bodies(self.lowering.as_ref(), module);
                Some(object::write_relocatable(e_machine, &functions))
            }
        }
    }
}

// ─── Factory ──────────────────────────────────────────────────────

/// Process-wide cache of backends, one per device.
#[derive(Default)]
pub struct BackendFactory {
    backends: Mutex<HashMap<DeviceId, Arc<Backend>>>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's backend, created on first use. `None` when the device's
    /// triple has no usable target; callers carry on without target
    /// analyses.
    pub fn get(&self, device: &DeviceDescriptor, opts: &CompilerOptions) -> Option<Arc<Backend>> {
        let mut backends = self.backends.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = backends.get(&device.id) {
            return Some(Arc::clone(b));
        }
        let backend = Arc::new(Backend::create(device, opts)?);
        backends.insert(device.id, Arc::clone(&backend));
        Some(backend)
    }

    pub fn len(&self) -> usize {
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached backend.
    pub fn clear(&self) {
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
