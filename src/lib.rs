pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod diagnostic;
pub mod emit;
pub mod error;
pub mod ir;
pub mod launch;
pub mod passes;
pub mod pipeline;
pub mod program;
pub mod spirv;
pub mod target;
pub mod tools;
pub mod workgroup;

// Re-exports: the types most callers need, at the crate root
pub use cache::KernelCache;
pub use config::{CompilerOptions, WorkGroupMethod};
pub use context::{CompilerContext, Generated, Toolchain};
pub use device::DeviceDescriptor;
pub use emit::{EmitPath, Emitted};
pub use error::{CompilerError, Result};
pub use launch::{LaunchCommand, WgSpecialization};
pub use pipeline::{Pipeline, PipelineStep, STANDARD_OPTS};
pub use program::{Program, ProgramContext};
pub use workgroup::WorkGroupRequest;
