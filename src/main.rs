use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use clwg::{
    CompilerContext, CompilerError, CompilerOptions, DeviceDescriptor, LaunchCommand, Program,
    ProgramContext, Toolchain, WorkGroupMethod, WorkGroupRequest,
};

#[derive(Parser)]
#[command(
    name = "clwg",
    version,
    about = "OpenCL kernel to work-group function compiler"
)]
struct Cli {
    /// Work-group method (overrides CLWG_WORK_GROUP_METHOD)
    #[arg(long, global = true)]
    wg_method: Option<WorkGroupMethod>,
    /// Run the IR verifier between passes
    #[arg(long, global = true)]
    verify: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the work-group pipeline for a device
    Passes {
        /// Device description: a JSON file or one of cpu, spmd-gpu, vortex
        #[arg(long, default_value = "cpu")]
        device: String,
        /// Expand STANDARD_OPTS into its passes
        #[arg(long)]
        expand: bool,
    },
    /// Extract one kernel and its call graph into its own module
    Extract {
        /// Program IR file
        input: PathBuf,
        /// Kernel name
        #[arg(short, long)]
        kernel: String,
        /// Output IR file (default: <kernel>.ir)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Where to write the program-scope globals module
        #[arg(long, value_name = "PATH")]
        globals: Option<PathBuf>,
    },
    /// Build a kernel's work-group function and emit an object file
    Compile {
        /// Program IR file
        input: PathBuf,
        /// Device description: a JSON file or one of cpu, spmd-gpu, vortex
        #[arg(long, default_value = "cpu")]
        device: String,
        /// Kernel name
        #[arg(short, long)]
        kernel: String,
        /// Local size, e.g. 8,1,1 (0,0,0 for dynamic)
        #[arg(long, default_value = "0,0,0", value_parser = parse_dims)]
        local: [u64; 3],
        /// Number of work-groups per dimension
        #[arg(long, default_value = "1,1,1", value_parser = parse_dims)]
        groups: [u64; 3],
        /// Global offset per dimension
        #[arg(long, default_value = "0,0,0", value_parser = parse_dims)]
        offset: [u64; 3],
        /// Specialize for the launch shape instead of building the generic variant
        #[arg(long)]
        specialize: bool,
        /// Output object file (default: <kernel>.o)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write the work-group module
        #[arg(long, value_name = "PATH")]
        emit_ir: Option<PathBuf>,
    },
    /// Convert one kernel to SPIR-V
    Spirv {
        /// Program IR file
        input: PathBuf,
        /// Kernel name
        #[arg(short, long)]
        kernel: String,
        /// Output SPIR-V file (default: <kernel>.spv)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write the program-scope globals as SPIR-V
        #[arg(long, value_name = "PATH")]
        globals: Option<PathBuf>,
    },
}

fn parse_dims(s: &str) -> Result<[u64; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected three comma-separated values, got '{}'", s));
    }
    let mut dims = [0u64; 3];
    for (d, part) in dims.iter_mut().zip(&parts) {
        *d = part
            .parse()
            .map_err(|e| format!("invalid dimension '{}': {}", part, e))?;
    }
    Ok(dims)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut opts = CompilerOptions::from_env();
    if let Some(method) = cli.wg_method {
        opts = opts.with_wg_method(method);
    }
    if cli.verify {
        opts = opts.with_verify(true);
    }

    match cli.command {
        Command::Passes { device, expand } => cmd_passes(&device, expand, &opts),
        Command::Extract {
            input,
            kernel,
            output,
            globals,
        } => cmd_extract(&input, &kernel, output, globals, &opts),
        Command::Compile {
            input,
            device,
            kernel,
            local,
            groups,
            offset,
            specialize,
            output,
            emit_ir,
        } => {
            let command = LaunchCommand {
                local_size: local,
                global_offset: offset,
                num_groups: groups,
                force_large_grid_wg_func: false,
            };
            cmd_compile(
                &input, &device, &kernel, &command, specialize, output, emit_ir, opts,
            )
        }
        Command::Spirv {
            input,
            kernel,
            output,
            globals,
        } => cmd_spirv(&input, &kernel, output, globals, &opts),
    }
}

/// Print the build log and the error, then exit with status 1.
fn fail(build_log: &str, err: &CompilerError) -> ! {
    if !build_log.is_empty() {
        eprint!("{}", build_log);
    }
    eprintln!("error: {}", err);
    process::exit(1);
}

/// Like [`fail`], but parse errors are rendered against the input text.
fn fail_on_input(build_log: &str, err: &CompilerError, input: &Path, bytes: &[u8]) -> ! {
    if let (CompilerError::Parse(diag), Ok(source)) = (err, std::str::from_utf8(bytes)) {
        eprint!("{}", build_log);
        diag.render(&input.display().to_string(), source);
        process::exit(1);
    }
    fail(build_log, err)
}

fn read_input(path: &Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn write_output(path: &Path, bytes: &[u8]) {
    if let Err(e) = std::fs::write(path, bytes) {
        eprintln!("error: cannot write '{}': {}", path.display(), e);
        process::exit(1);
    }
}

fn resolve_device(spec: &str) -> DeviceDescriptor {
    match spec {
        "cpu" => DeviceDescriptor::host_cpu(),
        "spmd-gpu" => DeviceDescriptor::spmd_gpu(),
        "vortex" => DeviceDescriptor::vortex(),
        path => match DeviceDescriptor::load(Path::new(path)) {
            Ok(d) => d,
            Err(e) => fail("", &e),
        },
    }
}

// --- clwg passes ---

fn cmd_passes(device: &str, expand: bool, opts: &CompilerOptions) {
    let device = resolve_device(device);
    if expand {
        let toolchain = Toolchain::new();
        let pipeline = toolchain.pipeline(&device, opts);
        for name in pipeline.pass_names() {
            println!("{}", name);
        }
        return;
    }
    for step in clwg::pipeline::kernel_compiler_steps(&device) {
        println!("{}", step);
    }
}

// --- clwg extract ---

fn cmd_extract(
    input: &Path,
    kernel: &str,
    output: Option<PathBuf>,
    globals: Option<PathBuf>,
    opts: &CompilerOptions,
) {
    let bytes = read_input(input);
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.ir", kernel)));
    let globals = globals.unwrap_or_else(|| output.with_extension("globals.ir"));
    let mut log = String::new();
    let ctx = match ProgramContext::init(&bytes, &globals, opts) {
        Ok(ctx) => ctx,
        Err(e) => fail_on_input(&log, &e, input, &bytes),
    };
    if let Err(e) = ctx.extract_kernel(kernel, &output, &mut log) {
        fail(&log, &e);
    }
    eprintln!("Extracted '{}' to {}", kernel, output.display());
    ctx.release();
}

// --- clwg compile ---

#[allow(clippy::too_many_arguments)]
fn cmd_compile(
    input: &Path,
    device: &str,
    kernel: &str,
    command: &LaunchCommand,
    specialize: bool,
    output: Option<PathBuf>,
    emit_ir: Option<PathBuf>,
    opts: CompilerOptions,
) {
    let device = resolve_device(device);
    let bytes = read_input(input);
    let mut program = Program::new(vec![bytes.clone()]);
    let cx = CompilerContext::new(opts, Toolchain::shared());
    let mut log = String::new();

    if let Err(e) = cx.read_program_ir(&mut program, 0, &device, None) {
        fail_on_input(&log, &e, input, &bytes);
    }
    let req = WorkGroupRequest::new(0, &device, kernel, command).specialized(specialize);
    let module = match cx.generate_nowrite(&program, &req) {
        Ok(m) => m,
        Err(e) => {
            e.log_to(&mut log);
            fail(&log, &e);
        }
    };
    if let Some(path) = &emit_ir {
        write_output(path, module.to_text().as_bytes());
    }

    let emitted = match cx.codegen(&device, &module) {
        Ok(out) => out,
        Err(e) => {
            e.log_to(&mut log);
            fail(&log, &e);
        }
    };
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.o", kernel)));
    write_output(&output, &emitted.bytes);
    eprintln!(
        "Compiled '{}' for {} via {} ({} bytes) to {}",
        kernel,
        device.name,
        emitted.path,
        emitted.bytes.len(),
        output.display()
    );
    cx.destroy_module(module);
    cx.free_program_ir(&mut program, 0);
}

// --- clwg spirv ---

fn cmd_spirv(
    input: &Path,
    kernel: &str,
    output: Option<PathBuf>,
    globals: Option<PathBuf>,
    opts: &CompilerOptions,
) {
    let bytes = read_input(input);
    let mut log = String::new();
    let (ctx, globals_spv) = match ProgramContext::create_for_program(&bytes, opts, &mut log) {
        Ok(pair) => pair,
        Err(e) => fail_on_input(&log, &e, input, &bytes),
    };
    let spv = match ctx.extract_kernel_spirv(kernel, &mut log) {
        Ok(spv) => spv,
        Err(e) => fail(&log, &e),
    };
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.spv", kernel)));
    write_output(&output, &spv);
    if let Some(path) = &globals {
        write_output(path, &globals_spv);
    }
    eprintln!("Wrote {} bytes of SPIR-V to {}", spv.len(), output.display());
    ctx.release();
}
