//! Whole-flow tests over the public API: program IR in, work-group module
//! and object out.

use std::path::Path;
use std::sync::Arc;

use clwg::ir::{parse_module, verify_module, Module};
use clwg::launch::LaunchMetadata;
use clwg::target::object;
use clwg::{
    CompilerContext, CompilerOptions, DeviceDescriptor, EmitPath, Generated, KernelCache,
    LaunchCommand, Program, ProgramContext, Toolchain, WorkGroupMethod, WorkGroupRequest,
};

const VECTOR_ADD: &str = include_str!("fixtures/vector_add.ir");
const BARRIER_LOOP: &str = include_str!("fixtures/barrier_loop.ir");
const TWO_KERNELS: &str = include_str!("fixtures/two_kernels.ir");

fn context(opts: CompilerOptions, dir: &Path) -> CompilerContext {
    CompilerContext::new(opts.with_temp_dir(dir), Arc::new(Toolchain::new()))
        .with_cache(KernelCache::new(dir.join("kcache")))
}

fn calls_to(m: &Module, callee: &str) -> usize {
    m.functions
        .iter()
        .flat_map(|f| f.insts())
        .filter(|i| i.callee() == Some(callee))
        .count()
}

#[test]
fn test_host_kernel_to_object() {
    let dir = tempfile::tempdir().unwrap();
    let cx = context(CompilerOptions::default().with_verify(true), dir.path());
    let device = DeviceDescriptor::host_cpu();
    let mut program = Program::new(vec![VECTOR_ADD.as_bytes().to_vec()]);
    cx.read_program_ir(&mut program, 0, &device, None).unwrap();

    let cmd = LaunchCommand::with_local_size([8, 1, 1]);
    let req = WorkGroupRequest::new(0, &device, "vector_add", &cmd).specialized(true);
    let m = cx.generate_nowrite(&program, &req).unwrap();
    assert!(m.function("_wg_vector_add").is_some());
    assert_eq!(LaunchMetadata::read(&m).unwrap().spec.local_size, [8, 1, 1]);

    let out = cx.codegen(&device, &m).unwrap();
    assert_eq!(out.path, EmitPath::Object);
    assert_eq!(object::elf_machine(&out.bytes), Some(62));

    assert_eq!(cx.live_irs(), 2);
    cx.destroy_module(m);
    cx.free_program_ir(&mut program, 0);
    assert_eq!(cx.live_irs(), 0);
}

#[test]
fn test_barrier_loop_becomes_work_item_loops() {
    let dir = tempfile::tempdir().unwrap();
    let opts = CompilerOptions::default()
        .with_verify(true)
        .with_wg_method(WorkGroupMethod::Loops);
    let cx = context(opts, dir.path());
    let device = DeviceDescriptor::host_cpu();
    let mut program = Program::new(vec![BARRIER_LOOP.as_bytes().to_vec()]);
    cx.read_program_ir(&mut program, 0, &device, None).unwrap();

    let cmd = LaunchCommand::with_local_size([64, 1, 1]);
    let req = WorkGroupRequest::new(0, &device, "reduce", &cmd).specialized(true);
    let m = cx.generate_nowrite(&program, &req).unwrap();
    assert_eq!(calls_to(&m, "barrier"), 0);
    assert_eq!(calls_to(&m, "get_local_id"), 0);
    assert!(m.function("_wg_reduce").is_some());
    assert!(verify_module(&m).is_empty());
}

#[test]
fn test_spmd_device_keeps_kernel_shape() {
    let dir = tempfile::tempdir().unwrap();
    let cx = context(CompilerOptions::default(), dir.path());
    let device = DeviceDescriptor::spmd_gpu();
    let mut program = Program::new(vec![VECTOR_ADD.as_bytes().to_vec()]);
    cx.read_program_ir(&mut program, 0, &device, None).unwrap();

    let cmd = LaunchCommand::with_local_size([32, 1, 1]);
    let req = WorkGroupRequest::new(0, &device, "vector_add", &cmd);
    let m = cx.generate_nowrite(&program, &req).unwrap();
    assert!(m.function("_wg_vector_add").is_none());
    assert!(m.function("vector_add").is_some());

    let pipeline = cx.toolchain().pipeline(&device, cx.options());
    assert!(!pipeline.contains("workitemloops"));
    assert_eq!(pipeline.runs(), 1);

    let out = cx.codegen(&device, &m).unwrap();
    assert_eq!(out.path, EmitPath::Object);
    assert!(!out.bytes.is_empty());
    assert_eq!(object::elf_machine(&out.bytes), Some(62));
}

#[test]
fn test_generate_then_hit_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cx = context(CompilerOptions::default(), dir.path());
    let device = DeviceDescriptor::host_cpu();
    let mut program = Program::new(vec![VECTOR_ADD.as_bytes().to_vec()]);
    cx.read_program_ir(&mut program, 0, &device, None).unwrap();

    let cmd = LaunchCommand::with_local_size([4, 1, 1]);
    let req = WorkGroupRequest::new(0, &device, "vector_add", &cmd).specialized(true);
    let mut log = String::new();
    let first = cx.generate(&program, &req, &mut log).unwrap();
    assert!(matches!(first, Generated::Written(_)));
    assert!(first.path().starts_with(dir.path().join("kcache")));

    let stored = parse_module(&std::fs::read_to_string(first.path()).unwrap()).unwrap();
    assert!(stored.function("_wg_vector_add").is_some());

    let second = cx.generate(&program, &req, &mut log).unwrap();
    assert!(second.was_cached());
    assert_eq!(second.path(), first.path());
    assert_eq!(cx.toolchain().pipeline(&device, cx.options()).runs(), 1);
    assert!(log.is_empty());
    assert_eq!(cx.live_irs(), 1);
}

#[test]
fn test_program_scope_variables_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let opts = CompilerOptions::default().with_verify(true);
    let pc = ProgramContext::init(TWO_KERNELS.as_bytes(), &dir.path().join("gvars.ir"), &opts).unwrap();
    assert_eq!(pc.scope().size, 16);
    insta::assert_snapshot!(pc.globals().to_text().trim_end(), @r#"
    source_filename = "program_gvars"
    target datalayout = "e-m:e-i64:64-n32:64-S128"
    target triple = "x86_64-unknown-linux-gnu"

    !program_scope_storage_size = i64 16

    @counter = addrspace(3) global i32 x 1 zeroinitializer
    @handler = addrspace(3) global ptr x 1 [ptr @scale]
    @lut = addrspace(2) constant i32 x 4 external

    define i32 @scale(i32 %x) {
    entry:
      %idx = and i32 %x, i32 3
      %idx64 = zext i32 %idx to i64
      %p = gep i32, ptr addrspace(2) @lut, i64 %idx64
      %m = load i32, ptr addrspace(2) %p
      %r = mul i32 %x, i32 %m
      ret i32 %r
    }
    "#);

    let cx = context(opts, dir.path());
    let device = DeviceDescriptor::host_cpu();
    let mut program = Program::new(vec![pc.program_text().into_bytes()]);
    pc.release();
    cx.read_program_ir(&mut program, 0, &device, None).unwrap();
    assert_eq!(program.scope_storage_size(0), 16);

    let cmd = LaunchCommand::with_local_size([1, 1, 1]);
    let req = WorkGroupRequest::new(0, &device, "count", &cmd).specialized(true);
    let m = cx.generate_nowrite(&program, &req).unwrap();
    assert!(calls_to(&m, "_cl_program_scope_base") >= 1);
    assert!(m.global("counter").is_none());
    assert_eq!(m.meta_int("program_scope_storage_size"), Some(16));
}

#[cfg(unix)]
#[test]
fn test_spirv_for_every_kernel() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let tool = dir.path().join("llvm-spirv");
    std::fs::write(
        &tool,
        // Magic number, then the input path, so every payload differs.
        "#!/bin/sh\nwhile [ \"$1\" != -o ]; do shift; done\nprintf '\\003\\002\\043\\007' > \"$2\"\nprintf '%s' \"$3\" >> \"$2\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let opts = CompilerOptions::default()
        .with_spirv_converter(tool.to_string_lossy())
        .with_temp_dir(dir.path());
    let mut log = String::new();
    let (pc, gvars) = ProgramContext::create_for_program(TWO_KERNELS.as_bytes(), &opts, &mut log).unwrap();
    assert!(clwg::spirv::has_magic(&gvars));
    let mut payloads = Vec::new();
    for kernel in pc.kernel_names() {
        let spv = pc.extract_kernel_spirv(&kernel, &mut log).unwrap();
        assert!(clwg::spirv::has_magic(&spv), "{}", kernel);
        assert!(spv.len() > 4, "{}", kernel);
        payloads.push(spv);
    }
    assert_eq!(payloads.len(), 2);
    assert_ne!(payloads[0], payloads[1]);
    assert_ne!(payloads[0], gvars);
    assert!(log.is_empty());
    pc.release();
}
