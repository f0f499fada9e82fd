//! Work-group compilation throughput.
//!
//! Measures the stages a kernel launch pays for on a cache miss:
//! 1. Pipeline construction for a device
//! 2. Kernel extraction from the program IR
//! 3. The full pass pipeline on the extracted kernel
//! 4. Object emission

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use clwg::ir::parse_module;
use clwg::program::copy_kernel;
use clwg::target::{Backend, BackendFactory, FileType};
use clwg::{CompilerOptions, DeviceDescriptor, Pipeline, WorkGroupMethod};

const VECTOR_ADD: &str = include_str!("../tests/fixtures/vector_add.ir");
const BARRIER_LOOP: &str = include_str!("../tests/fixtures/barrier_loop.ir");

fn bench_pipeline_build(c: &mut Criterion) {
    let opts = CompilerOptions::default();
    let factory = BackendFactory::new();
    let mut group = c.benchmark_group("pipeline_build");
    for device in [DeviceDescriptor::host_cpu(), DeviceDescriptor::spmd_gpu()] {
        group.bench_function(device.name.clone(), |b| {
            b.iter(|| Pipeline::build(black_box(&device), &opts, &factory))
        });
    }
    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let program = parse_module(BARRIER_LOOP).unwrap();
    c.bench_function("copy_kernel", |b| {
        b.iter(|| copy_kernel(black_box(&program), "reduce", &[]).unwrap())
    });
}

fn bench_pipeline_run(c: &mut Criterion) {
    let device = DeviceDescriptor::host_cpu();
    let factory = BackendFactory::new();
    let mut group = c.benchmark_group("pipeline_run");
    for (name, text, method) in [
        ("vector_add", VECTOR_ADD, WorkGroupMethod::Loops),
        ("barrier_loop", BARRIER_LOOP, WorkGroupMethod::Loops),
        ("barrier_loop_cbs", BARRIER_LOOP, WorkGroupMethod::Cbs),
    ] {
        let opts = CompilerOptions::default().with_wg_method(method);
        let pipeline = Pipeline::build(&device, &opts, &factory);
        let program = parse_module(text).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut m = program.clone();
                pipeline.run(&mut m, &opts).unwrap();
                m
            })
        });
    }
    group.finish();
}

fn bench_emit(c: &mut Criterion) {
    let device = DeviceDescriptor::host_cpu();
    let opts = CompilerOptions::default();
    let backend = Backend::create(&device, &opts).unwrap();
    let pipeline = Pipeline::build(&device, &opts, &BackendFactory::new());
    let mut m = parse_module(VECTOR_ADD).unwrap();
    pipeline.run(&mut m, &opts).unwrap();
    c.bench_function("emit_object", |b| {
        b.iter(|| backend.emit(black_box(&m), FileType::Object).unwrap())
    });
}

criterion_group!(
    benches,
    bench_pipeline_build,
    bench_extract,
    bench_pipeline_run,
    bench_emit
);
criterion_main!(benches);
