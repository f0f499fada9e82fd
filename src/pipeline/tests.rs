use super::*;
use crate::config::WorkGroupMethod;
use crate::ir::{parse_module, verify_module};

const VECTOR_ADD: &str = include_str!("../../tests/fixtures/vector_add.ir");
const BARRIER_LOOP: &str = include_str!("../../tests/fixtures/barrier_loop.ir");

fn render(steps: &[PipelineStep]) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn calls_to(m: &Module, callee: &str) -> usize {
    m.functions
        .iter()
        .flat_map(|f| f.insts())
        .filter(|i| i.callee() == Some(callee))
        .count()
}

// ─── Step lists ───────────────────────────────────────────────────

#[test]
fn test_host_cpu_steps() {
    let steps = kernel_compiler_steps(&DeviceDescriptor::host_cpu());
    insta::assert_snapshot!(render(&steps), @r"
    inline-kernels
    remove-optnone
    optimize-wi-func-calls
    handle-samplers
    infer-address-spaces
    workitem-handler-chooser
    mem2reg
    domtree
    flatten-globals
    flatten-barrier-subs
    always-inline
    inline
    automatic-locals
    STANDARD_OPTS
    simplifycfg
    loop-simplify
    uniformity
    phistoallocas
    isolate-regions
    implicit-loop-barriers
    implicit-cond-barriers
    loop-barriers
    barriertails
    barriers
    isolate-regions
    wi-aa
    workitemrepl
    subcfgformation
    workitemloops
    remove-barriers
    workgroup
    always-inline
    allocastoentry
    simplifycfg
    STANDARD_OPTS
    loop-deletion
    remove-barriers
    ");
}

#[test]
fn test_spmd_steps() {
    let steps = kernel_compiler_steps(&DeviceDescriptor::spmd_gpu());
    insta::assert_snapshot!(render(&steps), @r"
    inline-kernels
    remove-optnone
    optimize-wi-func-calls
    handle-samplers
    infer-address-spaces
    workitem-handler-chooser
    mem2reg
    domtree
    flatten-inline-all
    always-inline
    automatic-locals
    STANDARD_OPTS
    allocastoentry
    simplifycfg
    STANDARD_OPTS
    loop-deletion
    remove-barriers
    ");
}

#[test]
fn test_vortex_steps_bracket_the_pipeline() {
    let steps = kernel_compiler_steps(&DeviceDescriptor::vortex());
    assert_eq!(steps[0], PipelineStep::Pass("vortex-mno-riscv-attribute"));
    assert_eq!(steps[1], PipelineStep::Pass("vortex-printfs"));
    let at = steps
        .iter()
        .position(|s| *s == PipelineStep::Pass("vortex-barriers"))
        .unwrap();
    assert_eq!(steps[at - 1], PipelineStep::Pass("workitemloops"));
    assert_eq!(steps[at + 1], PipelineStep::Pass("remove-barriers"));
}

#[test]
fn test_ordering_constraints_hold() {
    let steps = kernel_compiler_steps(&DeviceDescriptor::host_cpu());
    let first = |name: &'static str| {
        steps
            .iter()
            .position(|s| *s == PipelineStep::Pass(name))
            .unwrap()
    };
    let last = |name: &'static str| {
        steps
            .iter()
            .rposition(|s| *s == PipelineStep::Pass(name))
            .unwrap()
    };
    assert!(first("implicit-loop-barriers") < first("implicit-cond-barriers"));
    assert!(first("implicit-cond-barriers") < first("barriers"));
    assert!(first("phistoallocas") < first("workitemloops"));
    assert!(first("subcfgformation") < first("workitemloops"));
    assert!(first("inline") < first("automatic-locals"));
    assert!(first("always-inline") < first("automatic-locals"));
    assert!(first("workitemloops") < first("workgroup"));
    assert!(first("workgroup") < last("always-inline"));
}

#[test]
fn test_no_launcher_steps_without_workgroup_pass() {
    let mut device = DeviceDescriptor::host_cpu();
    device.workgroup_pass = false;
    let steps = kernel_compiler_steps(&device);
    assert!(!steps.contains(&PipelineStep::Pass("workgroup")));
}

// ─── STANDARD_OPTS ────────────────────────────────────────────────

#[test]
fn test_standard_opts_vectorizers() {
    let host = DeviceDescriptor::host_cpu();
    let spmd = DeviceDescriptor::spmd_gpu();
    let quiet = CompilerOptions::default().with_verify(false);
    for (method, wanted) in [
        (WorkGroupMethod::LoopVec, true),
        (WorkGroupMethod::Cbs, true),
        (WorkGroupMethod::Loops, false),
        (WorkGroupMethod::Repl, false),
        (WorkGroupMethod::Auto, false),
    ] {
        let opts = quiet.clone().with_wg_method(method);
        let names = standard_opts(&host, &opts);
        assert_eq!(names.contains(&"loop-vectorize"), wanted, "{}", method);
        assert_eq!(names.contains(&"slp-vectorizer"), wanted, "{}", method);
        assert!(!standard_opts(&spmd, &opts).contains(&"loop-vectorize"));
    }
}

#[test]
fn test_standard_opts_verification_brackets() {
    let device = DeviceDescriptor::spmd_gpu();
    let on = standard_opts(&device, &CompilerOptions::default().with_verify(true));
    assert_eq!(on.first(), Some(&"verify"));
    assert_eq!(on.last(), Some(&"verify"));
    let off = standard_opts(&device, &CompilerOptions::default().with_verify(false));
    insta::assert_snapshot!(off.join(" "), @"instcombine simplifycfg early-cse mem2reg instcombine dce simplifycfg dce");
}

// ─── Building ─────────────────────────────────────────────────────

#[test]
fn test_target_analyses_lead_when_backend_exists() {
    let opts = CompilerOptions::default();
    let backends = BackendFactory::new();
    let p = Pipeline::build(&DeviceDescriptor::host_cpu(), &opts, &backends);
    assert_eq!(&p.pass_names()[..2], &["target-transform-info", "target-library-info"]);

    let spir = DeviceDescriptor::host_cpu()
        .with_id(9)
        .with_triple("spir64-unknown-unknown");
    let p = Pipeline::build(&spir, &opts, &backends);
    assert_eq!(p.pass_names()[0], "target-library-info");
    assert!(!p.contains("target-transform-info"));
}

#[test]
fn test_spmd_pipeline_skips_barrier_passes() {
    let p = Pipeline::build(
        &DeviceDescriptor::spmd_gpu(),
        &CompilerOptions::default(),
        &BackendFactory::new(),
    );
    for name in [
        "loop-simplify",
        "uniformity",
        "phistoallocas",
        "isolate-regions",
        "implicit-loop-barriers",
        "implicit-cond-barriers",
        "loop-barriers",
        "barriertails",
        "barriers",
        "wi-aa",
        "workitemrepl",
        "subcfgformation",
        "workitemloops",
        "workgroup",
    ] {
        assert!(!p.contains(name), "{} in SPMD pipeline", name);
    }
    assert!(p.contains("flatten-inline-all"));
}

#[test]
fn test_expanded_pipeline_has_no_sentinel() {
    let p = Pipeline::build(
        &DeviceDescriptor::host_cpu(),
        &CompilerOptions::default(),
        &BackendFactory::new(),
    );
    assert!(!p.contains(STANDARD_OPTS));
    assert_eq!(
        p.steps()
            .iter()
            .filter(|s| **s == PipelineStep::StandardOpts)
            .count(),
        2
    );
}

// ─── Cache ────────────────────────────────────────────────────────

#[test]
fn test_cache_returns_same_pipeline() {
    let cache = PipelineCache::new();
    let backends = BackendFactory::new();
    let opts = CompilerOptions::default();
    let host = DeviceDescriptor::host_cpu();
    let a = cache.pipeline_for(&host, &opts, &backends);
    let b = cache.pipeline_for(&host, &opts.clone().with_wg_method(WorkGroupMethod::Repl), &backends);
    assert!(Arc::ptr_eq(&a, &b));
    let spmd = cache.pipeline_for(&DeviceDescriptor::spmd_gpu(), &opts, &backends);
    assert!(!Arc::ptr_eq(&a, &spmd));
    assert_eq!(cache.len(), 2);
    cache.clear();
    assert!(cache.is_empty());
    let c = cache.pipeline_for(&host, &opts, &backends);
    assert!(!Arc::ptr_eq(&a, &c));
}

// ─── Running ──────────────────────────────────────────────────────

#[test]
fn test_run_counts_and_produces_launcher() {
    let opts = CompilerOptions::default().with_verify(true);
    let p = Pipeline::build(&DeviceDescriptor::host_cpu(), &opts, &BackendFactory::new());
    let mut m = parse_module(VECTOR_ADD).unwrap();
    assert_eq!(p.runs(), 0);
    p.run(&mut m, &opts).unwrap();
    assert_eq!(p.runs(), 1);
    assert!(m.function("_wg_vector_add").is_some());
    assert!(verify_module(&m).is_empty());
}

#[test]
fn test_run_removes_barriers_from_loop_kernel() {
    let opts = CompilerOptions::default()
        .with_verify(true)
        .with_wg_method(WorkGroupMethod::Loops);
    let p = Pipeline::build(&DeviceDescriptor::host_cpu(), &opts, &BackendFactory::new());
    let mut m = parse_module(BARRIER_LOOP).unwrap();
    p.run(&mut m, &opts).unwrap();
    assert_eq!(calls_to(&m, "barrier"), 0);
    assert_eq!(calls_to(&m, "get_local_id"), 0);
    assert!(m.function("_wg_reduce").is_some());
    assert!(verify_module(&m).is_empty());
}

#[test]
fn test_spmd_run_keeps_program_barriers() {
    let opts = CompilerOptions::default().with_verify(true);
    let p = Pipeline::build(&DeviceDescriptor::spmd_gpu(), &opts, &BackendFactory::new());
    let mut m = parse_module(BARRIER_LOOP).unwrap();
    p.run(&mut m, &opts).unwrap();
    assert_eq!(calls_to(&m, "barrier"), 2);
    assert!(m.function("_wg_reduce").is_none());
    assert!(m.function("load_scaled").is_none());
}
