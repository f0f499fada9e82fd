use super::wiloops::{LOOPS_KEY, REGIONS_KEY};
use super::workgroup::LAUNCHER_KEY;
use super::workitem::{HandlerChooser, HANDLER_KEY};
use super::*;
use crate::config::WorkGroupMethod;
use crate::ir::{parse_module, verify_module, FnAttr, Inst, Op, Terminator, Type};
use crate::launch::WgSpecialization;

const VECTOR_ADD: &str = include_str!("../../tests/fixtures/vector_add.ir");
const BARRIER_LOOP: &str = include_str!("../../tests/fixtures/barrier_loop.ir");

const HEADER: &str = "source_filename = \"t\"\ntarget datalayout = \"\"\ntarget triple = \"\"\n\n";

/// Barrier normalization as the pipeline runs it ahead of region formation.
const NORMALIZE: &[&str] = &[
    "loop-simplify",
    "uniformity",
    "phistoallocas",
    "isolate-regions",
    "implicit-loop-barriers",
    "implicit-cond-barriers",
    "loop-barriers",
    "barriertails",
    "barriers",
    "isolate-regions",
    "wi-aa",
];

fn parse(src: &str) -> Module {
    match parse_module(src) {
        Ok(m) => m,
        Err(d) => panic!("{}", d.render_to_string("test.ir", src)),
    }
}

fn with_header(body: &str) -> Module {
    parse(&format!("{}{}", HEADER, body))
}

/// Run `names` in order, invalidating analyses the way the pipeline does.
fn run(m: &mut Module, device: &DeviceDescriptor, names: &[&str]) {
    let opts = CompilerOptions::default();
    let mut cx = PassContext::new(&opts);
    for name in names {
        let pass = PassRegistry::create(name, device, None)
            .unwrap_or_else(|| panic!("unknown pass '{}'", name));
        if pass.run(m, &mut cx) && !pass.is_analysis() {
            cx.analyses.invalidate(pass.preserves());
        }
    }
}

fn calls_to(m: &Module, function: &str, callee: &str) -> usize {
    m.function(function)
        .map(|f| f.insts().filter(|i| i.callee() == Some(callee)).count())
        .unwrap_or(0)
}

fn assert_verifies(m: &Module) {
    let errors = verify_module(m);
    assert!(errors.is_empty(), "verifier: {:?}\n{}", errors, m.to_text());
}

// ─── Registry ─────────────────────────────────────────────────────

#[test]
fn test_registry_resolves_every_pass_name() {
    let device = DeviceDescriptor::host_cpu();
    for name in PASS_NAMES {
        let pass = PassRegistry::create(name, &device, None)
            .unwrap_or_else(|| panic!("'{}' not in the registry", name));
        assert_eq!(pass.name(), *name);
    }
}

#[test]
fn test_registry_rejects_unknown_names() {
    let device = DeviceDescriptor::host_cpu();
    assert!(PassRegistry::create("loop-unswitch", &device, None).is_none());
    assert!(PassRegistry::create("", &device, None).is_none());
}

#[test]
fn test_analyses_report_themselves() {
    let device = DeviceDescriptor::host_cpu();
    for name in ["domtree", "uniformity", "wi-aa", "verify"] {
        let pass = PassRegistry::create(name, &device, None).unwrap();
        assert!(pass.is_analysis(), "{}", name);
    }
    assert!(!PassRegistry::create("instcombine", &device, None).unwrap().is_analysis());
}

// ─── Inlining and cleanup ─────────────────────────────────────────

#[test]
fn test_inline_folds_small_helpers_into_kernels() {
    let mut m = parse(BARRIER_LOOP);
    run(&mut m, &DeviceDescriptor::host_cpu(), &["inline"]);
    assert_eq!(calls_to(&m, "reduce", "load_scaled"), 0);
    assert_verifies(&m);
}

#[test]
fn test_mem2reg_promotes_scalar_allocas() {
    let mut m = with_header(
        "define i32 @f(i32 %a) {\nentry:\n  %x = alloca i32, 1\n  store i32 %a, ptr %x\n  \
         %v = load i32, ptr %x\n  ret i32 %v\n}\n",
    );
    run(&mut m, &DeviceDescriptor::host_cpu(), &["mem2reg"]);
    let f = m.function("f").unwrap();
    assert!(f.insts().all(|i| !matches!(i.op, Op::Alloca { .. } | Op::Load { .. })));
    assert_verifies(&m);
}

#[test]
fn test_constant_branch_collapses_to_one_block() {
    let mut m = with_header(
        "define i32 @pick(i32 %a) {\nentry:\n  %c = icmp slt i32 1, i32 2\n  \
         br i1 %c, label %yes, label %no\nyes:\n  ret i32 %a\nno:\n  ret i32 0\n}\n",
    );
    run(&mut m, &DeviceDescriptor::host_cpu(), &["instcombine", "simplifycfg"]);
    let f = m.function("pick").unwrap();
    assert_eq!(f.blocks.len(), 1);
    match &f.blocks[0].term {
        Terminator::Ret(Some(v)) => assert_eq!(v.as_local(), Some("a")),
        other => panic!("unexpected terminator {:?}", other),
    }
}

#[test]
fn test_instcombine_folds_integer_arithmetic() {
    let mut m = with_header(
        "define i32 @five() {\nentry:\n  %s = add i32 2, i32 3\n  ret i32 %s\n}\n",
    );
    run(&mut m, &DeviceDescriptor::host_cpu(), &["instcombine", "dce"]);
    let f = m.function("five").unwrap();
    assert!(f.blocks[0].insts.is_empty());
    match &f.blocks[0].term {
        Terminator::Ret(Some(v)) => assert_eq!(v.as_int(), Some(5)),
        other => panic!("unexpected terminator {:?}", other),
    }
}

// ─── Analyses ─────────────────────────────────────────────────────

#[test]
fn test_uniformity_of_reduction_kernel() {
    let m = parse(BARRIER_LOOP);
    let u = Uniformity::compute(m.function("reduce").unwrap());
    for varying in ["lid", "gid", "slot", "cur"] {
        assert!(!u.is_uniform_name(varying), "{} should vary", varying);
    }
    for uniform in ["iters", "i", "next", "done"] {
        assert!(u.is_uniform_name(uniform), "{} should be uniform", uniform);
    }
    assert!(!u.is_uniform_name("no_such_value"));
}

// ─── Barrier normalization and region formation ───────────────────

#[test]
fn test_normalized_barriers_sit_alone_in_their_blocks() {
    let mut m = parse(BARRIER_LOOP);
    run(&mut m, &DeviceDescriptor::host_cpu(), NORMALIZE);
    let f = m.function("reduce").unwrap();
    let barrier_blocks: Vec<_> = f
        .blocks
        .iter()
        .filter(|b| crate::ir::block_has_barrier(b))
        .collect();
    // Entry, loop preheader, two in the body, latch and return.
    assert!(barrier_blocks.len() >= 5);
    for b in barrier_blocks {
        assert_eq!(b.insts.len(), 1, "block {}", b.label);
        assert!(matches!(b.term, Terminator::Br(_)), "block {}", b.label);
    }
    assert!(f.blocks[0]
        .insts
        .iter()
        .all(|i| matches!(i.op, Op::Alloca { .. })));
    assert!(f.insts().all(|i| !i.is_phi()));
    assert_verifies(&m);
}

#[test]
fn test_work_item_loops_replace_barriers() {
    let mut m = parse(BARRIER_LOOP);
    let device = DeviceDescriptor::host_cpu();
    let mut names = NORMALIZE.to_vec();
    names.extend(["workitemloops", "remove-barriers"]);
    run(&mut m, &device, &names);

    let f = m.function("reduce").unwrap();
    assert!(f.annotations.contains_key(LOOPS_KEY));
    assert!(f.annotations.contains_key(REGIONS_KEY));
    assert_eq!(calls_to(&m, "reduce", "barrier"), 0);
    assert_eq!(calls_to(&m, "reduce", "get_local_id"), 0);
    assert!(m.function("barrier").is_none());
    assert_verifies(&m);
}

#[test]
fn test_formed_kernel_text_parses_back() {
    let mut m = parse(BARRIER_LOOP);
    let mut names = NORMALIZE.to_vec();
    names.extend(["workitemloops", "remove-barriers"]);
    run(&mut m, &DeviceDescriptor::host_cpu(), &names);
    let text = m.to_text();
    assert_eq!(parse(&text).to_text(), text);
}

#[test]
fn test_subcfg_formation_uses_one_loop_per_region() {
    let mut m = parse(BARRIER_LOOP);
    m.function_mut("reduce")
        .unwrap()
        .annotations
        .insert(HANDLER_KEY.to_string(), "cbs".to_string());
    let mut names = NORMALIZE.to_vec();
    names.extend(["workitemloops", "subcfgformation", "remove-barriers"]);
    run(&mut m, &DeviceDescriptor::host_cpu(), &names);

    let f = m.function("reduce").unwrap();
    let headers = &f.annotations[LOOPS_KEY];
    assert!(!headers.is_empty());
    assert!(headers.split(',').all(|h| f.block(h).is_some()));
    assert_eq!(calls_to(&m, "reduce", "barrier"), 0);
    assert_verifies(&m);
}

#[test]
fn test_replication_unrolls_static_groups() {
    let device = DeviceDescriptor::host_cpu();
    let mut m = parse(BARRIER_LOOP);
    let spec = WgSpecialization {
        local_size: [2, 1, 1],
        dynamic_local_size: false,
        assume_zero_global_offset: true,
        max_grid_dim_width: 0,
    };
    LaunchMetadata::new(&device, "reduce", spec).write(&mut m);
    m.function_mut("reduce")
        .unwrap()
        .annotations
        .insert(HANDLER_KEY.to_string(), "repl".to_string());
    let mut names = NORMALIZE.to_vec();
    names.extend(["workitemrepl", "remove-barriers"]);
    run(&mut m, &device, &names);

    let f = m.function("reduce").unwrap();
    assert!(f.annotations.contains_key(REGIONS_KEY));
    assert!(!f.annotations.contains_key(LOOPS_KEY));
    assert_eq!(calls_to(&m, "reduce", "get_local_id"), 0);
    assert!(m.function("get_global_offset").is_none());
    assert_verifies(&m);
}

#[test]
fn test_oversized_work_item_array_skips_formation() {
    let mut m = parse(BARRIER_LOOP);
    m.function_mut("reduce").unwrap().blocks[0].insts.insert(
        0,
        Inst::new(
            "big",
            Op::Alloca {
                ty: Type::I32,
                count: 1 << 62,
            },
        ),
    );
    let mut names = NORMALIZE.to_vec();
    names.push("workitemloops");
    run(&mut m, &DeviceDescriptor::host_cpu(), &names);

    let f = m.function("reduce").unwrap();
    assert!(!f.annotations.contains_key(REGIONS_KEY));
    assert!(f.insts().any(|i| matches!(i.op, Op::Alloca { count, .. } if count == 1 << 62)));
}

#[test]
fn test_remarks_kept_only_when_enabled() {
    let off = CompilerOptions::default();
    let mut cx = PassContext::new(&off);
    cx.remark("vectorized loop".to_string());
    assert!(cx.remarks.is_empty());

    let on = CompilerOptions::default().with_vectorizer_remarks(true);
    let mut cx = PassContext::new(&on);
    cx.remark("vectorized loop".to_string());
    assert_eq!(cx.remarks, ["vectorized loop"]);
}

#[test]
fn test_other_handlers_leave_kernel_alone() {
    let mut m = parse(BARRIER_LOOP);
    m.function_mut("reduce")
        .unwrap()
        .annotations
        .insert(HANDLER_KEY.to_string(), "cbs".to_string());
    let mut names = NORMALIZE.to_vec();
    names.push("workitemloops");
    run(&mut m, &DeviceDescriptor::host_cpu(), &names);
    assert!(!m.function("reduce").unwrap().annotations.contains_key(REGIONS_KEY));
}

// ─── Work-item builtins ───────────────────────────────────────────

#[test]
fn test_handler_choice() {
    use WorkGroupMethod::*;
    assert_eq!(HandlerChooser::choose(Auto, Some([4, 2, 1]), false), "repl");
    assert_eq!(HandlerChooser::choose(Auto, Some([4, 2, 1]), true), "loops");
    assert_eq!(HandlerChooser::choose(Auto, Some([64, 1, 1]), false), "loops");
    assert_eq!(HandlerChooser::choose(Auto, None, false), "loops");
    assert_eq!(HandlerChooser::choose(Cbs, None, true), "cbs");
    assert_eq!(HandlerChooser::choose(Repl, None, false), "loops");
    assert_eq!(HandlerChooser::choose(Repl, Some([8, 1, 1]), true), "repl");
    assert_eq!(HandlerChooser::choose(LoopVec, Some([1, 1, 1]), false), "loops");
    assert_eq!(HandlerChooser::choose(Auto, Some([1 << 22; 3]), false), "loops");
    assert_eq!(HandlerChooser::choose(Repl, Some([1 << 22; 3]), false), "loops");
}

#[test]
fn test_handler_chooser_annotates_kernels() {
    let mut m = parse(BARRIER_LOOP);
    run(&mut m, &DeviceDescriptor::host_cpu(), &["workitem-handler-chooser"]);
    assert_eq!(
        m.function("reduce").unwrap().annotations.get(HANDLER_KEY).map(String::as_str),
        Some("loops")
    );
    assert!(!m.function("load_scaled").unwrap().annotations.contains_key(HANDLER_KEY));
}

#[test]
fn test_automatic_locals_become_arguments() {
    let mut m = parse(BARRIER_LOOP);
    run(&mut m, &DeviceDescriptor::host_cpu(), &["automatic-locals"]);
    let f = m.function("reduce").unwrap();
    let last = f.params.last().unwrap();
    assert_eq!(last.name, "_local_scratch");
    assert_eq!(last.ty, Type::Ptr(crate::ir::addrspace::LOCAL));
    assert_eq!(f.annotations.get("autolocal.scratch").map(String::as_str), Some("256"));
    assert!(!f.references_global("scratch"));
    assert!(m.global("scratch").is_none());
    assert_verifies(&m);
}

#[test]
fn test_automatic_locals_off_for_spmd() {
    let mut m = parse(BARRIER_LOOP);
    let mut device = DeviceDescriptor::spmd_gpu();
    device.autolocals_to_args = false;
    device.device_alloca_locals = false;
    run(&mut m, &device, &["automatic-locals"]);
    assert!(m.global("scratch").is_some());
}

// ─── Work-group launcher ──────────────────────────────────────────

#[test]
fn test_workgroup_wraps_kernel_in_launcher() {
    let mut m = parse(VECTOR_ADD);
    run(&mut m, &DeviceDescriptor::host_cpu(), &["workgroup"]);

    let kernel = m.function("vector_add").unwrap();
    assert!(!kernel.has_attr(FnAttr::Kernel));
    assert!(kernel.has_attr(FnAttr::AlwaysInline));
    assert_eq!(kernel.params.len(), 4);

    let launcher = m.function("_wg_vector_add").unwrap();
    assert_eq!(launcher.annotations.get(LAUNCHER_KEY).map(String::as_str), Some("vector_add"));
    // Argument buffer and context.
    assert_eq!(launcher.params.len(), 2);
    assert_eq!(calls_to(&m, "_wg_vector_add", "vector_add"), 1);
    assert!(m.function("_grid_vector_add").is_none());
    assert_verifies(&m);
}

#[test]
fn test_launcher_absorbs_kernel_after_inlining() {
    let mut m = parse(VECTOR_ADD);
    run(&mut m, &DeviceDescriptor::host_cpu(), &["workgroup", "always-inline"]);
    assert!(m.function("vector_add").is_none());
    assert_eq!(calls_to(&m, "_wg_vector_add", "get_global_id"), 1);
    assert_verifies(&m);
}

#[test]
fn test_grid_launcher_follows_group_launcher() {
    let mut m = parse(VECTOR_ADD);
    run(&mut m, &DeviceDescriptor::vortex(), &["workgroup"]);
    let position = |name: &str| m.functions.iter().position(|f| f.name == name).unwrap();
    assert!(position("_wg_vector_add") < position("_grid_vector_add"));
    assert_eq!(calls_to(&m, "_grid_vector_add", "_wg_vector_add"), 1);
    assert_verifies(&m);
}

// ─── Device-specific passes ───────────────────────────────────────

#[test]
fn test_remove_barriers_keeps_explicit_barriers_on_spmd() {
    let src = "define void @k() kernel {\nentry:\n  call void @barrier(i32 1)\n  \
               call void @_wg_barrier()\n  ret void\n}\n\n\
               declare void @barrier(i32)\n\ndeclare void @_wg_barrier()\n";
    let mut spmd = with_header(src);
    run(&mut spmd, &DeviceDescriptor::spmd_gpu(), &["remove-barriers"]);
    assert_eq!(calls_to(&spmd, "k", "barrier"), 1);
    assert_eq!(calls_to(&spmd, "k", "_wg_barrier"), 0);
    assert!(spmd.function("_wg_barrier").is_none());

    let mut cpu = with_header(src);
    run(&mut cpu, &DeviceDescriptor::host_cpu(), &["remove-barriers"]);
    assert!(cpu.function("k").unwrap().blocks[0].insts.is_empty());
}

#[test]
fn test_vortex_barriers_use_warp_count() {
    let mut m = parse(BARRIER_LOOP);
    run(&mut m, &DeviceDescriptor::vortex(), &["vortex-barriers"]);
    assert_eq!(calls_to(&m, "reduce", "barrier"), 0);
    assert_eq!(calls_to(&m, "reduce", "vx_barrier"), 2);
    assert_eq!(calls_to(&m, "reduce", "vx_num_warps"), 2);
    assert!(m.function("barrier").is_none());
    assert!(m.function("vx_num_warps").is_some());
    assert_verifies(&m);
}

#[test]
fn test_vortex_printf_renamed() {
    let mut m = with_header(
        "@fmt = addrspace(2) constant i8 x 3 [i8 104, i8 105, i8 0]\n\n\
         define void @hello() kernel {\nentry:\n  \
         %n = call i32 @printf(ptr addrspace(2) @fmt)\n  ret void\n}\n\n\
         declare i32 @printf(ptr addrspace(2))\n",
    );
    let device = DeviceDescriptor::vortex();
    run(&mut m, &device, &["vortex-printfs"]);
    assert_eq!(calls_to(&m, "hello", "vx_printf"), 1);
    assert!(m.function("printf").is_none());
    let vx = m.function("vx_printf").unwrap();
    assert_eq!(vx.ret, Type::I32);
    assert_eq!(vx.params.len(), 1);
    assert_verifies(&m);
}

#[test]
fn test_vortex_attribute_flag_set_once() {
    let mut m = parse(VECTOR_ADD);
    let device = DeviceDescriptor::vortex();
    let opts = CompilerOptions::default();
    let mut cx = PassContext::new(&opts);
    let pass = PassRegistry::create("vortex-mno-riscv-attribute", &device, None).unwrap();
    assert!(pass.run(&mut m, &mut cx));
    assert!(!pass.run(&mut m, &mut cx));
    assert_eq!(m.meta_bool(crate::target::RISCV_NO_ATTRIBUTES_KEY), Some(true));
}
