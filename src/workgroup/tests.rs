use super::*;
use crate::error::CompilerError;
use crate::ir::{parse_module, verify_module};
use crate::target::BackendFactory;

const VECTOR_ADD: &str = include_str!("../../tests/fixtures/vector_add.ir");
const TWO_KERNELS: &str = include_str!("../../tests/fixtures/two_kernels.ir");

fn build(
    device: &DeviceDescriptor,
    cmd: &LaunchCommand,
    specialize: bool,
    opts: &CompilerOptions,
) -> crate::error::Result<Module> {
    let program = parse_module(VECTOR_ADD).unwrap();
    let pipeline = Pipeline::build(device, opts, &BackendFactory::new());
    let req = WorkGroupRequest::new(0, device, "vector_add", cmd).specialized(specialize);
    build_work_group_module(&program, &req, &pipeline, opts)
}

// ─── Specialization ───────────────────────────────────────────────

#[test]
fn test_request_resolves_against_device_limit() {
    let mut device = DeviceDescriptor::host_cpu();
    device.grid_width_specialization_limit = 64;
    let mut cmd = LaunchCommand::with_local_size([8, 1, 1]);
    cmd.num_groups = [2, 1, 1];

    let req = WorkGroupRequest::new(0, &device, "k", &cmd);
    assert_eq!(req.specialization(), WgSpecialization::generic());

    let spec = req.specialized(true).specialization();
    assert_eq!(spec.local_size, [8, 1, 1]);
    assert_eq!(spec.max_grid_dim_width, 64);

    cmd.force_large_grid_wg_func = true;
    let spec = WorkGroupRequest::new(0, &device, "k", &cmd)
        .specialized(true)
        .specialization();
    assert_eq!(spec.max_grid_dim_width, 0);
}

// ─── Generation ───────────────────────────────────────────────────

#[test]
fn test_specialized_module_keeps_metadata() {
    let opts = CompilerOptions::default().with_verify(true);
    let device = DeviceDescriptor::host_cpu();
    let cmd = LaunchCommand::with_local_size([4, 1, 1]);
    let m = build(&device, &cmd, true, &opts).unwrap();

    let program = parse_module(VECTOR_ADD).unwrap();
    assert_eq!(m.triple, program.triple);
    assert_eq!(m.data_layout, program.data_layout);
    assert!(m.function("_wg_vector_add").is_some());

    let meta = LaunchMetadata::read(&m).unwrap();
    assert_eq!(meta.kernel_name, "vector_add");
    assert_eq!(meta.spec.local_size, [4, 1, 1]);
    assert!(!meta.spec.dynamic_local_size);
    assert!(meta.spec.assume_zero_global_offset);
    assert!(meta.arg_buffer_launcher);
    assert!(verify_module(&m).is_empty());
}

#[test]
fn test_generic_module_records_dynamic_size() {
    let opts = CompilerOptions::default().with_verify(true);
    let cmd = LaunchCommand::with_local_size([16, 1, 1]);
    let m = build(&DeviceDescriptor::host_cpu(), &cmd, false, &opts).unwrap();
    let meta = LaunchMetadata::read(&m).unwrap();
    assert_eq!(meta.spec, WgSpecialization::generic());
}

#[test]
fn test_zero_local_size_specializes_as_dynamic() {
    let opts = CompilerOptions::default();
    let cmd = LaunchCommand::with_local_size([0, 0, 0]);
    let m = build(&DeviceDescriptor::host_cpu(), &cmd, true, &opts).unwrap();
    let meta = LaunchMetadata::read(&m).unwrap();
    assert!(meta.spec.dynamic_local_size);
    assert_eq!(meta.spec.local_size, [0, 0, 0]);
}

#[test]
fn test_local_size_over_device_limit_is_rejected() {
    let opts = CompilerOptions::default();
    let device = DeviceDescriptor::host_cpu();
    for local in [[1 << 22; 3], [4097, 1, 1], [64, 64, 2]] {
        let cmd = LaunchCommand::with_local_size(local);
        let err = build(&device, &cmd, true, &opts).unwrap_err();
        match err {
            CompilerError::InvalidMetadata(msg) => assert!(msg.contains("4096"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    // The generic variant never looks at the launch's local size.
    let cmd = LaunchCommand::with_local_size([1 << 22; 3]);
    assert!(build(&device, &cmd, false, &opts).is_ok());
    let cmd = LaunchCommand::with_local_size([4096, 1, 1]);
    assert!(build(&device, &cmd, true, &opts).is_ok());
}

#[test]
fn test_unknown_kernel_fails_before_pipeline() {
    let opts = CompilerOptions::default();
    let device = DeviceDescriptor::host_cpu();
    let program = parse_module(VECTOR_ADD).unwrap();
    let pipeline = Pipeline::build(&device, &opts, &BackendFactory::new());
    let cmd = LaunchCommand::default();
    let req = WorkGroupRequest::new(0, &device, "nope", &cmd);
    let err = build_work_group_module(&program, &req, &pipeline, &opts).unwrap_err();
    assert!(matches!(err, CompilerError::KernelNotFound(_)));
    assert_eq!(pipeline.runs(), 0);
}

// ─── Finalizer ────────────────────────────────────────────────────

#[cfg(unix)]
mod finalizer {
    use super::*;

    #[test]
    fn test_finalizer_sees_pipeline_output() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("with space");
        std::fs::create_dir(&scratch).unwrap();
        let copy = dir.path().join("x.bc");
        let opts = CompilerOptions::default()
            .with_temp_dir(&scratch)
            .with_finalizer(format!("cp %(bc) '{}'", copy.display()));
        let cmd = LaunchCommand::with_local_size([2, 1, 1]);
        let m = build(&DeviceDescriptor::host_cpu(), &cmd, true, &opts).unwrap();

        let copied = parse_module(&std::fs::read_to_string(&copy).unwrap()).unwrap();
        assert_eq!(copied, m);
        assert!(m.function("_wg_vector_add").is_some());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_finalizer_output_replaces_module() {
        let dir = tempfile::tempdir().unwrap();
        let replacement = dir.path().join("replacement.ir");
        std::fs::write(&replacement, TWO_KERNELS).unwrap();
        let opts = CompilerOptions::default().with_temp_dir(dir.path());
        let m = parse_module(VECTOR_ADD).unwrap();
        let command = format!("cp '{}' %(bc)", replacement.display());
        let out = run_finalizer(&command, &m, &opts).unwrap();
        assert_eq!(out.kernel_names(), ["fill", "count"]);
    }

    #[test]
    fn test_failing_finalizer() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CompilerOptions::default().with_temp_dir(dir.path());
        let m = parse_module(VECTOR_ADD).unwrap();
        let err = run_finalizer("echo nope; exit 4", &m, &opts).unwrap_err();
        match err {
            CompilerError::Finalizer(msg) => {
                assert!(msg.contains("exit status: 4"));
                assert!(msg.ends_with("nope\n"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_finalizer_garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CompilerOptions::default().with_temp_dir(dir.path());
        let m = parse_module(VECTOR_ADD).unwrap();
        let err = run_finalizer("echo '%%%' > %(bc)", &m, &opts).unwrap_err();
        assert!(matches!(err, CompilerError::Parse(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
