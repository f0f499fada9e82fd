use super::*;
use crate::device::DeviceDescriptor;
use crate::error::CompilerError;
use crate::ir::parse_module;
use crate::target::object;

const VECTOR_ADD: &str = include_str!("../../tests/fixtures/vector_add.ir");

fn backend(device: &DeviceDescriptor) -> Backend {
    Backend::create(device, &CompilerOptions::default()).unwrap()
}

#[test]
fn test_object_path_preferred() {
    let m = parse_module(VECTOR_ADD).unwrap();
    let opts = CompilerOptions::default()
        .with_cross_compile(false)
        .with_assembler("clwg-assembler-must-not-run");
    let out = codegen(&backend(&DeviceDescriptor::host_cpu()), &m, &opts).unwrap();
    assert_eq!(out.path, EmitPath::Object);
    assert_eq!(object::elf_machine(&out.bytes), Some(62));
}

#[cfg(unix)]
mod assembler {
    use super::*;
    use crate::tools::write_script;

    /// Copies the assembly to the object path.
    fn copying_assembler(dir: &std::path::Path) -> String {
        write_script(dir, "fake-cc", "[ \"$2\" = -c ] && [ \"$3\" = -o ] || exit 9\ncp \"$1\" \"$4\"\n")
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_cross_compile_takes_assembler_path() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let opts = CompilerOptions::default()
            .with_cross_compile(true)
            .with_assembler(copying_assembler(dir.path()))
            .with_temp_dir(&scratch)
            .with_leave_temp_files(true);
        let b = backend(&DeviceDescriptor::host_cpu());
        let m = parse_module(VECTOR_ADD).unwrap();

        let out = codegen(&b, &m, &opts).unwrap();
        assert_eq!(out.path, EmitPath::Assembler);
        assert_eq!(out.bytes, b.emit(&m, FileType::Assembly).unwrap());

        let mut kept: Vec<String> = std::fs::read_dir(&scratch)
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                path.extension().unwrap().to_string_lossy().into_owned()
            })
            .collect();
        kept.sort();
        assert_eq!(kept, ["o", "s"]);
    }

    #[test]
    fn test_assembly_only_target_uses_assembler() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CompilerOptions::default()
            .with_cross_compile(false)
            .with_assembler(copying_assembler(dir.path()))
            .with_temp_dir(dir.path());
        let m = parse_module(VECTOR_ADD).unwrap();
        let out = codegen(&backend(&DeviceDescriptor::vortex()), &m, &opts).unwrap();
        assert_eq!(out.path, EmitPath::Assembler);
        assert!(String::from_utf8(out.bytes).unwrap().contains("vector_add"));
        // Scratch files are gone; only the script remains.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_assembler_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cc = write_script(dir.path(), "bad-cc", "echo \"$1: unknown directive\" >&2\nexit 1\n");
        let opts = CompilerOptions::default()
            .with_cross_compile(true)
            .with_assembler(cc.to_string_lossy())
            .with_temp_dir(dir.path());
        let m = parse_module(VECTOR_ADD).unwrap();
        let err = codegen(&backend(&DeviceDescriptor::host_cpu()), &m, &opts).unwrap_err();
        match err {
            CompilerError::ExternalTool { output, .. } => {
                assert!(output.contains(".s: unknown directive"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
