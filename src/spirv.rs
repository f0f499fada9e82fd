//! Conversion of IR modules to SPIR-V through an external converter.

use std::ffi::OsString;
use std::path::Path;

use crate::config::CompilerOptions;
use crate::error::Result;
use crate::ir::Module;
use crate::tools;

/// First word of every SPIR-V binary.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const MAX_SPIRV_VERSION: &str = "--spirv-max-version=1.2";

/// Extensions the converter may use.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "SPV_INTEL_subgroups",
    "SPV_INTEL_usm_storage_classes",
    "SPV_INTEL_arbitrary_precision_integers",
    "SPV_INTEL_arbitrary_precision_fixed_point",
    "SPV_INTEL_arbitrary_precision_floating_point",
    "SPV_INTEL_kernel_attributes",
];

fn extension_arg() -> String {
    let list = ALLOWED_EXTENSIONS
        .iter()
        .map(|e| format!("+{}", e))
        .collect::<Vec<_>>()
        .join(",");
    format!("--spirv-ext={}", list)
}

/// Converter command line, program name excluded.
pub fn converter_args(opts: &CompilerOptions, output: &Path, input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![extension_arg().into()];
    if opts.opaque_pointers {
        args.push("--opaque-pointers".into());
    }
    args.push(MAX_SPIRV_VERSION.into());
    args.push("-o".into());
    args.push(output.into());
    args.push(input.into());
    args
}

/// Whether `bytes` starts with the SPIR-V magic number, in either byte order.
pub fn has_magic(bytes: &[u8]) -> bool {
    let Some(word) = bytes.get(..4) else {
        return false;
    };
    let word = [word[0], word[1], word[2], word[3]];
    u32::from_le_bytes(word) == SPIRV_MAGIC || u32::from_be_bytes(word) == SPIRV_MAGIC
}

/// Convert the module stored at `input` and return the SPIR-V bytes. A
/// converter failure is appended to `build_log` along with its output.
pub fn convert_file(input: &Path, opts: &CompilerOptions, build_log: &mut String) -> Result<Vec<u8>> {
    let out_file = tools::scratch_file(opts, "clwg-", ".spirv")?;
    let args = converter_args(opts, out_file.path(), input);

    let run = tools::run_capture(&opts.spirv_converter, &args).and_then(|out| {
        if out.success() {
            return Ok(());
        }
        build_log.push_str("llvm-spirv failed with output:\n");
        build_log.push_str(&out.output);
        if !build_log.ends_with('\n') {
            build_log.push('\n');
        }
        out.check(&opts.spirv_converter).map(|_| ())
    });
    let result = run.and_then(|()| tools::read_file(out_file.path()));
    tools::finish_scratch(out_file, opts);
    if let Ok(bytes) = &result {
        log::debug!("converted {} to {} bytes of SPIR-V", input.display(), bytes.len());
    }
    result
}

/// Write `module` to a scratch file and convert it.
pub fn convert_module(module: &Module, opts: &CompilerOptions, build_log: &mut String) -> Result<Vec<u8>> {
    let bc = tools::scratch_file(opts, "clwg-", ".bc")?;
    let written = tools::write_file(bc.path(), module.to_text().as_bytes());
    let result = written.and_then(|()| convert_file(bc.path(), opts, build_log));
    tools::finish_scratch(bc, opts);
    result
}

/// A stand-in converter that writes the magic number followed by the name
/// of its input file to the `-o` path.
#[cfg(all(test, unix))]
pub(crate) fn stand_in_converter(dir: &Path) -> std::path::PathBuf {
    tools::write_script(
        dir,
        "fake-llvm-spirv",
        r#"out=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
  last="$arg"
done
printf '\003\002\043\007' > "$out"
printf '%s' "$last" >> "$out"
"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompilerError;
    use crate::ir::parse_module;

    #[test]
    fn test_converter_args_order() {
        let opts = CompilerOptions::default();
        let args = converter_args(&opts, Path::new("/t/k.spirv"), Path::new("/t/k.bc"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args[0].starts_with("--spirv-ext=+SPV_INTEL_subgroups,"));
        assert!(args[0].ends_with(",+SPV_INTEL_kernel_attributes"));
        assert_eq!(
            &args[1..],
            &["--opaque-pointers", "--spirv-max-version=1.2", "-o", "/t/k.spirv", "/t/k.bc"]
        );
    }

    #[test]
    fn test_typed_pointers_drop_the_toggle() {
        let opts = CompilerOptions::default().with_opaque_pointers(false);
        let args = converter_args(&opts, Path::new("o"), Path::new("i"));
        assert!(!args.iter().any(|a| a == "--opaque-pointers"));
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn test_magic_detection() {
        assert!(has_magic(&[0x03, 0x02, 0x23, 0x07, 0xff]));
        assert!(has_magic(&[0x07, 0x23, 0x02, 0x03]));
        assert!(!has_magic(&[0x03, 0x02, 0x23]));
        assert!(!has_magic(b"BC\xc0\xde"));
    }

    #[cfg(unix)]
    #[test]
    fn test_convert_module_with_stand_in() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stand_in_converter(dir.path());
        let opts = CompilerOptions::default()
            .with_spirv_converter(tool.to_string_lossy())
            .with_temp_dir(dir.path());
        let m = parse_module(include_str!("../tests/fixtures/vector_add.ir")).unwrap();
        let mut log = String::new();
        let bytes = convert_module(&m, &opts, &mut log).unwrap();
        assert!(has_magic(&bytes));
        assert!(bytes.len() > 4);
        assert!(log.is_empty());
        // Only the converter script itself is left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_converter_failure_lands_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tools::write_script(dir.path(), "bad-spirv", "echo 'unsupported type' >&2\nexit 1\n");
        let opts = CompilerOptions::default()
            .with_spirv_converter(tool.to_string_lossy())
            .with_temp_dir(dir.path());
        let m = parse_module(include_str!("../tests/fixtures/vector_add.ir")).unwrap();
        let mut log = String::from("earlier\n");
        let err = convert_module(&m, &opts, &mut log).unwrap_err();
        assert!(matches!(err, CompilerError::ExternalTool { .. }));
        assert_eq!(log, "earlier\nllvm-spirv failed with output:\nunsupported type\n");
    }
}
