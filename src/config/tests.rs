use std::collections::HashMap;

use super::*;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |k| map.get(k).cloned()
}

#[test]
fn test_defaults() {
    let opts = CompilerOptions::default();
    assert_eq!(opts.wg_method, WorkGroupMethod::LoopVec);
    assert_eq!(opts.spirv_converter, "llvm-spirv");
    assert_eq!(opts.assembler_driver, "clang");
    assert!(opts.opaque_pointers);
    assert!(opts.bitcode_finalizer.is_none());
    assert_eq!(opts.cross_compile, cfg!(feature = "cross-compilation"));
}

#[test]
fn test_empty_environment_keeps_defaults() {
    assert_eq!(CompilerOptions::from_lookup(env(&[])), CompilerOptions::default());
}

#[test]
fn test_environment_overrides() {
    let opts = CompilerOptions::from_lookup(env(&[
        ("CLWG_LLVM_VERIFY", "1"),
        ("CLWG_LEAVE_KERNEL_COMPILER_TEMP_FILES", "yes"),
        ("CLWG_VECTORIZER_REMARKS", "on"),
        ("CLWG_BITCODE_FINALIZER", "cp %(bc) /tmp/x.bc"),
        ("CLWG_WORK_GROUP_METHOD", "cbs"),
        ("CLWG_SPIRV", "/opt/bin/llvm-spirv"),
        ("CLWG_ASSEMBLER", "/usr/bin/gcc"),
        ("CLWG_CACHE_DIR", "/var/cache/clwg"),
    ]));
    assert!(opts.verify_modules);
    assert!(opts.leave_temp_files);
    assert!(opts.vectorizer_remarks);
    assert_eq!(opts.bitcode_finalizer.as_deref(), Some("cp %(bc) /tmp/x.bc"));
    assert_eq!(opts.wg_method, WorkGroupMethod::Cbs);
    assert_eq!(opts.spirv_converter, "/opt/bin/llvm-spirv");
    assert_eq!(opts.assembler_driver, "/usr/bin/gcc");
    assert_eq!(opts.cache_dir, Some(PathBuf::from("/var/cache/clwg")));
}

#[test]
fn test_bad_values_are_ignored() {
    let opts = CompilerOptions::from_lookup(env(&[
        ("CLWG_LLVM_VERIFY", "maybe"),
        ("CLWG_WORK_GROUP_METHOD", "threads"),
        ("CLWG_BITCODE_FINALIZER", "   "),
    ]));
    let defaults = CompilerOptions::default();
    assert_eq!(opts.verify_modules, defaults.verify_modules);
    assert_eq!(opts.wg_method, WorkGroupMethod::LoopVec);
    assert!(opts.bitcode_finalizer.is_none());
}

#[test]
fn test_flag_false_overrides_default() {
    let opts = CompilerOptions::from_lookup(env(&[("CLWG_LLVM_VERIFY", "0")]));
    assert!(!opts.verify_modules);
}

#[test]
fn test_wg_method_parse() {
    assert_eq!("loops".parse(), Ok(WorkGroupMethod::Loops));
    assert_eq!("workitemrepl".parse(), Ok(WorkGroupMethod::Repl));
    assert_eq!(" AUTO ".parse(), Ok(WorkGroupMethod::Auto));
    assert!("spmd".parse::<WorkGroupMethod>().is_err());
}

#[test]
fn test_vectorizer_methods() {
    assert!(WorkGroupMethod::LoopVec.wants_vectorizer());
    assert!(WorkGroupMethod::Cbs.wants_vectorizer());
    assert!(!WorkGroupMethod::Loops.wants_vectorizer());
    assert!(!WorkGroupMethod::Repl.wants_vectorizer());
    assert!(!WorkGroupMethod::Auto.wants_vectorizer());
}

#[test]
fn test_builders() {
    let opts = CompilerOptions::default()
        .with_verify(true)
        .with_finalizer("true")
        .with_cross_compile(true)
        .with_temp_dir("/scratch");
    assert!(opts.verify_modules);
    assert_eq!(opts.bitcode_finalizer.as_deref(), Some("true"));
    assert!(opts.cross_compile);
    assert_eq!(opts.temp_root(), PathBuf::from("/scratch"));
}
