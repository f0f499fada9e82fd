use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::device::InitHook;
use crate::ir::parse_module;

const VECTOR_ADD: &str = include_str!("../../tests/fixtures/vector_add.ir");

fn vector_add() -> Module {
    parse_module(VECTOR_ADD).unwrap()
}

// ─── Registry ─────────────────────────────────────────────────────

#[test]
fn test_lookup_by_triple() {
    assert_eq!(lookup_target("x86_64-unknown-linux-gnu").unwrap().arch, Arch::X86_64);
    assert_eq!(lookup_target("arm64-apple-darwin").unwrap().arch, Arch::Aarch64);
    assert_eq!(lookup_target("riscv64-unknown-elf").unwrap().arch, Arch::RiscV64);
    assert!(lookup_target("spir64-unknown-unknown").is_none());
    assert!(lookup_target("spir").is_none());
}

#[test]
fn test_unknown_arch_hits_unusable_fallback() {
    let t = lookup_target("mips-unknown-linux").unwrap();
    assert_eq!(t.name, "cpp");
    assert!(!t.is_usable());
    assert_eq!(registered_targets().iter().filter(|t| t.is_usable()).count(), 3);
}

#[test]
fn test_create_rejects_fallback_and_spir() {
    let opts = CompilerOptions::default();
    let mips = DeviceDescriptor::host_cpu().with_triple("mips-unknown-linux");
    assert!(Backend::create(&mips, &opts).is_none());
    let spir = DeviceDescriptor::host_cpu().with_triple("spir64-unknown-unknown");
    assert!(Backend::create(&spir, &opts).is_none());
}

// ─── Machine configuration ────────────────────────────────────────

#[test]
fn test_machine_options() {
    let opts = CompilerOptions::default();
    let b = Backend::create(&DeviceDescriptor::vortex(), &opts).unwrap();
    let m = b.machine();
    assert_eq!(m.reloc, RelocModel::Pic);
    assert_eq!(m.code_model, CodeModel::Small);
    assert_eq!(m.opt_level, OptLevel::Aggressive);
    assert_eq!(m.float_abi, FloatAbi::build_default());
    assert!(m.has_feature("m"));
    assert!(m.has_feature("+f"));
    assert!(!m.has_feature("v"));
}

#[test]
fn test_init_hook_adjusts_machine() {
    let hook = InitHook::new(|m: &mut TargetMachine| {
        m.cpu = "skylake-avx512".to_string();
        m.features = "+avx512f".to_string();
    });
    let device = DeviceDescriptor::host_cpu().with_init_hook(hook);
    let b = Backend::create(&device, &CompilerOptions::default()).unwrap();
    assert_eq!(b.machine().cpu, "skylake-avx512");
    assert_eq!(b.target_info().vector_bits, 512);
    assert_eq!(b.target_info().lanes(32), 16);
}

#[test]
fn test_vector_width_by_family() {
    let opts = CompilerOptions::default();
    let x86 = Backend::create(&DeviceDescriptor::host_cpu(), &opts).unwrap();
    assert_eq!(x86.target_info().vector_bits, 128);
    let arm = DeviceDescriptor::host_cpu().with_triple("aarch64-unknown-linux-gnu");
    assert_eq!(Backend::create(&arm, &opts).unwrap().target_info().vector_bits, 128);
    let rv = Backend::create(&DeviceDescriptor::vortex(), &opts).unwrap();
    assert_eq!(rv.target_info().vector_bits, 0);
    assert_eq!(rv.target_info().lanes(32), 0);
}

// ─── Factory ──────────────────────────────────────────────────────

#[test]
fn test_factory_memoizes_per_device() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let device = DeviceDescriptor::host_cpu().with_init_hook(InitHook::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let factory = BackendFactory::new();
    let opts = CompilerOptions::default();
    let a = factory.get(&device, &opts).unwrap();
    let b = factory.get(&device, &opts).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let other = factory.get(&DeviceDescriptor::vortex(), &opts).unwrap();
    assert!(!Arc::ptr_eq(&a, &other));
    assert_eq!(factory.len(), 2);

    factory.clear();
    assert!(factory.is_empty());
}

#[test]
fn test_factory_does_not_cache_misses() {
    let factory = BackendFactory::new();
    let spir = DeviceDescriptor::spmd_gpu().with_triple("spir64-unknown-unknown");
    assert!(factory.get(&spir, &CompilerOptions::default()).is_none());
    assert!(factory.is_empty());
}

// ─── Emission ─────────────────────────────────────────────────────

#[test]
fn test_riscv_is_assembly_only() {
    let b = Backend::create(&DeviceDescriptor::vortex(), &CompilerOptions::default()).unwrap();
    assert!(b.supports(FileType::Assembly));
    assert!(!b.supports(FileType::Object));
    assert!(b.emit(&vector_add(), FileType::Object).is_none());
}

#[test]
fn test_x86_listing() {
    let b = Backend::create(&DeviceDescriptor::host_cpu(), &CompilerOptions::default()).unwrap();
    let text = String::from_utf8(b.emit(&vector_add(), FileType::Assembly).unwrap()).unwrap();
    assert!(text.contains("\t.globl\tvector_add\n"));
    assert!(text.contains("\t.type\tvector_add,@function\n"));
    assert!(text.contains(".Lvector_add_entry:\n"));
    assert!(text.contains("\tcall\t%gid, get_global_id, 0"));
    assert!(text.contains("\t.size\tvector_add, .Lfunc_end_vector_add-vector_add\n"));
    // Declarations produce no code.
    assert!(!text.contains("get_global_id:"));
}

#[test]
fn test_riscv_attribute_directive() {
    let b = Backend::create(&DeviceDescriptor::vortex(), &CompilerOptions::default()).unwrap();
    let mut m = vector_add();
    let text = String::from_utf8(b.emit(&m, FileType::Assembly).unwrap()).unwrap();
    assert!(text.contains(".attribute"));
    m.set_meta(RISCV_NO_ATTRIBUTES_KEY, crate::ir::MetaValue::Bool(true));
    let text = String::from_utf8(b.emit(&m, FileType::Assembly).unwrap()).unwrap();
    assert!(!text.contains(".attribute"));
}

#[test]
fn test_object_symbols() {
    let b = Backend::create(&DeviceDescriptor::host_cpu(), &CompilerOptions::default()).unwrap();
    let bytes = b.emit(&vector_add(), FileType::Object).unwrap();
    assert_eq!(&bytes[..4], b"\x7fELF");
    assert_eq!(object::elf_machine(&bytes), Some(62));
    let syms = object::read_function_symbols(&bytes).unwrap();
    assert_eq!(syms.len(), 1);
    assert_eq!(syms[0].name, "vector_add");
    assert_eq!(syms[0].value, 0);
    assert!(syms[0].size > 0);
}

#[test]
fn test_object_aligns_functions() {
    let funcs = vec![
        ("a".to_string(), vec![1u8; 5]),
        ("b".to_string(), vec![2u8; 20]),
    ];
    let bytes = object::write_relocatable(183, &funcs);
    let syms = object::read_function_symbols(&bytes).unwrap();
    assert_eq!(syms[0].value, 0);
    assert_eq!(syms[1].value, 16);
    assert_eq!(syms[1].size, 20);
    assert_eq!(object::elf_machine(&bytes), Some(183));
}

#[test]
fn test_reader_rejects_non_elf() {
    assert!(object::elf_machine(b"not an object").is_none());
    assert!(object::read_function_symbols(&[]).is_none());
}
