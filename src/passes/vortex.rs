//! Vortex RISC-V GPGPU adjustments.

use super::{for_each_defined, Pass, PassContext};
use crate::ir::{builtins, Inst, MetaValue, Module, NameGen, Op, Type, Value};
use crate::target::RISCV_NO_ATTRIBUTES_KEY;

const PRINTF: &str = "printf";
const VX_PRINTF: &str = "vx_printf";
const VX_BARRIER: &str = "vx_barrier";
const VX_NUM_WARPS: &str = "vx_num_warps";

/// The Vortex toolchain rejects RISC-V attribute sections.
pub struct NoRiscvAttribute;

impl Pass for NoRiscvAttribute {
    fn name(&self) -> &'static str {
        "vortex-mno-riscv-attribute"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        if m.meta_bool(RISCV_NO_ATTRIBUTES_KEY) == Some(true) {
            return false;
        }
        m.set_meta(RISCV_NO_ATTRIBUTES_KEY, MetaValue::Bool(true));
        true
    }
}

/// Route `printf` to the device runtime's `vx_printf`.
pub struct Printfs;

impl Pass for Printfs {
    fn name(&self) -> &'static str {
        "vortex-printfs"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let Some((ret, params)) = m
            .function(PRINTF)
            .map(|f| (f.ret, f.params.iter().map(|p| p.ty).collect::<Vec<_>>()))
        else {
            return false;
        };
        let changed = for_each_defined(m, |f| {
            let mut changed = false;
            for inst in f.blocks.iter_mut().flat_map(|b| b.insts.iter_mut()) {
                if let Op::Call { callee, .. } = &mut inst.op {
                    if callee == PRINTF {
                        *callee = VX_PRINTF.to_string();
                        changed = true;
                    }
                }
            }
            changed
        });
        if changed {
            m.declare(VX_PRINTF, ret, params);
            m.remove_unused_declarations();
        }
        changed
    }
}

/// Work-group barriers become warp barriers across all warps of the core.
pub struct Barriers;

impl Pass for Barriers {
    fn name(&self) -> &'static str {
        "vortex-barriers"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let changed = for_each_defined(m, |f| {
            let mut names = NameGen::for_function(f);
            let mut changed = false;
            for b in f.blocks.iter_mut() {
                let mut insts = Vec::with_capacity(b.insts.len());
                for inst in std::mem::take(&mut b.insts) {
                    if !inst.callee().is_some_and(builtins::is_barrier) {
                        insts.push(inst);
                        continue;
                    }
                    let warps = names.fresh("nw");
                    insts.push(Inst::call(
                        Some(warps.clone()),
                        Type::I32,
                        VX_NUM_WARPS,
                        Vec::new(),
                    ));
                    insts.push(Inst::call(
                        None,
                        Type::Void,
                        VX_BARRIER,
                        vec![Value::i32(0), Value::local(Type::I32, warps)],
                    ));
                    changed = true;
                }
                b.insts = insts;
            }
            changed
        });
        if changed {
            m.declare(VX_NUM_WARPS, Type::I32, Vec::new());
            m.declare(VX_BARRIER, Type::Void, vec![Type::I32, Type::I32]);
            m.remove_unused_declarations();
        }
        changed
    }
}
