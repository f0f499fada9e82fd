//! The work-group launcher.
//!
//! Each kernel gets a hidden context parameter and its group-level builtins
//! become loads from that context. A `_wg_<kernel>` function with the
//! launch calling convention wraps it, and devices that launch whole grids
//! also get a `_grid_<kernel>` loop over the groups.

use super::{launch_metadata, Pass, PassContext};
use crate::device::DeviceDescriptor;
use crate::ir::{
    addrspace, builtins, BinOp, Block, CastKind, CmpPred, FnAttr, Function, Inst, Module, NameGen,
    Op, Param, Terminator, Type, Value,
};
use crate::launch::WgSpecialization;

/// Prefix of the work-group launcher symbol.
pub const LAUNCHER_PREFIX: &str = "_wg_";
/// Prefix of the grid launcher symbol.
pub const GRID_PREFIX: &str = "_grid_";
/// Function annotation naming the kernel a launcher wraps.
pub(crate) const LAUNCHER_KEY: &str = "wg.launcher";

/// Name of the hidden context parameter.
const CONTEXT_PARAM: &str = "_wg_ctx";
/// Name of the argument buffer parameter of an arg-buffer launcher.
const ARGS_PARAM: &str = "_wg_args";

/// Field indices of the launch context, an array of `i64`.
pub mod context_field {
    pub const WORK_DIM: i64 = 0;
    pub const NUM_GROUPS: i64 = 1;
    pub const GLOBAL_OFFSET: i64 = 4;
    pub const LOCAL_SIZE: i64 = 7;
    pub const GROUP_ID: i64 = 10;
    /// Number of fields.
    pub const COUNT: u64 = 13;
}

pub struct Workgroup {
    context_as: u32,
    args_as: u32,
    arg_buffer: bool,
    grid: bool,
}

impl Workgroup {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Self {
            context_as: device.context_as_id,
            args_as: device.args_as_id,
            arg_buffer: device.arg_buffer_launcher,
            grid: device.grid_launcher,
        }
    }

    fn context_ptr(&self) -> Type {
        Type::Ptr(self.context_as)
    }

    /// Load field `base + dim` of the context.
    fn read_field(
        &self,
        names: &mut NameGen,
        ctx: &Value,
        base: i64,
        dim: Option<&Value>,
        out: &mut Vec<Inst>,
    ) -> Value {
        let index = match dim {
            None => Value::i64(base),
            Some(d) => match d.as_int() {
                Some(c) => Value::i64(base + c.clamp(0, 2)),
                None => {
                    let wide = if d.ty == Type::I64 {
                        d.clone()
                    } else {
                        let n = names.fresh("dim");
                        out.push(Inst::new(
                            n.clone(),
                            Op::Cast {
                                kind: CastKind::ZExt,
                                value: d.clone(),
                                to: Type::I64,
                            },
                        ));
                        Value::local(Type::I64, n)
                    };
                    let n = names.fresh("field");
                    out.push(Inst::new(
                        n.clone(),
                        Op::Binary {
                            op: BinOp::Add,
                            lhs: wide,
                            rhs: Value::i64(base),
                        },
                    ));
                    Value::local(Type::I64, n)
                }
            },
        };
        let ptr = names.fresh("ctx.field");
        out.push(Inst::new(
            ptr.clone(),
            Op::Gep {
                elem: Type::I64,
                base: ctx.clone(),
                index,
            },
        ));
        let value = names.fresh("ctx.value");
        out.push(Inst::new(
            value.clone(),
            Op::Load {
                ty: Type::I64,
                ptr: Value::local(self.context_ptr(), ptr),
            },
        ));
        Value::local(Type::I64, value)
    }

    /// Value of a group-level builtin call, or `None` to keep the call.
    fn builtin_value(
        &self,
        callee: &str,
        args: &[Value],
        spec: &WgSpecialization,
        names: &mut NameGen,
        ctx: &Value,
        out: &mut Vec<Inst>,
    ) -> Option<Value> {
        let dim = args.first();
        let static_dim = |sizes: [u64; 3]| {
            dim.and_then(Value::as_int)
                .map(|d| Value::i64(sizes.get(d as usize).copied().unwrap_or(1).max(1) as i64))
        };
        let value = match callee {
            builtins::GET_WORK_DIM => {
                self.read_field(names, ctx, context_field::WORK_DIM, None, out)
            }
            builtins::GET_NUM_GROUPS => {
                self.read_field(names, ctx, context_field::NUM_GROUPS, dim, out)
            }
            builtins::GET_GROUP_ID => {
                self.read_field(names, ctx, context_field::GROUP_ID, dim, out)
            }
            builtins::GET_GLOBAL_OFFSET if spec.assume_zero_global_offset => Value::i64(0),
            builtins::GET_GLOBAL_OFFSET => {
                self.read_field(names, ctx, context_field::GLOBAL_OFFSET, dim, out)
            }
            builtins::GET_LOCAL_SIZE => match spec.static_local_size().and_then(static_dim) {
                Some(v) => v,
                None => self.read_field(names, ctx, context_field::LOCAL_SIZE, dim, out),
            },
            builtins::GET_GLOBAL_SIZE => {
                let groups = self.read_field(names, ctx, context_field::NUM_GROUPS, dim, out);
                let size = match spec.static_local_size().and_then(static_dim) {
                    Some(v) => v,
                    None => self.read_field(names, ctx, context_field::LOCAL_SIZE, dim, out),
                };
                let n = names.fresh("global_size");
                out.push(Inst::new(
                    n.clone(),
                    Op::Binary {
                        op: BinOp::Mul,
                        lhs: groups,
                        rhs: size,
                    },
                ));
                Value::local(Type::I64, n)
            }
            _ => return None,
        };
        Some(value)
    }

    /// Add the context parameter and rewrite group-level builtins. Returns
    /// the context parameter name.
    fn rewrite_kernel(&self, f: &mut Function, spec: &WgSpecialization) -> String {
        let mut names = NameGen::for_function(f);
        let ctx_name = names.fresh(CONTEXT_PARAM);
        f.params.push(Param {
            name: ctx_name.clone(),
            ty: self.context_ptr(),
        });
        let ctx = Value::local(self.context_ptr(), ctx_name.clone());
        let mut replacements = Vec::new();
        for b in f.blocks.iter_mut() {
            let mut insts = Vec::with_capacity(b.insts.len());
            for inst in std::mem::take(&mut b.insts) {
                let (Op::Call { callee, args, ret }, Some(r)) = (&inst.op, &inst.result) else {
                    insts.push(inst);
                    continue;
                };
                let Some(value) = self.builtin_value(callee, args, spec, &mut names, &ctx, &mut insts) else {
                    insts.push(inst);
                    continue;
                };
                match (value.as_local(), *ret) {
                    (Some(_), Type::I64) => replacements.push((r.clone(), value)),
                    (Some(_), ty) => insts.push(Inst::new(
                        r.clone(),
                        Op::Cast {
                            kind: CastKind::Trunc,
                            value,
                            to: ty,
                        },
                    )),
                    (None, ty) => replacements.push((
                        r.clone(),
                        Value::int(ty, value.as_int().unwrap_or(0)),
                    )),
                }
            }
            b.insts = insts;
        }
        for (r, v) in &replacements {
            f.replace_all_uses(r, v);
        }
        ctx_name
    }

    /// `_wg_<kernel>`: unpack the arguments and call the kernel.
    fn launcher(&self, kernel: &Function) -> Function {
        let name = format!("{}{}", LAUNCHER_PREFIX, kernel.name);
        let (kernel_params, ctx_param) = kernel.params.split_at(kernel.params.len() - 1);
        let mut f = Function::declaration(name, Type::Void, Vec::new());
        let mut entry = Block::new("entry", Terminator::Ret(None));
        let mut args: Vec<Value> = Vec::with_capacity(kernel.params.len());
        if self.arg_buffer {
            let buffer = Type::Ptr(self.args_as);
            f.params.push(Param {
                name: ARGS_PARAM.to_string(),
                ty: buffer,
            });
            for (i, p) in kernel_params.iter().enumerate() {
                let slot_ptr = format!("{}.slot.ptr", p.name);
                let slot = format!("{}.slot", p.name);
                entry.insts.push(Inst::new(
                    slot_ptr.clone(),
                    Op::Gep {
                        elem: Type::Ptr(addrspace::PRIVATE),
                        base: Value::local(buffer, ARGS_PARAM),
                        index: Value::i64(i as i64),
                    },
                ));
                entry.insts.push(Inst::new(
                    slot.clone(),
                    Op::Load {
                        ty: Type::Ptr(addrspace::PRIVATE),
                        ptr: Value::local(buffer, slot_ptr),
                    },
                ));
                entry.insts.push(Inst::new(
                    p.name.clone(),
                    Op::Load {
                        ty: p.ty,
                        ptr: Value::local(Type::Ptr(addrspace::PRIVATE), slot),
                    },
                ));
                args.push(Value::local(p.ty, p.name.clone()));
            }
        } else {
            for p in kernel_params {
                f.params.push(p.clone());
                args.push(Value::local(p.ty, p.name.clone()));
            }
        }
        for p in ctx_param {
            f.params.push(p.clone());
            args.push(Value::local(p.ty, p.name.clone()));
        }
        entry
            .insts
            .push(Inst::call(None, Type::Void, &kernel.name, args));
        f.blocks.push(entry);
        f.annotations
            .insert(LAUNCHER_KEY.to_string(), kernel.name.clone());
        f
    }

    /// `_grid_<kernel>`: run the launcher once per group of the grid.
    fn grid_launcher(&self, kernel_name: &str, launcher: &Function) -> Function {
        let mut f = Function::declaration(
            format!("{}{}", GRID_PREFIX, kernel_name),
            Type::Void,
            Vec::new(),
        );
        f.params = launcher.params.clone();
        let ctx_ty = self.context_ptr();
        let ctx = f
            .params
            .last()
            .map(|p| Value::local(ctx_ty, p.name.clone()))
            .unwrap_or_else(|| Value::local(ctx_ty, CONTEXT_PARAM));
        let call_args: Vec<Value> = f
            .params
            .iter()
            .map(|p| Value::local(p.ty, p.name.clone()))
            .collect();

        let field = |insts: &mut Vec<Inst>, name: &str, index: i64| {
            insts.push(Inst::new(
                name,
                Op::Gep {
                    elem: Type::I64,
                    base: ctx.clone(),
                    index: Value::i64(index),
                },
            ));
            Value::local(ctx_ty, name)
        };

        let dims = ["x", "y", "z"];
        let mut entry = Block::new("entry", Terminator::Br("group.z".to_string()));
        let mut counts = Vec::new();
        for (d, dim) in dims.iter().enumerate() {
            let ptr = field(&mut entry.insts, &format!("groups.{}.ptr", dim), context_field::NUM_GROUPS + d as i64);
            let n = format!("groups.{}", dim);
            entry.insts.push(Inst::new(
                n.clone(),
                Op::Load {
                    ty: Type::I64,
                    ptr,
                },
            ));
            counts.push(Value::local(Type::I64, n));
        }

        // Headers outermost first: z, y, x. Each stores its group id.
        let order = [2usize, 1, 0];
        let mut blocks = vec![entry];
        for (pos, &d) in order.iter().enumerate() {
            let dim = dims[d];
            let from = if pos == 0 {
                "entry".to_string()
            } else {
                format!("group.{}", dims[order[pos - 1]])
            };
            let next = if pos + 1 < order.len() {
                format!("group.{}", dims[order[pos + 1]])
            } else {
                "launch".to_string()
            };
            let mut header = Block::new(format!("group.{}", dim), Terminator::Br(next));
            header.insts.push(Inst::new(
                format!("gid.{}", dim),
                Op::Phi {
                    ty: Type::I64,
                    incoming: vec![
                        (Value::i64(0), from),
                        (
                            Value::local(Type::I64, format!("gid.{}.next", dim)),
                            format!("latch.{}", dim),
                        ),
                    ],
                },
            ));
            let ptr = field(&mut header.insts, &format!("gid.{}.ptr", dim), context_field::GROUP_ID + d as i64);
            header.insts.push(Inst::void(Op::Store {
                value: Value::local(Type::I64, format!("gid.{}", dim)),
                ptr,
            }));
            blocks.push(header);
        }
        let mut launch = Block::new("launch", Terminator::Br("latch.x".to_string()));
        launch
            .insts
            .push(Inst::call(None, Type::Void, &launcher.name, call_args));
        blocks.push(launch);

        // Latches innermost first: x, y, z.
        for (pos, &d) in order.iter().rev().enumerate() {
            let dim = dims[d];
            let out = if pos + 1 < order.len() {
                format!("latch.{}", dims[order[order.len() - 2 - pos]])
            } else {
                "done".to_string()
            };
            let next = format!("gid.{}.next", dim);
            let more = format!("gid.{}.more", dim);
            let mut latch = Block::new(
                format!("latch.{}", dim),
                Terminator::CondBr {
                    cond: Value::local(Type::I1, more.clone()),
                    then_bb: format!("group.{}", dim),
                    else_bb: out,
                },
            );
            latch.insts.push(Inst::new(
                next.clone(),
                Op::Binary {
                    op: BinOp::Add,
                    lhs: Value::local(Type::I64, format!("gid.{}", dim)),
                    rhs: Value::i64(1),
                },
            ));
            latch.insts.push(Inst::new(
                more,
                Op::Cmp {
                    pred: CmpPred::Ult,
                    lhs: Value::local(Type::I64, next),
                    rhs: counts[d].clone(),
                },
            ));
            blocks.push(latch);
        }
        blocks.push(Block::new("done", Terminator::Ret(None)));
        f.blocks = blocks;
        f.annotations
            .insert(LAUNCHER_KEY.to_string(), kernel_name.to_string());
        f
    }
}

impl Pass for Workgroup {
    fn name(&self) -> &'static str {
        "workgroup"
    }

    fn run(&self, m: &mut Module, _cx: &mut PassContext<'_>) -> bool {
        let spec = launch_metadata(m)
            .map(|l| l.spec)
            .unwrap_or_else(WgSpecialization::generic);
        let kernels: Vec<String> = m
            .kernels()
            .filter(|f| !f.is_declaration())
            .map(|f| f.name.clone())
            .collect();
        let mut added = Vec::new();
        for name in &kernels {
            let Some(f) = m.function_mut(name) else { continue };
            self.rewrite_kernel(f, &spec);
            f.attrs.remove(&FnAttr::Kernel);
            f.attrs.remove(&FnAttr::NoInline);
            f.attrs.insert(FnAttr::AlwaysInline);
            let launcher = self.launcher(f);
            if self.grid {
                added.push(self.grid_launcher(name, &launcher));
            }
            added.push(launcher);
            log::debug!("@{}: emitted work-group launcher", name);
        }
        // Launchers stay ahead of grid launchers in the output.
        added.sort_by_key(|f| f.name.starts_with(GRID_PREFIX));
        m.functions.extend(added);
        m.remove_unused_declarations();
        !kernels.is_empty()
    }
}
