//! Region formation: run every work-item of a group inside one function.
//!
//! After barrier normalization each barrier sits alone in its block. The
//! blocks reachable between barriers form a region, and each region is
//! cloned into a loop over the work-items of the group (or, for small
//! static groups, into one copy per work-item). Values that cross region
//! boundaries go through per-work-item context slots, and private allocas
//! become arrays indexed by the linear work-item id.
//!
//! Three shapes are produced:
//! - `workitemloops`: nested z/y/x loops.
//! - `subcfgformation`: a single loop over the linear id.
//! - `workitemrepl`: one copy per work-item, chained.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::workitem::HANDLER_KEY;
use super::{launch_metadata, Pass, PassContext, Uniformity, WorkItemAccess};
use crate::device::DeviceDescriptor;
use crate::ir::cfg::Cfg;
use crate::ir::{
    addrspace, block_has_barrier, builtins, BinOp, Block, CastKind, CmpPred, Function, Inst, Module, NameGen,
    Op, Terminator, Type, Value,
};

/// Function annotation listing the headers of work-item loops.
pub(crate) const LOOPS_KEY: &str = "wi.loops";
/// Function annotation listing the work-item loops whose stores never
/// alias between work-items.
pub(crate) const PARALLEL_KEY: &str = "wi.parallel";
/// Function annotation holding the region count of a formed kernel.
pub(crate) const REGIONS_KEY: &str = "wi.regions";

const DIMS: [&str; 3] = ["x", "y", "z"];

/// Position used for uses in a block terminator.
const TERMINATOR: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Nest,
    Flat,
    Replicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Exit {
    Barrier(String),
    Return,
}

#[derive(Debug)]
struct Region {
    entry: String,
    /// Member blocks, entry first, the rest in function order.
    blocks: Vec<String>,
    /// Only allocas and branches on parameters: run once, not per work-item.
    trivial: bool,
    exits: Vec<Exit>,
}

/// What the clones may assume about the launch.
struct Launch {
    capacity: u64,
    static_size: Option<[u64; 3]>,
    zero_offset: bool,
}

/// Uses that cannot see their definition inside a region clone, as
/// `(block, position, value)`.
type SlotUses = HashSet<(String, usize, String)>;

fn find_regions(f: &Function, barrier_blocks: &HashSet<String>) -> Vec<Region> {
    let params: HashSet<&str> = f.params.iter().map(|p| p.name.as_str()).collect();
    let mut entries = vec![f.blocks[0].label.clone()];
    for b in f.blocks.iter().filter(|b| barrier_blocks.contains(&b.label)) {
        for s in b.term.successors() {
            if !barrier_blocks.contains(s) && !entries.iter().any(|e| e == s) {
                entries.push(s.to_string());
            }
        }
    }
    entries
        .into_iter()
        .map(|entry| {
            let mut members = HashSet::new();
            let mut work = vec![entry.clone()];
            while let Some(label) = work.pop() {
                if barrier_blocks.contains(&label) || !members.insert(label.clone()) {
                    continue;
                }
                if let Some(b) = f.block(&label) {
                    work.extend(b.term.successors().into_iter().map(String::from));
                }
            }
            let mut blocks = vec![entry.clone()];
            blocks.extend(
                f.blocks
                    .iter()
                    .filter(|b| b.label != entry && members.contains(&b.label))
                    .map(|b| b.label.clone()),
            );
            let mut exits = Vec::new();
            let mut trivial = true;
            for b in blocks.iter().filter_map(|l| f.block(l)) {
                let mut found: Vec<Exit> = b
                    .term
                    .successors()
                    .into_iter()
                    .filter(|s| barrier_blocks.contains(*s))
                    .map(|s| Exit::Barrier(s.to_string()))
                    .collect();
                if matches!(b.term, Terminator::Ret(_)) {
                    found.push(Exit::Return);
                }
                for e in found {
                    if !exits.contains(&e) {
                        exits.push(e);
                    }
                }
                trivial &= b.insts.iter().all(|i| matches!(i.op, Op::Alloca { .. }))
                    && b.term
                        .operands()
                        .iter()
                        .all(|v| v.as_local().map_or(true, |n| params.contains(n)));
            }
            Region {
                entry,
                blocks,
                trivial,
                exits,
            }
        })
        .collect()
}

/// Uses in `region` whose definition is outside it or does not dominate
/// them within the region's own control flow.
fn slot_uses(f: &Function, region: &Region, skip: &HashSet<String>) -> SlotUses {
    let sub = Function {
        blocks: region
            .blocks
            .iter()
            .filter_map(|l| f.block(l).cloned())
            .collect(),
        ..Function::declaration(f.name.clone(), f.ret, Vec::new())
    };
    let dom = Cfg::new(&sub).dominators();
    let mut defs: HashMap<&str, (usize, usize)> = HashMap::new();
    for (bi, b) in sub.blocks.iter().enumerate() {
        for (ii, inst) in b.insts.iter().enumerate() {
            if let Some(r) = &inst.result {
                defs.insert(r, (bi, ii));
            }
        }
    }
    let mut out = SlotUses::new();
    for (bi, b) in sub.blocks.iter().enumerate() {
        let uses = b
            .insts
            .iter()
            .enumerate()
            .flat_map(|(ii, i)| i.operands().into_iter().map(move |v| (ii, v)))
            .chain(b.term.operands().into_iter().map(|v| (TERMINATOR, v)));
        for (ii, v) in uses {
            let Some(name) = v.as_local() else { continue };
            if skip.contains(name) {
                continue;
            }
            let visible = defs.get(name).is_some_and(|&(db, di)| {
                if db == bi {
                    di < ii
                } else {
                    dom.dominates(db, bi)
                }
            });
            if !visible {
                out.insert((b.label.clone(), ii, name.to_string()));
            }
        }
    }
    out
}

/// Per-clone renaming state.
struct RegionCopy {
    tag: String,
    labels: HashMap<String, String>,
    values: HashMap<String, Value>,
    /// Slot pointer of each context value for the current work-item.
    ctx: HashMap<String, Value>,
    ids: [Value; 3],
    /// Empty for trivial regions, whose exits stay direct.
    exits: HashMap<Exit, String>,
}

struct Formed {
    blocks: Vec<Block>,
    loops: Vec<(String, bool)>,
    regions: usize,
    needed: BTreeSet<&'static str>,
}

struct Former<'a> {
    f: &'a Function,
    uniformity: &'a Uniformity,
    launch: &'a Launch,
    names: NameGen,
    allocas: Vec<(String, Type, u64)>,
    arrays: HashMap<String, String>,
    saved: BTreeMap<String, Type>,
    slots: HashMap<String, String>,
    slot_uses: Vec<SlotUses>,
    local_size: [Value; 3],
    exit_sel: Option<String>,
    exit_label: Option<String>,
    needed: BTreeSet<&'static str>,
}

impl<'a> Former<'a> {
    fn new(f: &'a Function, uniformity: &'a Uniformity, launch: &'a Launch) -> Self {
        Self {
            f,
            uniformity,
            launch,
            names: NameGen::for_function(f),
            allocas: Vec::new(),
            arrays: HashMap::new(),
            saved: BTreeMap::new(),
            slots: HashMap::new(),
            slot_uses: Vec::new(),
            local_size: [Value::i64(1), Value::i64(1), Value::i64(1)],
            exit_sel: None,
            exit_label: None,
            needed: BTreeSet::new(),
        }
    }

    fn form(mut self, shape: Shape, access: &WorkItemAccess) -> Option<Formed> {
        let f = self.f;
        if f.insts().any(Inst::is_phi) {
            log::warn!("@{}: phis left before region formation", f.name);
            return None;
        }
        let barrier_blocks: HashSet<String> = f
            .blocks
            .iter()
            .filter(|b| block_has_barrier(b))
            .map(|b| b.label.clone())
            .collect();
        let isolated = f.blocks.iter().enumerate().all(|(bi, b)| {
            !barrier_blocks.contains(&b.label)
                || (bi != 0 && b.insts.len() == 1 && matches!(b.term, Terminator::Br(_)))
        });
        if !isolated {
            log::warn!("@{}: barriers are not isolated, skipping", f.name);
            return None;
        }

        let regions = find_regions(f, &barrier_blocks);
        self.allocas = f
            .insts()
            .filter_map(|i| match (&i.op, &i.result) {
                (Op::Alloca { ty, count }, Some(r)) => Some((r.clone(), *ty, *count)),
                _ => None,
            })
            .collect();
        let mut skip: HashSet<String> = f.params.iter().map(|p| p.name.clone()).collect();
        skip.extend(self.allocas.iter().map(|(a, _, _)| a.clone()));
        for region in &regions {
            let uses = slot_uses(f, region, &skip);
            for (block, ii, name) in &uses {
                if self.saved.contains_key(name) {
                    continue;
                }
                let ty = f
                    .block(block)
                    .and_then(|b| {
                        let ops = if *ii == TERMINATOR {
                            b.term.operands()
                        } else {
                            b.insts[*ii].operands()
                        };
                        ops.into_iter().find(|v| v.as_local() == Some(name.as_str())).map(|v| v.ty)
                    })
                    .unwrap_or(Type::I64);
                self.saved.insert(name.clone(), ty);
            }
            self.slot_uses.push(uses);
        }

        let pre: Vec<String> = (0..regions.len())
            .map(|k| self.names.fresh(&format!("r{}.pre", k)))
            .collect();
        let pre_of: HashMap<&str, &str> = regions
            .iter()
            .zip(&pre)
            .map(|(r, p)| (r.entry.as_str(), p.as_str()))
            .collect();

        let entry = self.entry_block(&regions, &pre[0])?;
        let mut blocks = vec![entry];
        let mut loops = Vec::new();
        for (k, region) in regions.iter().enumerate() {
            if region.trivial {
                blocks.extend(self.trivial_region(k, region, &pre[k]));
                continue;
            }
            let (body, header) = match shape {
                Shape::Nest => self.nest_region(k, region, &pre[k]),
                Shape::Flat => self.flat_region(k, region, &pre[k]),
                Shape::Replicate => (self.replicated_region(k, region, &pre[k]), None),
            };
            blocks.extend(body);
            if let Some(h) = header {
                let parallel = access.stores_are_disjoint(region.blocks.iter().filter_map(|l| f.block(l)));
                loops.push((h, parallel));
            }
        }
        for b in f.blocks.iter().filter(|b| barrier_blocks.contains(&b.label)) {
            let mut b = b.clone();
            for s in b.term.successors().into_iter().map(String::from).collect::<Vec<_>>() {
                if let Some(p) = pre_of.get(s.as_str()) {
                    b.term.replace_successor(&s, p);
                }
            }
            blocks.push(b);
        }
        if let Some(exit) = self.exit_label.take() {
            blocks.push(Block::new(exit, Terminator::Ret(None)));
        }
        Some(Formed {
            blocks,
            loops,
            regions: regions.len(),
            needed: self.needed,
        })
    }

    /// Work-item arrays, context slots and the local size, ahead of region 0.
    /// `None` when a work-item array would not fit in a `u64` count.
    fn entry_block(&mut self, regions: &[Region], first: &str) -> Option<Block> {
        let label = self.names.fresh("wi.entry");
        let mut b = Block::new(label, Terminator::Br(first.to_string()));
        let capacity = self.launch.capacity;
        for (a, ty, count) in self.allocas.clone() {
            let Some(total) = count.checked_mul(capacity) else {
                log::warn!(
                    "@{}: %{} needs {} x {} elements, skipping",
                    self.f.name,
                    a,
                    count,
                    capacity
                );
                return None;
            };
            let array = self.names.fresh(&format!("{}.wi", a));
            b.insts.push(Inst::new(array.clone(), Op::Alloca { ty, count: total }));
            self.arrays.insert(a, array);
        }
        for (v, ty) in self.saved.clone() {
            let slot = self.names.fresh(&format!("{}.ctx", v));
            let count = if self.uniformity.is_uniform_name(&v) { 1 } else { capacity };
            b.insts.push(Inst::new(slot.clone(), Op::Alloca { ty, count }));
            self.slots.insert(v, slot);
        }
        if regions.iter().any(|r| !r.trivial && r.exits.len() > 1) {
            let sel = self.names.fresh("_exit_sel");
            b.insts.push(Inst::new(
                sel.clone(),
                Op::Alloca {
                    ty: Type::I32,
                    count: 1,
                },
            ));
            self.exit_sel = Some(sel);
        }
        match self.launch.static_size {
            Some(size) => {
                for (d, s) in size.iter().enumerate() {
                    self.local_size[d] = Value::i64((*s).max(1) as i64);
                }
            }
            None => {
                for (d, dim) in DIMS.iter().enumerate() {
                    let name = self.names.fresh(&format!("_local_size_{}", dim));
                    b.insts.push(Inst::call(
                        Some(name.clone()),
                        Type::I64,
                        builtins::GET_LOCAL_SIZE,
                        vec![Value::i32(d as i64)],
                    ));
                    self.local_size[d] = Value::local(Type::I64, name);
                }
                self.needed.insert(builtins::GET_LOCAL_SIZE);
            }
        }
        Some(b)
    }

    fn local(&mut self, base: &str, op: Op, out: &mut Vec<Inst>) -> Value {
        let name = self.names.fresh(base);
        let inst = Inst::new(name.clone(), op);
        let ty = inst.result_type();
        out.push(inst);
        Value::local(ty, name)
    }

    fn binary(&mut self, base: &str, op: BinOp, lhs: Value, rhs: Value, out: &mut Vec<Inst>) -> Value {
        self.local(base, Op::Binary { op, lhs, rhs }, out)
    }

    /// Start a clone of `region`: name its blocks and values, and emit the
    /// per-work-item pointers it needs into `head`.
    fn begin_copy(&mut self, region: &Region, tag: String, ids: [Value; 3], lin: &Value, head: &mut Vec<Inst>) -> RegionCopy {
        let f = self.f;
        let members: Vec<&Block> = region.blocks.iter().filter_map(|l| f.block(l)).collect();
        let mut used: BTreeSet<String> = BTreeSet::new();
        let mut defined: BTreeSet<String> = BTreeSet::new();
        for b in &members {
            for inst in &b.insts {
                used.extend(inst.operands().iter().filter_map(|v| v.as_local()).map(String::from));
                defined.extend(inst.result.clone());
            }
            used.extend(b.term.operands().iter().filter_map(|v| v.as_local()).map(String::from));
        }

        let mut cp = RegionCopy {
            labels: HashMap::new(),
            values: HashMap::new(),
            ctx: HashMap::new(),
            ids,
            exits: HashMap::new(),
            tag,
        };
        for b in &members {
            let label = self.names.fresh(&format!("{}.{}", b.label, cp.tag));
            cp.labels.insert(b.label.clone(), label);
            for inst in b.insts.iter().filter(|i| !matches!(i.op, Op::Alloca { .. })) {
                if let Some(r) = &inst.result {
                    let name = self.names.fresh(&format!("{}.{}", r, cp.tag));
                    cp.values.insert(r.clone(), Value::local(inst.result_type(), name));
                }
            }
        }

        let private = Type::Ptr(addrspace::PRIVATE);
        for (a, ty, count) in self.allocas.clone() {
            if !used.contains(&a) {
                continue;
            }
            let Some(array) = self.arrays.get(&a).cloned() else { continue };
            let index = if count == 1 {
                lin.clone()
            } else {
                self.binary(
                    &format!("{}.off.{}", a, cp.tag),
                    BinOp::Mul,
                    lin.clone(),
                    Value::i64(count as i64),
                    head,
                )
            };
            let ptr = self.local(
                &format!("{}.{}", a, cp.tag),
                Op::Gep {
                    elem: ty,
                    base: Value::local(private, array),
                    index,
                },
                head,
            );
            cp.values.insert(a, ptr);
        }

        for (v, ty) in self.saved.clone() {
            if !used.contains(&v) && !defined.contains(&v) {
                continue;
            }
            let Some(slot) = self.slots.get(&v).cloned() else { continue };
            let base = Value::local(private, slot);
            let ptr = if self.uniformity.is_uniform_name(&v) {
                base
            } else {
                self.local(
                    &format!("{}.ctx.{}", v, cp.tag),
                    Op::Gep {
                        elem: ty,
                        base,
                        index: lin.clone(),
                    },
                    head,
                )
            };
            cp.ctx.insert(v, ptr);
        }
        cp
    }

    fn map_operand(&mut self, k: usize, at: (&str, usize), v: &mut Value, cp: &RegionCopy, out: &mut Vec<Inst>) {
        let Some(name) = v.as_local().map(String::from) else {
            return;
        };
        let key = (at.0.to_string(), at.1, name.clone());
        if self.slot_uses[k].contains(&key) {
            if let Some(ptr) = cp.ctx.get(&name).cloned() {
                let ty = v.ty;
                *v = self.local(&format!("{}.ld", name), Op::Load { ty, ptr }, out);
                return;
            }
        }
        if let Some(mapped) = cp.values.get(&name) {
            *v = mapped.clone();
        }
    }

    /// Local id of the current work-item in dimension `dim`.
    fn local_id(&mut self, dim: &Value, cp: &RegionCopy, out: &mut Vec<Inst>) -> Value {
        match dim.as_int() {
            Some(d @ 0..=2) => cp.ids[d as usize].clone(),
            Some(_) => Value::i64(0),
            None => {
                let is_x = self.local(
                    &format!("is_x.{}", cp.tag),
                    Op::Cmp {
                        pred: CmpPred::Eq,
                        lhs: dim.clone(),
                        rhs: Value::int(dim.ty, 0),
                    },
                    out,
                );
                let is_y = self.local(
                    &format!("is_y.{}", cp.tag),
                    Op::Cmp {
                        pred: CmpPred::Eq,
                        lhs: dim.clone(),
                        rhs: Value::int(dim.ty, 1),
                    },
                    out,
                );
                let yz = self.local(
                    &format!("lid.yz.{}", cp.tag),
                    Op::Select {
                        cond: is_y,
                        then_value: cp.ids[1].clone(),
                        else_value: cp.ids[2].clone(),
                    },
                    out,
                );
                self.local(
                    &format!("lid.{}", cp.tag),
                    Op::Select {
                        cond: is_x,
                        then_value: cp.ids[0].clone(),
                        else_value: yz,
                    },
                    out,
                )
            }
        }
    }

    /// `group_id * local_size + local_id`, plus the global offset unless
    /// the launch is known to have none.
    fn global_id(&mut self, dim: &Value, cp: &RegionCopy, out: &mut Vec<Inst>) -> Value {
        let tag = cp.tag.clone();
        let group = self.local(
            &format!("group_id.{}", tag),
            Op::Call {
                ret: Type::I64,
                callee: builtins::GET_GROUP_ID.to_string(),
                args: vec![dim.clone()],
            },
            out,
        );
        self.needed.insert(builtins::GET_GROUP_ID);
        let size = match dim.as_int() {
            Some(d @ 0..=2) => self.local_size[d as usize].clone(),
            _ => {
                self.needed.insert(builtins::GET_LOCAL_SIZE);
                self.local(
                    &format!("local_size.{}", tag),
                    Op::Call {
                        ret: Type::I64,
                        callee: builtins::GET_LOCAL_SIZE.to_string(),
                        args: vec![dim.clone()],
                    },
                    out,
                )
            }
        };
        let base = self.binary(&format!("group_base.{}", tag), BinOp::Mul, group, size, out);
        let lid = self.local_id(dim, cp, out);
        let gid = self.binary(&format!("gid.{}", tag), BinOp::Add, base, lid, out);
        if self.launch.zero_offset {
            return gid;
        }
        self.needed.insert(builtins::GET_GLOBAL_OFFSET);
        let offset = self.local(
            &format!("global_offset.{}", tag),
            Op::Call {
                ret: Type::I64,
                callee: builtins::GET_GLOBAL_OFFSET.to_string(),
                args: vec![dim.clone()],
            },
            out,
        );
        self.binary(&format!("gid.off.{}", tag), BinOp::Add, gid, offset, out)
    }

    /// Clone the blocks of region `k` under `cp`.
    fn clone_blocks(&mut self, k: usize, region: &Region, cp: &RegionCopy) -> Vec<Block> {
        let f = self.f;
        let mut out_blocks = Vec::with_capacity(region.blocks.len());
        for b in region.blocks.iter().filter_map(|l| f.block(l)) {
            let mut insts = Vec::with_capacity(b.insts.len());
            for (ii, inst) in b.insts.iter().enumerate() {
                if matches!(inst.op, Op::Alloca { .. }) {
                    continue;
                }
                let mut inst = inst.clone();
                for v in inst.operands_mut() {
                    self.map_operand(k, (b.label.as_str(), ii), v, cp, &mut insts);
                }
                if let Op::Phi { incoming, .. } = &mut inst.op {
                    for (_, pred) in incoming.iter_mut() {
                        if let Some(l) = cp.labels.get(pred.as_str()) {
                            *pred = l.clone();
                        }
                    }
                }
                let original = inst.result.clone();
                let renamed = original
                    .as_ref()
                    .and_then(|r| cp.values.get(r))
                    .and_then(|v| v.as_local())
                    .map(String::from);
                let rewritten = match &inst.op {
                    Op::Call { callee, args, ret } if renamed.is_some() && !args.is_empty() => {
                        let (callee, dim, ret) = (callee.clone(), args[0].clone(), *ret);
                        match callee.as_str() {
                            builtins::GET_LOCAL_ID => Some((self.local_id(&dim, cp, &mut insts), ret)),
                            builtins::GET_GLOBAL_ID => Some((self.global_id(&dim, cp, &mut insts), ret)),
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let (Some((value, ret)), Some(name)) = (rewritten, renamed.clone()) {
                    inst = if ret == Type::I64 {
                        Inst::new(
                            name,
                            Op::Binary {
                                op: BinOp::Add,
                                lhs: value,
                                rhs: Value::i64(0),
                            },
                        )
                    } else {
                        Inst::new(
                            name,
                            Op::Cast {
                                kind: CastKind::Trunc,
                                value,
                                to: ret,
                            },
                        )
                    };
                } else {
                    inst.result = renamed.clone();
                }
                let ty = inst.result_type();
                insts.push(inst);
                if let (Some(r), Some(name)) = (original, renamed) {
                    if let Some(ptr) = cp.ctx.get(&r) {
                        insts.push(Inst::void(Op::Store {
                            value: Value::local(ty, name),
                            ptr: ptr.clone(),
                        }));
                    }
                }
            }

            let mut term = b.term.clone();
            for v in term.operands_mut() {
                self.map_operand(k, (b.label.as_str(), TERMINATOR), v, cp, &mut insts);
            }
            for s in b.term.successors() {
                if let Some(l) = cp.labels.get(s) {
                    term.replace_successor(s, l);
                } else if let Some(stub) = cp.exits.get(&Exit::Barrier(s.to_string())) {
                    term.replace_successor(s, stub);
                }
            }
            if matches!(term, Terminator::Ret(_)) {
                if let Some(stub) = cp.exits.get(&Exit::Return) {
                    term = Terminator::Br(stub.clone());
                }
            }
            out_blocks.push(Block {
                label: cp.labels.get(&b.label).cloned().unwrap_or_else(|| b.label.clone()),
                insts,
                term,
            });
        }
        out_blocks
    }

    /// One block per region exit, recording which exit was taken.
    fn exit_stubs(&mut self, region: &Region, cp: &mut RegionCopy, cont: &str) -> Vec<Block> {
        let mut stubs = Vec::with_capacity(region.exits.len());
        for (j, exit) in region.exits.iter().enumerate() {
            let label = self.names.fresh(&format!("{}.exit{}", cp.tag, j));
            let mut b = Block::new(label.clone(), Terminator::Br(cont.to_string()));
            if region.exits.len() > 1 {
                if let Some(sel) = &self.exit_sel {
                    b.insts.push(Inst::void(Op::Store {
                        value: Value::i32(j as i64),
                        ptr: Value::local(Type::Ptr(addrspace::PRIVATE), sel.clone()),
                    }));
                }
            }
            cp.exits.insert(exit.clone(), label);
            stubs.push(b);
        }
        stubs
    }

    fn exit_target(&mut self, exit: &Exit) -> String {
        match exit {
            Exit::Barrier(b) => b.clone(),
            Exit::Return => {
                if self.exit_label.is_none() {
                    self.exit_label = Some(self.names.fresh("wi.exit"));
                }
                self.exit_label.clone().unwrap_or_default()
            }
        }
    }

    /// Blocks after the work-item loop that continue at the exit the
    /// work-items took.
    fn dispatch(&mut self, region: &Region, tag: &str) -> (String, Vec<Block>) {
        let first = self.names.fresh(&format!("{}.dispatch", tag));
        let targets: Vec<String> = region.exits.iter().map(|e| self.exit_target(e)).collect();
        match targets.as_slice() {
            [] => (first.clone(), vec![Block::new(first, Terminator::Unreachable)]),
            [only] => (first.clone(), vec![Block::new(first, Terminator::Br(only.clone()))]),
            _ => {
                let mut blocks = Vec::new();
                let mut label = first.clone();
                let mut insts = Vec::new();
                let slot = Value::local(
                    Type::Ptr(addrspace::PRIVATE),
                    self.exit_sel.clone().unwrap_or_default(),
                );
                let sel = self.local(
                    &format!("{}.sel", tag),
                    Op::Load {
                        ty: Type::I32,
                        ptr: slot,
                    },
                    &mut insts,
                );
                let n = targets.len();
                for (j, target) in targets.iter().enumerate().take(n - 1) {
                    let taken = self.local(
                        &format!("{}.took{}", tag, j),
                        Op::Cmp {
                            pred: CmpPred::Eq,
                            lhs: sel.clone(),
                            rhs: Value::i32(j as i64),
                        },
                        &mut insts,
                    );
                    let next = if j + 2 == n {
                        targets[n - 1].clone()
                    } else {
                        self.names.fresh(&format!("{}.dispatch", tag))
                    };
                    blocks.push(Block {
                        label: std::mem::replace(&mut label, next.clone()),
                        insts: std::mem::take(&mut insts),
                        term: Terminator::CondBr {
                            cond: taken,
                            then_bb: target.clone(),
                            else_bb: next,
                        },
                    });
                }
                (first, blocks)
            }
        }
    }

    /// `iv + 1 < bound ? back : out`.
    fn latch(&mut self, label: String, iv: &Value, next: &str, bound: &Value, back: &str, out: &str) -> Block {
        let mut b = Block::new(label, Terminator::Unreachable);
        b.insts.push(Inst::new(
            next,
            Op::Binary {
                op: BinOp::Add,
                lhs: iv.clone(),
                rhs: Value::i64(1),
            },
        ));
        let more = self.local(
            &format!("{}.more", next),
            Op::Cmp {
                pred: CmpPred::Ult,
                lhs: Value::local(Type::I64, next),
                rhs: bound.clone(),
            },
            &mut b.insts,
        );
        b.term = Terminator::CondBr {
            cond: more,
            then_bb: back.to_string(),
            else_bb: out.to_string(),
        };
        b
    }

    /// `name = phi [0, from], [next, latch]`.
    fn counter(name: &str, next: &str, from: &str, latch: &str) -> Inst {
        Inst::new(
            name,
            Op::Phi {
                ty: Type::I64,
                incoming: vec![
                    (Value::i64(0), from.to_string()),
                    (Value::local(Type::I64, next), latch.to_string()),
                ],
            },
        )
    }

    fn trivial_region(&mut self, k: usize, region: &Region, pre: &str) -> Vec<Block> {
        let zero = Value::i64(0);
        let mut head = Vec::new();
        let cp = self.begin_copy(region, format!("r{}", k), [zero.clone(), zero.clone(), zero.clone()], &zero, &mut head);
        let body = self.clone_blocks(k, region, &cp);
        let entry = cp.labels.get(&region.entry).cloned().unwrap_or_default();
        let mut pre_block = Block::new(pre, Terminator::Br(entry));
        pre_block.insts = head;
        let mut blocks = vec![pre_block];
        blocks.extend(body);
        blocks
    }

    /// Nested z, y and x loops around the region.
    fn nest_region(&mut self, k: usize, region: &Region, pre: &str) -> (Vec<Block>, Option<String>) {
        let tag = format!("r{}", k);
        let [lx, ly, lz] = self.local_size.clone();
        let mut fresh = |s: &str| self.names.fresh(&format!("{}.{}", tag, s));
        let (z_h, y_h, x_h) = (fresh("z"), fresh("y"), fresh("x"));
        let (x_l, y_l, z_l) = (fresh("x.latch"), fresh("y.latch"), fresh("z.latch"));
        let ids: Vec<String> = DIMS
            .iter()
            .map(|d| self.names.fresh(&format!("{}.lid.{}", tag, d)))
            .collect();
        let nexts: Vec<String> = DIMS
            .iter()
            .map(|d| self.names.fresh(&format!("{}.lid.{}.next", tag, d)))
            .collect();
        let id = |i: usize| Value::local(Type::I64, ids[i].clone());

        let mut head = vec![Self::counter(&ids[0], &nexts[0], &y_h, &x_l)];
        let zy = self.binary(&format!("{}.zy", tag), BinOp::Mul, id(2), ly.clone(), &mut head);
        let row = self.binary(&format!("{}.row", tag), BinOp::Add, zy, id(1), &mut head);
        let base = self.binary(&format!("{}.base", tag), BinOp::Mul, row, lx.clone(), &mut head);
        let lin = self.binary(&format!("{}.lin", tag), BinOp::Add, base, id(0), &mut head);
        let mut cp = self.begin_copy(region, tag.clone(), [id(0), id(1), id(2)], &lin, &mut head);
        let stubs = self.exit_stubs(region, &mut cp, &x_l);
        let body = self.clone_blocks(k, region, &cp);
        let (dispatch, dispatch_blocks) = self.dispatch(region, &tag);
        let entry = cp.labels.get(&region.entry).cloned().unwrap_or_default();

        let mut z_block = Block::new(z_h.clone(), Terminator::Br(y_h.clone()));
        z_block.insts.push(Self::counter(&ids[2], &nexts[2], pre, &z_l));
        let mut y_block = Block::new(y_h.clone(), Terminator::Br(x_h.clone()));
        y_block.insts.push(Self::counter(&ids[1], &nexts[1], &z_h, &y_l));
        let mut x_block = Block::new(x_h.clone(), Terminator::Br(entry));
        x_block.insts = head;

        let mut blocks = vec![Block::new(pre, Terminator::Br(z_h.clone())), z_block, y_block, x_block];
        blocks.extend(body);
        blocks.extend(stubs);
        blocks.push(self.latch(x_l, &id(0), &nexts[0], &lx, &x_h, &y_l));
        blocks.push(self.latch(y_l, &id(1), &nexts[1], &ly, &y_h, &z_l));
        blocks.push(self.latch(z_l, &id(2), &nexts[2], &lz, &z_h, &dispatch));
        blocks.extend(dispatch_blocks);
        (blocks, Some(x_h))
    }

    /// One loop over the linear id; the 3D ids are derived from it.
    fn flat_region(&mut self, k: usize, region: &Region, pre: &str) -> (Vec<Block>, Option<String>) {
        let tag = format!("r{}", k);
        let [lx, ly, lz] = self.local_size.clone();
        let header = self.names.fresh(&format!("{}.lin", tag));
        let latch = self.names.fresh(&format!("{}.latch", tag));
        let lin_name = self.names.fresh(&format!("{}.lid", tag));
        let next = self.names.fresh(&format!("{}.lid.next", tag));

        let mut pre_block = Block::new(pre, Terminator::Br(header.clone()));
        let plane = self.binary(&format!("{}.plane", tag), BinOp::Mul, lx.clone(), ly.clone(), &mut pre_block.insts);
        let total = self.binary(&format!("{}.items", tag), BinOp::Mul, plane, lz, &mut pre_block.insts);

        let lin = Value::local(Type::I64, lin_name.clone());
        let mut head = vec![Self::counter(&lin_name, &next, pre, &latch)];
        let x = self.binary(&format!("{}.lid.x", tag), BinOp::URem, lin.clone(), lx.clone(), &mut head);
        let rows = self.binary(&format!("{}.rows", tag), BinOp::UDiv, lin.clone(), lx, &mut head);
        let y = self.binary(&format!("{}.lid.y", tag), BinOp::URem, rows.clone(), ly.clone(), &mut head);
        let z = self.binary(&format!("{}.lid.z", tag), BinOp::UDiv, rows, ly, &mut head);
        let mut cp = self.begin_copy(region, tag.clone(), [x, y, z], &lin, &mut head);
        let stubs = self.exit_stubs(region, &mut cp, &latch);
        let body = self.clone_blocks(k, region, &cp);
        let (dispatch, dispatch_blocks) = self.dispatch(region, &tag);
        let entry = cp.labels.get(&region.entry).cloned().unwrap_or_default();

        let mut h_block = Block::new(header.clone(), Terminator::Br(entry));
        h_block.insts = head;
        let mut blocks = vec![pre_block, h_block];
        blocks.extend(body);
        blocks.extend(stubs);
        blocks.push(self.latch(latch, &lin, &next, &total, &header, &dispatch));
        blocks.extend(dispatch_blocks);
        (blocks, Some(header))
    }

    /// One copy of the region per work-item, with constant ids.
    fn replicated_region(&mut self, k: usize, region: &Region, pre: &str) -> Vec<Block> {
        let tag = format!("r{}", k);
        let [sx, sy, sz] = self.launch.static_size.unwrap_or([1, 1, 1]).map(|s| s.max(1));
        let items = sx * sy * sz;
        let heads: Vec<String> = (0..items)
            .map(|c| self.names.fresh(&format!("{}.wi{}", tag, c)))
            .collect();
        let (dispatch, dispatch_blocks) = self.dispatch(region, &tag);
        let mut blocks = vec![Block::new(
            pre,
            Terminator::Br(heads.first().cloned().unwrap_or_else(|| dispatch.clone())),
        )];
        for (c, head_label) in heads.iter().enumerate() {
            let c = c as u64;
            let ids = [c % sx, (c / sx) % sy, c / (sx * sy)].map(|v| Value::i64(v as i64));
            let mut head = Vec::new();
            let lin = Value::i64(c as i64);
            let mut cp = self.begin_copy(region, format!("{}.{}", tag, c), ids, &lin, &mut head);
            let cont = heads.get(c as usize + 1).cloned().unwrap_or_else(|| dispatch.clone());
            let stubs = self.exit_stubs(region, &mut cp, &cont);
            let body = self.clone_blocks(k, region, &cp);
            let entry = cp.labels.get(&region.entry).cloned().unwrap_or_default();
            let mut head_block = Block::new(head_label.clone(), Terminator::Br(entry));
            head_block.insts = head;
            blocks.push(head_block);
            blocks.extend(body);
            blocks.extend(stubs);
        }
        blocks.extend(dispatch_blocks);
        blocks
    }
}

/// Form regions in every kernel whose handler is one of `handlers`.
fn form_kernels(
    m: &mut Module,
    cx: &mut PassContext<'_>,
    shape: Shape,
    handlers: &[&str],
    fallback_capacity: u64,
) -> bool {
    let meta = launch_metadata(m);
    let launch = Launch {
        capacity: meta
            .as_ref()
            .map_or(fallback_capacity.max(1), |l| l.work_group_capacity()),
        static_size: meta.as_ref().and_then(|l| l.spec.static_local_size()),
        zero_offset: meta
            .as_ref()
            .is_some_and(|l| l.spec.assume_zero_global_offset),
    };
    let shape = match shape {
        Shape::Replicate if launch.static_size.is_none() => {
            log::debug!("no static local size, replicating as nested loops");
            Shape::Nest
        }
        other => other,
    };

    let mut needed = BTreeSet::new();
    let mut changed = false;
    for f in m
        .functions
        .iter_mut()
        .filter(|f| f.is_kernel() && !f.is_declaration())
    {
        let handler = f.annotations.get(HANDLER_KEY).map_or("loops", String::as_str);
        if !handlers.contains(&handler) || f.annotations.contains_key(REGIONS_KEY) {
            continue;
        }
        let uniformity = cx.analyses.uniformity(f);
        let access = cx.analyses.work_item_access(f);
        let original = f.clone();
        let Some(formed) = Former::new(&original, &uniformity, &launch).form(shape, &access) else {
            continue;
        };
        log::debug!(
            "@{}: {} region(s), {} work-item loop(s)",
            f.name,
            formed.regions,
            formed.loops.len()
        );
        f.blocks = formed.blocks;
        let headers: Vec<&str> = formed.loops.iter().map(|(h, _)| h.as_str()).collect();
        let parallel: Vec<&str> = formed
            .loops
            .iter()
            .filter(|(_, p)| *p)
            .map(|(h, _)| h.as_str())
            .collect();
        if !headers.is_empty() {
            f.annotations.insert(LOOPS_KEY.to_string(), headers.join(","));
        }
        if !parallel.is_empty() {
            f.annotations.insert(PARALLEL_KEY.to_string(), parallel.join(","));
        }
        f.annotations
            .insert(REGIONS_KEY.to_string(), formed.regions.to_string());
        needed.extend(formed.needed);
        changed = true;
    }
    for name in needed {
        m.declare(name, Type::I64, vec![Type::I32]);
    }
    changed
}

/// Nested work-item loops around each region.
pub struct WorkItemLoops {
    fallback_capacity: u64,
}

impl WorkItemLoops {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Self {
            fallback_capacity: device.max_work_group_size,
        }
    }
}

impl Pass for WorkItemLoops {
    fn name(&self) -> &'static str {
        "workitemloops"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        form_kernels(m, cx, Shape::Nest, &["loops"], self.fallback_capacity)
    }
}

/// A single linear work-item loop around each region.
pub struct SubCfgFormation {
    fallback_capacity: u64,
}

impl SubCfgFormation {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Self {
            fallback_capacity: device.max_work_group_size,
        }
    }
}

impl Pass for SubCfgFormation {
    fn name(&self) -> &'static str {
        "subcfgformation"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        form_kernels(m, cx, Shape::Flat, &["cbs"], self.fallback_capacity)
    }
}

/// Unrolled copies of each region for small, statically sized groups.
pub struct WorkItemReplication {
    fallback_capacity: u64,
}

impl WorkItemReplication {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Self {
            fallback_capacity: device.max_work_group_size,
        }
    }
}

impl Pass for WorkItemReplication {
    fn name(&self) -> &'static str {
        "workitemrepl"
    }

    fn run(&self, m: &mut Module, cx: &mut PassContext<'_>) -> bool {
        form_kernels(m, cx, Shape::Replicate, &["repl"], self.fallback_capacity)
    }
}
