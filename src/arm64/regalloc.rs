// This module implements the local register allocator. Blocks are visited once in layout
// order (reverse postorder) and values get registers in program order. When no register is
// free the allocator evicts the occupant whose next use in the block lies furthest ahead;
// values live out of the block count as used just past its end. Every value that ever has
// to leave a register gets exactly one memory home: a StoreReg placed right after its
// definition, or the value itself for constants (rematerialized as immediates), incoming
// stack arguments and phis that did not get a register. A use of a value that is no longer
// in a register reloads it through a LoadReg inserted just before the user, and the use is
// rewritten to that reload, so the rewritten function stays in SSA form with one location
// per value. Calls clobber all allocatable registers, so everything live across a call is
// homed first. A block with a single, already visited predecessor inherits that
// predecessor's register state; any other block starts with its phis in registers (or
// stack slots when registers run out) and every other live-in value in memory. Once all
// blocks are done, phi operands are rewritten to where the value sits at the end of each
// predecessor and the resulting word copies are recorded as per-block edge moves, which
// the code generator sequentializes. check_allocation recomputes liveness on the rewritten
// function and rejects any two simultaneously live values sharing a register.

//! Local register allocation with furthest-next-use eviction.

use hashbrown::HashMap;

use super::calling_convention::{expand_call, Signature};
use crate::core::error::{CompileError, CompileResult};
use crate::core::parallel_move::PartMove;
use crate::core::register_file::{AsmReg, Occupant, RegBitSet, RegisterFile};
use crate::core::types::{TypeRegistry, WORD_SIZE};
use crate::core::value_assignment::{StackSlot, ValueLocation};
use crate::ssa::liveness::Liveness;
use crate::ssa::{Aux, BlockId, BlockKind, Func, Op, ValueId};

/// Result of register allocation besides the per-value locations stored in
/// the function itself.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Block emission order.
    pub layout: Vec<BlockId>,
    /// Phi copies to perform at the end of each block, indexed by block.
    pub edge_moves: Vec<Vec<PartMove>>,
    /// Bytes of spill area.
    pub spill_size: u32,
    pub spill_slots: usize,
    /// `StoreReg` values inserted.
    pub spills: usize,
    /// `LoadReg` values inserted.
    pub reloads: usize,
    /// Constants rematerialized into registers.
    pub remats: usize,
    pub call_sites: usize,
    /// Largest outgoing stack argument area of any call.
    pub outgoing_size: u32,
    pub signature: Signature,
}

impl Allocation {
    pub fn makes_calls(&self) -> bool {
        self.call_sites > 0
    }
}

/// Assign a location to every value of `func`, inserting spill and reload
/// code, using only registers in `allocatable`.
pub fn allocate(func: &mut Func, types: &TypeRegistry, allocatable: RegBitSet) -> CompileResult<Allocation> {
    let signature = Signature::of(func, types)?;
    let live = Liveness::compute(func);
    let layout = func.reverse_postorder();
    let blocks = func.blocks.len();
    let allocator = Allocator {
        types,
        live,
        regs: RegisterFile::new(allocatable),
        homes: HashMap::new(),
        end_state: vec![None; blocks],
        current: None,
        out: Vec::new(),
        next_uses: HashMap::new(),
        pos: 0,
        block_len: 0,
        spill_size: 0,
        spill_slots: 0,
        spills: 0,
        reloads: 0,
        remats: 0,
        call_sites: 0,
        outgoing_size: 0,
        signature,
        func,
    };
    allocator.run(layout)
}

struct Allocator<'a> {
    func: &'a mut Func,
    types: &'a TypeRegistry,
    /// Liveness of the function as it was before allocation.
    live: Liveness,
    regs: RegisterFile,
    /// Memory copy of each value that has one.
    homes: HashMap<ValueId, ValueId>,
    /// Register contents at the end of each visited block.
    end_state: Vec<Option<Vec<(AsmReg, Occupant)>>>,

    /// Block being allocated; its value list is rebuilt in `out`.
    current: Option<BlockId>,
    out: Vec<ValueId>,
    /// Positions of the uses of each value in the block being allocated.
    next_uses: HashMap<ValueId, Vec<u32>>,
    pos: u32,
    block_len: u32,

    spill_size: u32,
    spill_slots: usize,
    spills: usize,
    reloads: usize,
    remats: usize,
    call_sites: usize,
    outgoing_size: u32,
    signature: Signature,
}

impl<'a> Allocator<'a> {
    fn run(mut self, layout: Vec<BlockId>) -> CompileResult<Allocation> {
        for &b in &layout {
            self.allocate_block(b)?;
        }
        self.current = None;
        let edge_moves = self.resolve_edges(&layout)?;
        self.func.recount_uses();

        log::debug!(
            "{}: allocated {} blocks, {} spills, {} reloads, {} remats, spill area {} bytes",
            self.func.name,
            layout.len(),
            self.spills,
            self.reloads,
            self.remats,
            self.spill_size
        );
        Ok(Allocation {
            layout,
            edge_moves,
            spill_size: self.spill_size,
            spill_slots: self.spill_slots,
            spills: self.spills,
            reloads: self.reloads,
            remats: self.remats,
            call_sites: self.call_sites,
            outgoing_size: self.outgoing_size,
            signature: self.signature,
        })
    }

    fn int_aux(&self, v: ValueId) -> CompileResult<i64> {
        self.func
            .value(v)
            .aux
            .int()
            .ok_or_else(|| self.error(format!("{v} has no integer payload")))
    }

    fn error(&self, reason: impl Into<String>) -> CompileError {
        CompileError::RegisterAllocation {
            func: self.func.name.clone(),
            reason: reason.into(),
        }
    }

    fn parts(&self, v: ValueId) -> CompileResult<u32> {
        let ty = self.func.value(v).ty;
        match self.types.parts(ty) {
            0 => Err(CompileError::UnsupportedType {
                func: self.func.name.clone(),
                reason: format!("{v} of type {} cannot be held in registers", self.types.name(ty)),
            }),
            n => Ok(n),
        }
    }

    // ---- liveness queries within the current block ---------------------------

    fn next_use(&self, v: ValueId, from: u32) -> Option<u32> {
        let uses = self.next_uses.get(&v)?;
        let i = uses.partition_point(|&p| p < from);
        uses.get(i).copied()
    }

    fn is_live_from(&self, v: ValueId, from: u32) -> bool {
        self.next_use(v, from).is_some() || self.current.is_some_and(|b| self.live.live_out(b).contains(v))
    }

    fn live_after_current(&self, v: ValueId) -> bool {
        self.is_live_from(v, self.pos + 1)
    }

    /// Eviction priority: higher means needed later.
    fn distance(&self, v: ValueId) -> u32 {
        match self.next_use(v, self.pos + 1) {
            Some(p) => p,
            None if self.is_live_from(v, self.pos + 1) => self.block_len + 1,
            None => u32::MAX,
        }
    }

    // ---- block traversal -----------------------------------------------------

    fn allocate_block(&mut self, b: BlockId) -> CompileResult<()> {
        self.current = Some(b);
        let old = std::mem::take(&mut self.func.block_mut(b).values);
        self.block_len = old.len() as u32;
        self.out = Vec::with_capacity(old.len() + 4);
        self.compute_next_uses(b, &old);

        self.enter_block(b, &old)?;
        for (i, &v) in old.iter().enumerate() {
            self.pos = i as u32;
            match self.func.value(v).op {
                Op::Phi | Op::Arg | Op::ResultPtr | Op::InitMem => self.out.push(v),
                Op::Const => {
                    let k = self.int_aux(v)?;
                    self.func.value_mut(v).loc = Some(ValueLocation::Imm(k));
                    self.out.push(v);
                }
                Op::Call => self.allocate_call(v)?,
                _ => self.allocate_value(v)?,
            }
        }
        self.pos = self.block_len;
        self.allocate_control(b)?;

        self.func.block_mut(b).values = std::mem::take(&mut self.out);
        self.end_state[b.index()] = Some(self.regs.occupied());
        Ok(())
    }

    fn compute_next_uses(&mut self, b: BlockId, values: &[ValueId]) {
        self.next_uses.clear();
        for (i, &v) in values.iter().enumerate() {
            if self.func.value(v).op == Op::Phi {
                continue;
            }
            for &a in self.func.data_args(v) {
                self.next_uses.entry(a).or_default().push(i as u32);
            }
        }
        let end = values.len() as u32;
        let block = self.func.block(b);
        match (block.kind, block.control) {
            (BlockKind::If, Some(c)) => self.next_uses.entry(c).or_default().push(end),
            (BlockKind::Ret, Some(ret)) => {
                for &a in self.func.data_args(ret) {
                    self.next_uses.entry(a).or_default().push(end);
                }
            }
            _ => {}
        }
    }

    /// Set up the register state at the top of `b`.
    fn enter_block(&mut self, b: BlockId, values: &[ValueId]) -> CompileResult<()> {
        self.regs.clear();
        if b == self.func.entry {
            return self.enter_function(values);
        }

        let preds = self.func.block(b).preds.clone();
        if let &[pred] = preds.as_slice() {
            if let Some(state) = self.end_state[pred.index()].clone() {
                for (reg, occupant) in state {
                    if self.live.live_in(b).contains(occupant.value) {
                        let dirty = !self.homes.contains_key(&occupant.value);
                        self.regs.assign(reg, occupant, dirty);
                    }
                }
                return Ok(());
            }
        }

        for &v in values {
            let value = self.func.value(v);
            if value.op != Op::Phi || !value.has_result() {
                continue;
            }
            let parts = self.parts(v)?;
            let mut chosen = Vec::with_capacity(parts as usize);
            let mut taken = RegBitSet::new();
            for _ in 0..parts {
                if let Some(r) = self.regs.find_free(taken) {
                    taken.set(r);
                    chosen.push(r);
                }
            }
            if chosen.len() == parts as usize {
                for (part, &r) in chosen.iter().enumerate() {
                    self.regs.assign(r, Occupant { value: v, alias: v, part: part as u8 }, true);
                }
                self.func.value_mut(v).loc = ValueLocation::from_regs(&chosen);
            } else {
                let slot = self.new_slot(parts);
                self.func.value_mut(v).loc = Some(ValueLocation::Stack(slot));
                self.homes.insert(v, v);
                log::trace!("{}: phi {v} lives in {slot}", self.func.name);
            }
        }
        // Phis are written on every incoming edge even when unused here.
        for &v in values {
            if self.func.value(v).op == Op::Phi && !self.is_live_from(v, 0) {
                self.release(v);
            }
        }

        let live_in: Vec<ValueId> = self.live.live_in(b).iter().collect();
        for v in live_in {
            self.ensure_home(v)?;
        }
        Ok(())
    }

    fn enter_function(&mut self, values: &[ValueId]) -> CompileResult<()> {
        for &v in values {
            let value = self.func.value(v);
            let loc = match value.op {
                Op::Arg => {
                    let index = self.int_aux(v)? as usize;
                    match self.signature.param_location(index) {
                        Some(loc) => loc,
                        None => return Err(self.error(format!("no location for parameter {index}"))),
                    }
                }
                Op::ResultPtr => ValueLocation::Reg(AsmReg::X8),
                _ => continue,
            };
            self.func.value_mut(v).loc = Some(loc);
            if loc.is_reg() {
                for (part, r) in loc.regs().into_iter().enumerate() {
                    self.regs.assign(r, Occupant { value: v, alias: v, part: part as u8 }, true);
                }
                if !self.is_live_from(v, 0) {
                    self.release(v);
                }
            } else {
                self.homes.insert(v, v);
            }
        }
        Ok(())
    }

    // ---- homes, reloads, eviction ----------------------------------------------

    fn new_slot(&mut self, words: u32) -> StackSlot {
        let slot = StackSlot::Spill(self.spill_size);
        self.spill_size += words * WORD_SIZE;
        self.spill_slots += 1;
        slot
    }

    /// Memory copy of `v`, creating the spill store on first request.
    fn ensure_home(&mut self, v: ValueId) -> CompileResult<ValueId> {
        if let Some(&home) = self.homes.get(&v) {
            return Ok(home);
        }
        let value = self.func.value(v);
        let (block, ty) = (value.block, value.ty);
        match value.loc {
            Some(ValueLocation::Stack(_)) | Some(ValueLocation::Imm(_)) => {
                self.homes.insert(v, v);
                return Ok(v);
            }
            Some(_) => {}
            None => return Err(self.error(format!("{v} has no location to spill from"))),
        }

        let slot = self.new_slot(self.parts(v)?);
        let store = self.func.new_value(block, Op::StoreReg, ty, &[v], Aux::None);
        self.func.value_mut(store).loc = Some(ValueLocation::Stack(slot));
        self.insert_after_def(v, store);
        self.homes.insert(v, store);
        self.regs.mark_clean(v);
        self.spills += 1;
        log::trace!("{}: {v} spilled to {slot}", self.func.name);
        Ok(store)
    }

    fn insert_after_def(&mut self, def: ValueId, new: ValueId) {
        let block = self.func.value(def).block;
        let in_current = self.current == Some(block);
        let prefix_def = self.func.value(def).op.is_block_prefix();
        let index = {
            let list = if in_current {
                &self.out
            } else {
                &self.func.block(block).values
            };
            if prefix_def {
                list.iter()
                    .position(|&v| !self.func.value(v).op.is_block_prefix())
                    .unwrap_or(list.len())
            } else {
                list.iter().position(|&v| v == def).map_or(list.len(), |i| i + 1)
            }
        };
        if in_current {
            self.out.insert(index, new);
        } else {
            self.func.block_mut(block).values.insert(index, new);
        }
    }

    /// Free every register holding `v`.
    fn release(&mut self, v: ValueId) {
        for r in self.regs.regs_of(v) {
            self.regs.free(r);
        }
    }

    fn evict(&mut self, reg: AsmReg) -> CompileResult<()> {
        let Some(occupant) = self.regs.occupant(reg) else {
            return Ok(());
        };
        let v = occupant.value;
        if self.regs.is_dirty(reg) && self.live_after_current(v) {
            self.ensure_home(v)?;
        }
        log::trace!("{}: evicted {v} from {reg}", self.func.name);
        self.release(v);
        Ok(())
    }

    fn pick_victim(&self, exclude: RegBitSet) -> Option<AsmReg> {
        let allocatable = self.regs.allocatable();
        let mut best: Option<(u32, AsmReg)> = None;
        for r in self.regs.evictable(exclude) {
            if !allocatable.contains(r) {
                continue;
            }
            let Some(occupant) = self.regs.occupant(r) else {
                continue;
            };
            let d = self.distance(occupant.value);
            if best.map_or(true, |(bd, _)| d > bd) {
                best = Some((d, r));
            }
        }
        best.map(|(_, r)| r)
    }

    /// Find `parts` distinct registers, evicting if necessary.
    fn alloc_regs(&mut self, parts: u32) -> CompileResult<Vec<AsmReg>> {
        let mut chosen = Vec::with_capacity(parts as usize);
        let mut taken = RegBitSet::new();
        for _ in 0..parts {
            let reg = match self.regs.find_free(taken) {
                Some(r) => r,
                None => {
                    let Some(victim) = self.pick_victim(taken) else {
                        return Err(self.error(format!(
                            "no register left at {} of {}",
                            self.pos,
                            self.current.map_or("?".into(), |b| b.to_string())
                        )));
                    };
                    self.evict(victim)?;
                    victim
                }
            };
            taken.set(reg);
            chosen.push(reg);
        }
        Ok(chosen)
    }

    /// Make `u` available in registers for the current instruction and lock
    /// them; returns the value that names the register copy.
    fn use_in_reg(&mut self, u: ValueId) -> CompileResult<(ValueId, Vec<AsmReg>)> {
        let held = self.regs.regs_of(u);
        if let Some(&first) = held.first() {
            for &r in &held {
                self.regs.lock(r);
            }
            let alias = self.regs.occupant(first).map_or(u, |o| o.alias);
            return Ok((alias, held));
        }

        let parts = self.parts(u)?;
        let block = self.current.unwrap_or(self.func.entry);
        let ty = self.func.value(u).ty;
        let copy = match self.func.value(u).loc {
            Some(ValueLocation::Imm(k)) => {
                self.remats += 1;
                self.func.new_value(block, Op::Const, ty, &[], Aux::Int(k))
            }
            _ => {
                let Some(&home) = self.homes.get(&u) else {
                    return Err(self.error(format!("{u} is neither in a register nor in memory")));
                };
                self.reloads += 1;
                self.func.new_value(block, Op::LoadReg, ty, &[home], Aux::None)
            }
        };
        let regs = self.alloc_regs(parts)?;
        for (part, &r) in regs.iter().enumerate() {
            self.regs.assign(r, Occupant { value: u, alias: copy, part: part as u8 }, false);
            self.regs.lock(r);
        }
        self.func.value_mut(copy).loc = ValueLocation::from_regs(&regs);
        self.out.push(copy);
        log::trace!("{}: {u} reloaded into {} as {copy}", self.func.name, regs[0]);
        Ok((copy, regs))
    }

    /// Where a use that does not need a register should read `u` from.
    fn current_copy(&mut self, u: ValueId) -> CompileResult<ValueId> {
        match self.regs.regs_of(u).first() {
            Some(&r) => Ok(self.regs.occupant(r).map_or(u, |o| o.alias)),
            None => self.ensure_home(u),
        }
    }

    // ---- instructions --------------------------------------------------------

    fn allocate_value(&mut self, v: ValueId) -> CompileResult<()> {
        let operands: Vec<ValueId> = self.func.data_args(v).to_vec();
        let mut distinct: Vec<ValueId> = Vec::with_capacity(operands.len());
        for &u in &operands {
            if self.func.value(u).has_result() && !distinct.contains(&u) {
                distinct.push(u);
            }
        }
        // Operands already in registers must survive the reloads of the others.
        for &u in &distinct {
            for r in self.regs.regs_of(u) {
                self.regs.lock(r);
            }
        }
        for &u in &distinct {
            let (alias, _) = self.use_in_reg(u)?;
            if alias != u {
                for (k, &arg) in operands.iter().enumerate() {
                    if arg == u {
                        self.func.set_arg(v, k, alias);
                    }
                }
            }
        }
        for &u in &distinct {
            if !self.live_after_current(u) {
                self.release(u);
            }
        }

        if self.func.value(v).has_result() {
            let parts = self.parts(v)?;
            let regs = self.alloc_regs(parts)?;
            for (part, &r) in regs.iter().enumerate() {
                self.regs.assign(r, Occupant { value: v, alias: v, part: part as u8 }, true);
            }
            self.func.value_mut(v).loc = ValueLocation::from_regs(&regs);
            self.out.push(v);
            if !self.live_after_current(v) {
                self.release(v);
            }
        } else {
            self.out.push(v);
        }
        self.regs.unlock_all();
        Ok(())
    }

    fn allocate_call(&mut self, v: ValueId) -> CompileResult<()> {
        let args: Vec<ValueId> = self.func.data_args(v).to_vec();
        for (k, &u) in args.iter().enumerate() {
            let source = self.current_copy(u)?;
            if source != u {
                self.func.set_arg(v, k, source);
            }
        }

        for (reg, occupant) in self.regs.occupied() {
            if self.regs.is_dirty(reg) && self.live_after_current(occupant.value) {
                self.ensure_home(occupant.value)?;
            }
        }
        self.regs.clear();

        let layout = expand_call(self.func, self.types, v)?;
        self.outgoing_size = self.outgoing_size.max(layout.stack_size);
        self.call_sites += 1;
        self.out.push(v);

        if let Some(loc) = layout.result {
            for (part, r) in loc.regs().into_iter().enumerate() {
                self.regs.assign(r, Occupant { value: v, alias: v, part: part as u8 }, true);
            }
            self.func.value_mut(v).loc = Some(loc);
            if !self.live_after_current(v) {
                self.release(v);
            }
        }
        Ok(())
    }

    fn allocate_control(&mut self, b: BlockId) -> CompileResult<()> {
        let block = self.func.block(b);
        match (block.kind, block.control) {
            (BlockKind::If, Some(c)) => {
                let (alias, _) = self.use_in_reg(c)?;
                self.func.block_mut(b).control = Some(alias);
            }
            (BlockKind::Ret, Some(ret)) => {
                let args: Vec<ValueId> = self.func.data_args(ret).to_vec();
                for (k, &u) in args.iter().enumerate() {
                    let source = self.current_copy(u)?;
                    if source != u {
                        self.func.set_arg(ret, k, source);
                    }
                }
            }
            _ => {}
        }
        self.regs.unlock_all();
        Ok(())
    }

    // ---- phi resolution ------------------------------------------------------

    /// Rewrite phi operands to their location at the end of each predecessor
    /// and collect the copies each predecessor must perform.
    fn resolve_edges(&mut self, layout: &[BlockId]) -> CompileResult<Vec<Vec<PartMove>>> {
        let mut edge_moves = vec![Vec::new(); self.func.blocks.len()];
        for &pred in layout {
            let succs = self.func.block(pred).succs.clone();
            for succ in succs {
                let Some(k) = self.func.pred_index(succ, pred) else {
                    continue;
                };
                let phis: Vec<ValueId> = self
                    .func
                    .phis(succ)
                    .filter(|&p| self.func.value(p).has_result())
                    .collect();
                for phi in phis {
                    let u = self.func.arg(phi, k);
                    let held = self.end_state[pred.index()]
                        .as_ref()
                        .and_then(|state| state.iter().find(|(_, o)| o.value == u).map(|(_, o)| o.alias));
                    let source = match held {
                        Some(alias) => alias,
                        None => self.ensure_home(u)?,
                    };
                    self.func.set_arg(phi, k, source);

                    let (Some(src), Some(dst)) = (self.func.value(source).loc, self.func.value(phi).loc) else {
                        return Err(self.error(format!("phi {phi} operand {source} has no location")));
                    };
                    for part in 0..self.parts(phi)? {
                        let m = PartMove::new(src.part(part), dst.part(part));
                        if m.src != m.dst {
                            edge_moves[pred.index()].push(m);
                        }
                    }
                }
            }
        }
        Ok(edge_moves)
    }
}

/// Verify that no two simultaneously live values share a register and that
/// no register value is live across a call.
pub fn check_allocation(func: &Func) -> CompileResult<()> {
    let live = Liveness::compute(func);
    let conflict = |a: ValueId, b: ValueId, reg: AsmReg| CompileError::RegisterConflict {
        func: func.name.clone(),
        a: a.to_string(),
        b: b.to_string(),
        reg: reg.to_string(),
    };
    let reg_loc = |v: ValueId| func.value(v).loc.filter(|l| l.is_reg()).map(|l| l.regs());

    for b in func.reverse_postorder() {
        let block = func.block(b);
        let mut live_now = live.live_out(b).clone();
        match (block.kind, block.control) {
            (BlockKind::If, Some(c)) => {
                live_now.insert(c);
            }
            (BlockKind::Ret, Some(ret)) => {
                for &a in func.data_args(ret) {
                    if func.value(a).has_result() {
                        live_now.insert(a);
                    }
                }
            }
            _ => {}
        }

        let mut owner: HashMap<AsmReg, ValueId> = HashMap::new();
        for w in live_now.iter() {
            for r in reg_loc(w).unwrap_or_default() {
                if let Some(&other) = owner.get(&r) {
                    return Err(conflict(other, w, r));
                }
                owner.insert(r, w);
            }
        }

        for &v in block.values.iter().rev() {
            let value = func.value(v);
            live_now.remove(v);
            if let Some(regs) = reg_loc(v) {
                for w in live_now.iter() {
                    if let Some(other) = reg_loc(w) {
                        if let Some(&r) = regs.iter().find(|r| other.contains(*r)) {
                            return Err(conflict(v, w, r));
                        }
                    }
                }
            }
            if value.op == Op::Call {
                for w in live_now.iter() {
                    if let Some(other) = reg_loc(w) {
                        return Err(conflict(w, v, other[0]));
                    }
                }
            }
            if value.op != Op::Phi {
                for &a in func.data_args(v) {
                    if func.value(a).has_result() {
                        live_now.insert(a);
                    }
                }
            }
        }
    }
    Ok(())
}
