// This module converts the block-structured IR into SSA form on the fly, without a separate
// phi placement pass. Every block keeps a map from variable to its current defining value;
// writes update the map and reads consult it first, then resolve through predecessors. A
// single predecessor forwards its definition, several predecessors get a placeholder phi
// whose operands are read from each of them, and blocks whose predecessors are not all
// filled yet (loop headers) record incomplete phis that are completed when the block is
// sealed. The resolution walk runs on an explicit frame stack allocated in the session
// arena, so deeply nested loops never grow the call stack. Each frame is a pending phi
// together with the next predecessor to read from and the chain of single-predecessor
// blocks that should cache the final answer. A completed phi whose operands other than
// itself all name one value is trivial: it is forwarded to that value, and the phis that
// used it are re-examined through a worklist. Memory is threaded as one more variable so
// side effects stay ordered. Locals whose address is taken and aggregates wider than two
// words are kept in memory; indirect results use the caller-supplied x8 pointer.

//! On-the-fly SSA construction with sealed blocks and trivial-phi elimination.

use std::mem;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};

use super::{Aux, BlockId, BlockKind, CallInfo, Func, LocalId, Op, ValueId};
use crate::core::error::{CompileError, CompileResult};
use crate::core::types::{TypeId, TypeRegistry};
use crate::ir::{BinOp, Conv, IrBlockId, IrFunc, IrLocalId, NodeId, NodeKind, Terminator, UnOp};

/// A variable renamed by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Var {
    Local(IrLocalId),
    Mem,
}

/// Blocks that assign the variable a surviving phi merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhiDefSites {
    pub phi: ValueId,
    pub def_blocks: Vec<BlockId>,
}

/// Output of SSA construction.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub func: Func,
    /// Definition sites per phi, for the dominance-frontier cross-check.
    pub phi_def_sites: Vec<PhiDefSites>,
    pub phis_created: usize,
    pub phis_removed: usize,
}

/// A phi waiting for its operands.
struct PhiFrame<'b> {
    phi: ValueId,
    block: BlockId,
    next_pred: usize,
    /// Single-predecessor blocks walked to reach `block`; they cache the result.
    chain: BumpVec<'b, BlockId>,
}

/// Build SSA form for `ir`. The IR is validated first.
pub fn build_ssa(ir: &IrFunc, types: &TypeRegistry, arena: &Bump) -> CompileResult<BuildResult> {
    ir.validate(types)?;
    SsaBuilder::new(ir, types, arena).run()
}

/// State of one SSA construction.
pub struct SsaBuilder<'a, 'b> {
    ir: &'a IrFunc,
    types: &'a TypeRegistry,
    arena: &'b Bump,
    func: Func,

    block_map: Vec<Option<BlockId>>,
    ir_block_of: Vec<IrBlockId>,
    /// SSA local for every IR local kept in memory.
    memory_local: Vec<Option<LocalId>>,

    defs: Vec<HashMap<Var, ValueId>>,
    sealed: Vec<bool>,
    filled: Vec<bool>,
    incomplete: Vec<Vec<(Var, ValueId)>>,

    /// Replacement of every phi removed as trivial.
    forward: HashMap<ValueId, ValueId>,
    /// Phis that use a value as an operand.
    phi_users: HashMap<ValueId, Vec<ValueId>>,
    phi_var: HashMap<ValueId, Var>,
    var_defs: HashMap<Var, Vec<BlockId>>,

    consts: HashMap<(TypeId, i64), ValueId>,
    entry_consts: Vec<ValueId>,
    args: Vec<ValueId>,
    result_ptr: Option<ValueId>,
    node_values: Vec<Option<ValueId>>,

    phis_created: usize,
    phis_removed: usize,
}

impl<'a, 'b> SsaBuilder<'a, 'b> {
    pub fn new(ir: &'a IrFunc, types: &'a TypeRegistry, arena: &'b Bump) -> Self {
        Self {
            ir,
            types,
            arena,
            func: Func::new(ir.name.clone(), ir.params.clone(), ir.result),
            block_map: vec![None; ir.blocks.len()],
            ir_block_of: Vec::new(),
            memory_local: vec![None; ir.locals.len()],
            defs: Vec::new(),
            sealed: Vec::new(),
            filled: Vec::new(),
            incomplete: Vec::new(),
            forward: HashMap::new(),
            phi_users: HashMap::new(),
            phi_var: HashMap::new(),
            var_defs: HashMap::new(),
            consts: HashMap::new(),
            entry_consts: Vec::new(),
            args: Vec::new(),
            result_ptr: None,
            node_values: vec![None; ir.nodes.len()],
            phis_created: 0,
            phis_removed: 0,
        }
    }

    pub fn run(mut self) -> CompileResult<BuildResult> {
        self.create_blocks();
        self.create_locals();
        self.create_entry_values();

        let order = self.func.reverse_postorder();
        self.seal_block(self.func.entry)?;
        for &block in &order {
            if !self.sealed[block.index()] && self.preds_filled(block) {
                self.seal_block(block)?;
            }
            self.fill_block(block)?;
            self.filled[block.index()] = true;
            let succs = self.func.block(block).succs.clone();
            for succ in succs {
                if !self.sealed[succ.index()] && self.preds_filled(succ) {
                    self.seal_block(succ)?;
                }
            }
        }

        if let Some(b) = self.sealed.iter().position(|&s| !s) {
            return Err(CompileError::CfgInconsistent {
                func: self.func.name.clone(),
                block: BlockId::new(b).to_string(),
                reason: "block was never sealed".into(),
            });
        }

        self.finish()
    }

    fn create_blocks(&mut self) {
        // Reachable IR blocks, in IR order so block names and ids stay predictable.
        let mut reachable = vec![false; self.ir.blocks.len()];
        let mut stack = vec![IrBlockId::new(0)];
        reachable[0] = true;
        while let Some(b) = stack.pop() {
            if let Some(term) = &self.ir.block(b).term {
                for succ in term.successors() {
                    if !reachable[succ.index()] {
                        reachable[succ.index()] = true;
                        stack.push(succ);
                    }
                }
            }
        }

        for (i, block) in self.ir.blocks.iter().enumerate() {
            if !reachable[i] {
                log::trace!("{}: dropping unreachable block {}", self.ir.name, block.name);
                continue;
            }
            let kind = match &block.term {
                Some(Terminator::Branch {
                    then_block,
                    else_block,
                    ..
                }) if then_block != else_block => BlockKind::If,
                Some(Terminator::Ret(_)) => BlockKind::Ret,
                _ => BlockKind::Plain,
            };
            let id = self.func.add_block(kind, block.name.clone());
            self.block_map[i] = Some(id);
            self.ir_block_of.push(IrBlockId::new(i));
            self.defs.push(HashMap::new());
            self.sealed.push(false);
            self.filled.push(false);
            self.incomplete.push(Vec::new());
        }

        for b in 0..self.ir_block_of.len() {
            let ir_block = self.ir.block(self.ir_block_of[b]);
            let mut succs = match &ir_block.term {
                Some(term) => term.successors(),
                None => Vec::new(),
            };
            succs.dedup();
            for succ in succs {
                if let Some(to) = self.block_map[succ.index()] {
                    self.func.add_edge(BlockId::new(b), to);
                }
            }
        }
    }

    fn create_locals(&mut self) {
        let in_memory = self.ir.memory_locals(self.types);
        for (i, local) in self.ir.locals.iter().enumerate() {
            if in_memory[i] {
                self.memory_local[i] = Some(self.func.add_local(local.name.clone(), local.ty));
            }
        }
    }

    fn create_entry_values(&mut self) {
        let entry = self.func.entry;
        let mem = self.func.append_value(entry, Op::InitMem, TypeId::MEM, &[], Aux::None);
        self.write_variable(Var::Mem, entry, mem, true);

        for (i, &ty) in self.ir.params.iter().enumerate() {
            let arg_ty = if self.types.is_memory_aggregate(ty) {
                TypeId::PTR
            } else {
                ty
            };
            let arg = self
                .func
                .append_value(entry, Op::Arg, arg_ty, &[], Aux::Int(i as i64));
            self.args.push(arg);
        }

        if self.types.is_memory_aggregate(self.ir.result) {
            let ptr = self
                .func
                .append_value(entry, Op::ResultPtr, TypeId::PTR, &[], Aux::None);
            self.result_ptr = Some(ptr);
        }
    }

    fn preds_filled(&self, block: BlockId) -> bool {
        self.func
            .block(block)
            .preds
            .iter()
            .all(|p| self.filled[p.index()])
    }

    // ---- variable resolution -------------------------------------------------

    fn write_variable(&mut self, var: Var, block: BlockId, value: ValueId, is_def: bool) {
        self.defs[block.index()].insert(var, value);
        if is_def {
            let sites = self.var_defs.entry(var).or_default();
            if sites.last() != Some(&block) {
                sites.push(block);
            }
        }
    }

    /// Follow trivial-phi replacements to the surviving value.
    fn resolve(&self, mut value: ValueId) -> ValueId {
        while let Some(&next) = self.forward.get(&value) {
            value = next;
        }
        value
    }

    fn var_type(&self, var: Var) -> TypeId {
        match var {
            Var::Local(l) => self.ir.locals[l.index()].ty,
            Var::Mem => TypeId::MEM,
        }
    }

    fn var_name(&self, var: Var) -> String {
        match var {
            Var::Local(l) => self.ir.locals[l.index()].name.clone(),
            Var::Mem => "<memory>".into(),
        }
    }

    /// Insert an operand-less phi at the top of `block`.
    fn new_phi(&mut self, var: Var, block: BlockId) -> ValueId {
        let ty = self.var_type(var);
        let npreds = self.func.block(block).preds.len();
        let id = ValueId::new(self.func.values.len());
        let placeholder = vec![id; npreds];
        self.func.new_value(block, Op::Phi, ty, &placeholder, Aux::None);
        let at = self.func.phis(block).count();
        self.func.block_mut(block).values.insert(at, id);
        self.phi_var.insert(id, var);
        self.phis_created += 1;
        log::trace!("{}: phi {} for {} in {}", self.func.name, id, self.var_name(var), block);
        id
    }

    /// Current definition of `var` visible at the end of `block`.
    pub fn read_variable(&mut self, var: Var, block: BlockId) -> CompileResult<ValueId> {
        let frames = BumpVec::new_in(self.arena);
        self.resolve_frames(var, frames, block)
    }

    /// Drive resolution until every pending phi on the frame stack is complete.
    ///
    /// `descend` is the block whose end-of-block definition is needed next;
    /// its answer feeds the operand `next_pred` of the top frame.
    fn resolve_frames(
        &mut self,
        var: Var,
        mut frames: BumpVec<'b, PhiFrame<'b>>,
        mut descend: BlockId,
    ) -> CompileResult<ValueId> {
        loop {
            // Walk single-predecessor chains until a definition or a merge point.
            let mut chain = BumpVec::new_in(self.arena);
            let mut cur = descend;
            let result = loop {
                if let Some(&v) = self.defs[cur.index()].get(&var) {
                    break Some(self.resolve(v));
                }
                if !self.sealed[cur.index()] {
                    let phi = self.new_phi(var, cur);
                    self.incomplete[cur.index()].push((var, phi));
                    self.write_variable(var, cur, phi, false);
                    break Some(phi);
                }
                let preds = &self.func.block(cur).preds;
                match preds.len() {
                    0 => {
                        return Err(CompileError::UndefinedVariable {
                            func: self.func.name.clone(),
                            local: self.var_name(var),
                            block: self.func.block(descend).name.clone(),
                        })
                    }
                    1 => {
                        let pred = preds[0];
                        chain.push(cur);
                        cur = pred;
                    }
                    _ => {
                        let first = preds[0];
                        let phi = self.new_phi(var, cur);
                        // Register before reading operands to break cycles.
                        self.write_variable(var, cur, phi, false);
                        frames.push(PhiFrame {
                            phi,
                            block: cur,
                            next_pred: 0,
                            chain: mem::replace(&mut chain, BumpVec::new_in(self.arena)),
                        });
                        descend = first;
                        break None;
                    }
                }
            };
            let Some(value) = result else {
                continue;
            };
            for &b in chain.iter() {
                self.write_variable(var, b, value, false);
            }

            // Feed the answer to pending phis, completing as many as possible.
            let mut value = value;
            loop {
                let Some(frame) = frames.last_mut() else {
                    return Ok(value);
                };
                let (phi, index) = (frame.phi, frame.next_pred);
                frame.next_pred += 1;
                let next = frame.next_pred;
                let block = frame.block;
                self.add_phi_operand(phi, index, value);

                let preds = &self.func.block(block).preds;
                if next < preds.len() {
                    descend = preds[next];
                    break;
                }
                let Some(done) = frames.pop() else {
                    return Ok(value);
                };
                let replaced = self.try_remove_trivial_phi(done.phi);
                // A sealed-late block may already hold a newer definition.
                if self.defs[done.block.index()].get(&var) == Some(&done.phi) {
                    self.write_variable(var, done.block, replaced, false);
                }
                for &b in done.chain.iter() {
                    self.write_variable(var, b, replaced, false);
                }
                value = replaced;
            }
        }
    }

    fn add_phi_operand(&mut self, phi: ValueId, index: usize, value: ValueId) {
        self.func.set_arg(phi, index, value);
        if value != phi {
            self.phi_users.entry(value).or_default().push(phi);
        }
    }

    /// Complete an incomplete phi once its block is sealed.
    fn fill_incomplete_phi(&mut self, var: Var, phi: ValueId, block: BlockId) -> CompileResult<ValueId> {
        let Some(&first) = self.func.block(block).preds.first() else {
            return Ok(phi);
        };
        let mut frames = BumpVec::new_in(self.arena);
        frames.push(PhiFrame {
            phi,
            block,
            next_pred: 0,
            chain: BumpVec::new_in(self.arena),
        });
        self.resolve_frames(var, frames, first)
    }

    fn seal_block(&mut self, block: BlockId) -> CompileResult<()> {
        self.sealed[block.index()] = true;
        let pending = std::mem::take(&mut self.incomplete[block.index()]);
        for (var, phi) in pending {
            self.fill_incomplete_phi(var, phi, block)?;
        }
        log::trace!("{}: sealed {}", self.func.name, block);
        Ok(())
    }

    /// Replace `phi` by its unique non-self operand if it has one, then
    /// re-examine the phis that used it. Returns the surviving value.
    fn try_remove_trivial_phi(&mut self, phi: ValueId) -> ValueId {
        let mut worklist = BumpVec::new_in(self.arena);
        worklist.push(phi);
        while let Some(candidate) = worklist.pop() {
            if self.forward.contains_key(&candidate) {
                continue;
            }
            let mut same = None;
            let mut trivial = true;
            for &op in self.func.args(candidate) {
                let op = self.resolve(op);
                if op == candidate || Some(op) == same {
                    continue;
                }
                if same.is_some() {
                    trivial = false;
                    break;
                }
                same = Some(op);
            }
            // A phi that only references itself sits in a cycle with no entry
            // definition; it stays until its remaining operands arrive.
            let (true, Some(same)) = (trivial, same) else {
                continue;
            };

            log::trace!("{}: trivial phi {} -> {}", self.func.name, candidate, same);
            self.forward.insert(candidate, same);
            self.phis_removed += 1;
            if let Some(users) = self.phi_users.remove(&candidate) {
                for user in users {
                    if user != candidate && !self.forward.contains_key(&user) {
                        self.phi_users.entry(same).or_default().push(user);
                        worklist.push(user);
                    }
                }
            }
        }
        self.resolve(phi)
    }

    // ---- per-block lowering --------------------------------------------------

    fn invalid(&self, reason: impl Into<String>) -> CompileError {
        CompileError::InvalidIr {
            func: self.func.name.clone(),
            reason: reason.into(),
        }
    }

    fn unsupported(&self, reason: impl Into<String>) -> CompileError {
        CompileError::UnsupportedType {
            func: self.func.name.clone(),
            reason: reason.into(),
        }
    }

    fn node_value(&self, node: NodeId) -> CompileResult<ValueId> {
        self.node_values[node.index()]
            .ok_or_else(|| self.invalid(format!("node {node} has no value")))
    }

    /// Hash-consed integer constant, normalized to the width of `ty`.
    fn constant(&mut self, ty: TypeId, value: i64) -> ValueId {
        let bits = self.types.bits(ty);
        let value = if ty == TypeId::BOOL {
            value & 1
        } else if bits < 64 {
            let shift = 64 - bits;
            if self.types.is_signed(ty) {
                (value << shift) >> shift
            } else {
                ((value as u64) << shift >> shift) as i64
            }
        } else {
            value
        };
        if let Some(&c) = self.consts.get(&(ty, value)) {
            return c;
        }
        let entry = self.func.entry;
        let c = self.func.new_value(entry, Op::Const, ty, &[], Aux::Int(value));
        self.consts.insert((ty, value), c);
        self.entry_consts.push(c);
        c
    }

    fn memory(&mut self, block: BlockId) -> CompileResult<ValueId> {
        self.read_variable(Var::Mem, block)
    }

    /// Append a side effect consuming and producing the memory state.
    fn effect(&mut self, block: BlockId, op: Op, ty: TypeId, args: &[ValueId], aux: Aux) -> CompileResult<ValueId> {
        let mem = self.memory(block)?;
        let mut all = args.to_vec();
        all.push(mem);
        let v = self.func.append_value(block, op, ty, &all, aux);
        self.write_variable(Var::Mem, block, v, true);
        Ok(v)
    }

    fn load(&mut self, block: BlockId, ty: TypeId, ptr: ValueId) -> CompileResult<ValueId> {
        let mem = self.memory(block)?;
        Ok(self.func.append_value(block, Op::Load, ty, &[ptr, mem], Aux::None))
    }

    /// Copy a memory aggregate into a fresh hidden local and return its address.
    fn snapshot(&mut self, block: BlockId, ty: TypeId, src: ValueId) -> CompileResult<ValueId> {
        let local = self.func.add_local(format!("tmp{}", self.func.locals.len()), ty);
        let dst = self
            .func
            .append_value(block, Op::LocalAddr, TypeId::PTR, &[], Aux::Local(local));
        let size = self.types.size(ty) as i64;
        self.effect(block, Op::Move, TypeId::MEM, &[dst, src], Aux::Int(size))?;
        Ok(dst)
    }

    /// Store a value of type `ty` to `ptr`, copying memory aggregates.
    fn store_to(&mut self, block: BlockId, ptr: ValueId, ty: TypeId, value: ValueId) -> CompileResult<()> {
        if self.types.is_memory_aggregate(ty) {
            let size = self.types.size(ty) as i64;
            self.effect(block, Op::Move, TypeId::MEM, &[ptr, value], Aux::Int(size))?;
        } else {
            self.effect(block, Op::Store, TypeId::MEM, &[ptr, value], Aux::None)?;
        }
        Ok(())
    }

    fn local_addr(&mut self, block: BlockId, local: LocalId) -> ValueId {
        self.func
            .append_value(block, Op::LocalAddr, TypeId::PTR, &[], Aux::Local(local))
    }

    fn fill_block(&mut self, block: BlockId) -> CompileResult<()> {
        let ir = self.ir;
        let ir_block = ir.block(self.ir_block_of[block.index()]);
        for &node_id in &ir_block.nodes {
            let value = self.lower_node(block, node_id)?;
            self.node_values[node_id.index()] = value;
        }

        match &ir_block.term {
            Some(Terminator::Jump(_)) => {}
            Some(Terminator::Branch { cond, .. }) => {
                if self.func.block(block).kind == BlockKind::If {
                    let c = self.node_value(*cond)?;
                    self.func.block_mut(block).control = Some(c);
                }
            }
            Some(Terminator::Ret(value)) => {
                let mem = self.memory(block)?;
                let args = match value {
                    None => vec![mem],
                    Some(node) => {
                        let v = self.node_value(*node)?;
                        let ty = ir.node(*node).ty;
                        match self.result_ptr {
                            Some(ptr) if self.types.is_memory_aggregate(ty) => {
                                let size = self.types.size(ty) as i64;
                                let mem = self.effect(block, Op::Move, TypeId::MEM, &[ptr, v], Aux::Int(size))?;
                                vec![mem]
                            }
                            _ => vec![v, mem],
                        }
                    }
                };
                let ret = self.func.new_value(block, Op::Ret, TypeId::VOID, &args, Aux::None);
                self.func.block_mut(block).control = Some(ret);
            }
            None => return Err(self.invalid(format!("block {} has no terminator", ir_block.name))),
        }
        Ok(())
    }

    fn lower_node(&mut self, block: BlockId, node_id: NodeId) -> CompileResult<Option<ValueId>> {
        let ir = self.ir;
        let node = ir.node(node_id);
        let ty = node.ty;
        let value = match &node.kind {
            NodeKind::Param(i) => self.args[*i as usize],
            NodeKind::Const(v) => self.constant(ty, *v),
            NodeKind::Binary(op, a, b) => {
                let (a, b) = (self.node_value(*a)?, self.node_value(*b)?);
                let signed = self.types.is_signed(ty);
                let op = match (op, signed) {
                    (BinOp::Add, _) => Op::Add,
                    (BinOp::Sub, _) => Op::Sub,
                    (BinOp::Mul, _) => Op::Mul,
                    (BinOp::Div, true) => Op::SDiv,
                    (BinOp::Div, false) => Op::UDiv,
                    (BinOp::Rem, true) => Op::SRem,
                    (BinOp::Rem, false) => Op::URem,
                    (BinOp::And, _) => Op::And,
                    (BinOp::Or, _) => Op::Or,
                    (BinOp::Xor, _) => Op::Xor,
                    (BinOp::Shl, _) => Op::Shl,
                    (BinOp::Shr, true) => Op::AShr,
                    (BinOp::Shr, false) => Op::LShr,
                };
                self.func.append_value(block, op, ty, &[a, b], Aux::None)
            }
            NodeKind::Unary(op, a) => {
                let a = self.node_value(*a)?;
                let op = match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                };
                self.func.append_value(block, op, ty, &[a], Aux::None)
            }
            NodeKind::Cmp(cond, a, b) => {
                let (a, b) = (self.node_value(*a)?, self.node_value(*b)?);
                self.func
                    .append_value(block, Op::Cmp, TypeId::BOOL, &[a, b], Aux::Cond(*cond))
            }
            NodeKind::Convert(conv, a) => {
                let a = self.node_value(*a)?;
                let op = match conv {
                    Conv::SignExt => Op::SignExt,
                    Conv::ZeroExt => Op::ZeroExt,
                    Conv::Trunc => Op::Trunc,
                };
                self.func.append_value(block, op, ty, &[a], Aux::None)
            }
            NodeKind::LoadLocal(l) => match self.memory_local[l.index()] {
                None => self.read_variable(Var::Local(*l), block)?,
                Some(local) => {
                    let addr = self.local_addr(block, local);
                    if self.types.is_memory_aggregate(ty) {
                        self.snapshot(block, ty, addr)?
                    } else {
                        self.load(block, ty, addr)?
                    }
                }
            },
            NodeKind::StoreLocal(l, v) => {
                let v = self.node_value(*v)?;
                match self.memory_local[l.index()] {
                    None => self.write_variable(Var::Local(*l), block, v, true),
                    Some(local) => {
                        let addr = self.local_addr(block, local);
                        let local_ty = self.ir.locals[l.index()].ty;
                        self.store_to(block, addr, local_ty, v)?;
                    }
                }
                return Ok(None);
            }
            NodeKind::AddrOf(l) => {
                let local = self.memory_local[l.index()]
                    .ok_or_else(|| self.invalid(format!("address of register local {l}")))?;
                self.local_addr(block, local)
            }
            NodeKind::Load(p) => {
                let p = self.node_value(*p)?;
                if self.types.is_memory_aggregate(ty) {
                    self.snapshot(block, ty, p)?
                } else {
                    self.load(block, ty, p)?
                }
            }
            NodeKind::Store { ptr, value } => {
                let value_ty = self.ir.node(*value).ty;
                let (p, v) = (self.node_value(*ptr)?, self.node_value(*value)?);
                self.store_to(block, p, value_ty, v)?;
                return Ok(None);
            }
            NodeKind::Offset(p, off) => {
                let p = self.node_value(*p)?;
                self.func
                    .append_value(block, Op::OffPtr, TypeId::PTR, &[p], Aux::Int(*off))
            }
            NodeKind::Global(name) => {
                self.func
                    .append_value(block, Op::GlobalAddr, TypeId::PTR, &[], Aux::Sym(name.clone()))
            }
            NodeKind::Call { callee, args, fixed } => return self.lower_call(block, ty, callee, args, *fixed),
            NodeKind::Aggregate(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for &f in fields {
                    values.push(self.node_value(f)?);
                }
                if self.types.is_memory_aggregate(ty) {
                    let local = self.func.add_local(format!("tmp{}", self.func.locals.len()), ty);
                    let base = self.local_addr(block, local);
                    for (i, (&field, &value)) in fields.iter().zip(&values).enumerate() {
                        let offset = self
                            .types
                            .field_offset(ty, i)
                            .ok_or_else(|| self.invalid(format!("{} has no field {i}", self.types.name(ty))))?
                            as i64;
                        let ptr = self
                            .func
                            .append_value(block, Op::OffPtr, TypeId::PTR, &[base], Aux::Int(offset));
                        let field_ty = self.ir.node(field).ty;
                        self.store_to(block, ptr, field_ty, value)?;
                    }
                    base
                } else if self.types.is_word_partitioned(ty) {
                    self.func.append_value(block, Op::Pack, ty, &values, Aux::None)
                } else {
                    return Err(self.unsupported(format!(
                        "cannot build {} in registers",
                        self.types.name(ty)
                    )));
                }
            }
            NodeKind::Extract(a, index) => {
                let agg_ty = self.ir.node(*a).ty;
                let a = self.node_value(*a)?;
                if self.types.is_memory_aggregate(agg_ty) {
                    let offset = self
                        .types
                        .field_offset(agg_ty, *index as usize)
                        .ok_or_else(|| self.invalid(format!("{} has no field {index}", self.types.name(agg_ty))))?
                        as i64;
                    let ptr = self
                        .func
                        .append_value(block, Op::OffPtr, TypeId::PTR, &[a], Aux::Int(offset));
                    if self.types.is_memory_aggregate(ty) {
                        ptr
                    } else {
                        self.load(block, ty, ptr)?
                    }
                } else if self.types.is_word_partitioned(agg_ty) {
                    self.func
                        .append_value(block, Op::Extract, ty, &[a], Aux::Int(*index as i64))
                } else {
                    return Err(self.unsupported(format!(
                        "cannot extract from {} in registers",
                        self.types.name(agg_ty)
                    )));
                }
            }
            NodeKind::Zero { ptr, ty: zero_ty } => {
                let p = self.node_value(*ptr)?;
                let size = self.types.size(*zero_ty) as i64;
                self.effect(block, Op::Zero, TypeId::MEM, &[p], Aux::Int(size))?;
                return Ok(None);
            }
            NodeKind::Copy(a) => {
                let a = self.node_value(*a)?;
                if self.types.is_memory_aggregate(ty) {
                    a
                } else {
                    self.func.append_value(block, Op::Copy, ty, &[a], Aux::None)
                }
            }
        };
        Ok(Some(value))
    }

    fn lower_call(
        &mut self,
        block: BlockId,
        ty: TypeId,
        callee: &str,
        args: &[NodeId],
        fixed: usize,
    ) -> CompileResult<Option<ValueId>> {
        let mut values = Vec::with_capacity(args.len() + 1);
        let mut result_addr = None;
        let indirect = self.types.is_memory_aggregate(ty);
        if indirect {
            let local = self.func.add_local(format!("ret{}", self.func.locals.len()), ty);
            let addr = self.local_addr(block, local);
            values.push(addr);
            result_addr = Some(addr);
        }

        for &arg in args {
            let arg_ty = self.ir.node(arg).ty;
            let v = self.node_value(arg)?;
            // Wide aggregates travel by reference to a caller-owned copy.
            let v = if self.types.is_memory_aggregate(arg_ty) {
                self.snapshot(block, arg_ty, v)?
            } else {
                v
            };
            values.push(v);
        }

        let call_ty = if indirect { TypeId::VOID } else { ty };
        let info = CallInfo {
            symbol: callee.to_string(),
            fixed_args: (fixed + usize::from(indirect)) as u32,
            indirect_result: indirect,
        };
        let call = self.effect(block, Op::Call, call_ty, &values, Aux::Call(Box::new(info)))?;
        Ok(match result_addr {
            Some(addr) => Some(addr),
            None if ty != TypeId::VOID => Some(call),
            None => None,
        })
    }

    // ---- finalization --------------------------------------------------------

    fn finish(mut self) -> CompileResult<BuildResult> {
        let phis: Vec<ValueId> = self
            .func
            .block_ids()
            .flat_map(|b| self.func.phis(b))
            .filter(|p| !self.forward.contains_key(p))
            .collect();
        self.collapse_phi_groups(&phis);

        // Rewrite every operand through the replacement map.
        for b in 0..self.func.blocks.len() {
            let block = BlockId::new(b);
            let values = self.func.block(block).values.clone();
            let mut kept = Vec::with_capacity(values.len());
            for v in values {
                if self.forward.contains_key(&v) {
                    continue;
                }
                self.rewrite_args(v);
                kept.push(v);
            }
            self.func.block_mut(block).values = kept;
            if let Some(control) = self.func.block(block).control {
                let control = self.resolve(control);
                self.func.block_mut(block).control = Some(control);
                self.rewrite_args(control);
            }
        }

        // Constants sit right after the entry prefix.
        let entry = self.func.entry;
        let prefix = self
            .func
            .block(entry)
            .values
            .iter()
            .take_while(|&&v| self.func.value(v).op.is_block_prefix())
            .count();
        let consts = std::mem::take(&mut self.entry_consts);
        let entry_values = &mut self.func.block_mut(entry).values;
        for (i, c) in consts.into_iter().enumerate() {
            entry_values.insert(prefix + i, c);
        }

        self.remove_dead_phis();
        self.func.recount_uses();

        let mut phi_def_sites = Vec::new();
        for b in self.func.block_ids() {
            for phi in self.func.phis(b) {
                let def_blocks = self
                    .phi_var
                    .get(&phi)
                    .and_then(|var| self.var_defs.get(var))
                    .cloned()
                    .unwrap_or_default();
                phi_def_sites.push(PhiDefSites { phi, def_blocks });
            }
        }

        log::debug!(
            "{}: SSA built, {} blocks, {} values, {} phis ({} created, {} trivial)",
            self.func.name,
            self.func.blocks.len(),
            self.func.values.len(),
            phi_def_sites.len(),
            self.phis_created,
            self.phis_removed
        );

        Ok(BuildResult {
            func: self.func,
            phi_def_sites,
            phis_created: self.phis_created,
            phis_removed: self.phis_removed,
        })
    }

    /// Forward every strongly connected group of phis whose operands from
    /// outside the group all name one value. Irreducible loops leave such
    /// groups behind because no member is trivial on its own.
    fn collapse_phi_groups(&mut self, group: &[ValueId]) {
        for scc in self.phi_sccs(group) {
            let members: HashSet<ValueId> = scc.iter().copied().collect();
            let mut outside = Vec::new();
            let mut inner = Vec::new();
            for &phi in &scc {
                let mut closed = true;
                for &op in self.func.args(phi) {
                    let op = self.resolve(op);
                    if members.contains(&op) {
                        continue;
                    }
                    closed = false;
                    if !outside.contains(&op) {
                        outside.push(op);
                    }
                }
                if closed {
                    inner.push(phi);
                }
            }

            if let [same] = outside[..] {
                for &phi in &scc {
                    log::trace!("{}: redundant phi {} -> {}", self.func.name, phi, same);
                    self.forward.insert(phi, same);
                }
                self.phis_removed += scc.len();
            } else if scc.len() > 1 && !inner.is_empty() {
                // Members fed from outside stay; the closed core may still collapse.
                self.collapse_phi_groups(&inner);
            }
        }
    }

    /// Strongly connected components of the phi operand graph restricted to
    /// `group`, operands before users.
    fn phi_sccs(&self, group: &[ValueId]) -> Vec<Vec<ValueId>> {
        const UNSEEN: usize = usize::MAX;
        let slot: HashMap<ValueId, usize> = group.iter().enumerate().map(|(i, &p)| (p, i)).collect();
        let edges: Vec<Vec<usize>> = group
            .iter()
            .map(|&p| {
                self.func
                    .args(p)
                    .iter()
                    .filter_map(|&a| slot.get(&self.resolve(a)).copied())
                    .collect()
            })
            .collect();

        let n = group.len();
        let mut index = vec![UNSEEN; n];
        let mut low = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut sccs = Vec::new();
        let mut next = 0;
        for root in 0..n {
            if index[root] != UNSEEN {
                continue;
            }
            index[root] = next;
            low[root] = next;
            next += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut walk = vec![(root, 0usize)];
            while let Some(top) = walk.last_mut() {
                let (v, edge) = *top;
                if let Some(&w) = edges[v].get(edge) {
                    top.1 += 1;
                    if index[w] == UNSEEN {
                        index[w] = next;
                        low[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        walk.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(index[w]);
                    }
                    continue;
                }
                walk.pop();
                if let Some(&(parent, _)) = walk.last() {
                    low[parent] = low[parent].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut scc = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        scc.push(group[w]);
                        if w == v {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
            }
        }
        sccs
    }

    fn rewrite_args(&mut self, v: ValueId) {
        for i in 0..self.func.value(v).arg_count() {
            let arg = self.func.arg(v, i);
            let resolved = self.resolve(arg);
            if resolved != arg {
                self.func.set_arg(v, i, resolved);
            }
        }
    }

    /// Drop phis not reachable from a non-phi use, including dead phi cycles.
    fn remove_dead_phis(&mut self) {
        let is_phi = |func: &Func, v: ValueId| func.value(v).op == Op::Phi;
        let mut live = HashSet::new();
        let mut work = BumpVec::new_in(self.arena);
        for b in self.func.block_ids() {
            let block = self.func.block(b);
            let roots = block
                .values
                .iter()
                .copied()
                .filter(|&v| !is_phi(&self.func, v))
                .chain(block.control);
            for user in roots {
                for &arg in self.func.args(user) {
                    if is_phi(&self.func, arg) && live.insert(arg) {
                        work.push(arg);
                    }
                }
            }
            if let Some(control) = block.control {
                if is_phi(&self.func, control) && live.insert(control) {
                    work.push(control);
                }
            }
        }
        while let Some(phi) = work.pop() {
            for &arg in self.func.args(phi) {
                if is_phi(&self.func, arg) && live.insert(arg) {
                    work.push(arg);
                }
            }
        }

        let mut removed = 0;
        for b in 0..self.func.blocks.len() {
            let values = std::mem::take(&mut self.func.blocks[b].values);
            let before = values.len();
            let kept: Vec<ValueId> = values
                .into_iter()
                .filter(|&v| !is_phi(&self.func, v) || live.contains(&v))
                .collect();
            removed += before - kept.len();
            self.func.blocks[b].values = kept;
        }
        if removed > 0 {
            log::trace!("{}: removed {} dead phis", self.func.name, removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrBuilder;

    fn build(ir: &IrFunc) -> BuildResult {
        let types = TypeRegistry::new();
        let arena = Bump::new();
        build_ssa(ir, &types, &arena).unwrap()
    }

    #[test]
    fn straight_line_has_no_phis() {
        let mut b = IrBuilder::new("add", &[TypeId::I64, TypeId::I64], TypeId::I64);
        let entry = b.block("entry");
        b.switch_to(entry);
        let x = b.param(0);
        let y = b.param(1);
        let s = b.binary(BinOp::Add, x, y);
        b.ret(Some(s));
        let out = build(&b.finish());
        assert_eq!(out.func.phi_count(), 0);
        assert_eq!(out.phis_created, 0);
        let ret = out.func.block(BlockId::new(0)).control.unwrap();
        assert_eq!(out.func.value(ret).op, Op::Ret);
    }

    #[test]
    fn read_without_definition_is_an_error() {
        let types = TypeRegistry::new();
        let arena = Bump::new();
        let mut b = IrBuilder::new("undef", &[], TypeId::I64);
        let x = b.local("x", TypeId::I64);
        let entry = b.block("entry");
        b.switch_to(entry);
        let v = b.load_local(x);
        b.ret(Some(v));
        let err = build_ssa(&b.finish(), &types, &arena).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { ref local, .. } if local == "x"));
    }

    #[test]
    fn deep_single_predecessor_chain_resolves_iteratively() {
        let mut b = IrBuilder::new("chain", &[TypeId::I64], TypeId::I64);
        let x = b.local("x", TypeId::I64);
        let blocks: Vec<_> = (0..2000).map(|i| b.block(&format!("b{i}"))).collect();
        b.switch_to(blocks[0]);
        let p = b.param(0);
        b.store_local(x, p);
        for w in blocks.windows(2) {
            b.switch_to(w[0]);
            b.jump(w[1]);
        }
        b.switch_to(blocks[1999]);
        let v = b.load_local(x);
        b.ret(Some(v));
        let out = build(&b.finish());
        assert_eq!(out.func.phi_count(), 0);
        let last = BlockId::new(1999);
        let ret = out.func.block(last).control.unwrap();
        let arg = out.func.arg(ret, 0);
        assert_eq!(out.func.value(arg).op, Op::Arg);
    }

    #[test]
    fn address_taken_local_uses_memory() {
        let mut b = IrBuilder::new("addr", &[TypeId::I64], TypeId::I64);
        let x = b.local("x", TypeId::I64);
        let entry = b.block("entry");
        b.switch_to(entry);
        let p = b.param(0);
        b.store_local(x, p);
        let _addr = b.addr_of(x);
        let v = b.load_local(x);
        b.ret(Some(v));
        let out = build(&b.finish());
        assert_eq!(out.func.locals.len(), 1);
        let ops: Vec<Op> = out
            .func
            .block(BlockId::new(0))
            .values
            .iter()
            .map(|&v| out.func.value(v).op)
            .collect();
        assert!(ops.contains(&Op::Store));
        assert!(ops.contains(&Op::Load));
    }

    #[test]
    fn irreducible_loop_memory_phis_collapse() {
        use crate::ssa::dom::{check_phi_placement, DomTree};
        use crate::ssa::Cond;

        let mut b = IrBuilder::new("irr", &[TypeId::I64], TypeId::I64);
        let k = b.local("k", TypeId::I64);
        let entry = b.block("entry");
        let left = b.block("left");
        let right = b.block("right");
        let exit = b.block("exit");
        b.switch_to(entry);
        let n = b.param(0);
        b.store_local(k, n);
        let z = b.const_int(TypeId::I64, 0);
        let c = b.cmp(Cond::Eq, n, z);
        b.branch(c, left, right);
        for (from, to) in [(left, right), (right, left)] {
            b.switch_to(from);
            let g = b.global("step");
            let step = b.load(TypeId::I64, g);
            let v = b.load_local(k);
            let d = b.binary(BinOp::Sub, v, step);
            b.store_local(k, d);
            let z = b.const_int(TypeId::I64, 0);
            let c = b.cmp(Cond::Sle, d, z);
            b.branch(c, exit, to);
        }
        b.switch_to(exit);
        let v = b.load_local(k);
        let g = b.global("last");
        b.store(g, v);
        b.ret(Some(v));

        let out = build(&b.finish());
        let func = &out.func;
        let phis: Vec<ValueId> = func.block_ids().flat_map(|b| func.phis(b)).collect();
        // `k` merges at both headers and at the exit; memory is never written in the loop.
        assert_eq!(phis.len(), 3);
        assert!(phis.iter().all(|&p| func.value(p).ty == TypeId::I64));
        let dom = DomTree::compute(func);
        check_phi_placement(func, &dom, &out.phi_def_sites).unwrap();
        crate::ssa::verify::verify(func).unwrap();
    }

    #[test]
    fn missing_field_is_invalid_ir() {
        let mut types = TypeRegistry::new();
        let triple = types.struct_type(&[TypeId::I64, TypeId::I64, TypeId::I64]);
        let mut b = IrBuilder::new("field", &[triple], TypeId::I64);
        let entry = b.block("entry");
        b.switch_to(entry);
        let p = b.param(0);
        let e = b.extract(&types, p, 5);
        b.ret(Some(e));
        let ir = b.finish();

        let arena = Bump::new();
        let err = SsaBuilder::new(&ir, &types, &arena).run().unwrap_err();
        assert!(
            matches!(err, CompileError::InvalidIr { ref reason, .. } if reason.contains("no field 5")),
            "{err}"
        );
    }
}
