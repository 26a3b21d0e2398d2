// This module holds the SSA form every backend pass works on. A Func owns flat pools of
// values and blocks addressed by u32 newtype ids, plus a shared argument pool: a Value
// records only the range of its operands inside that pool, so rewriting an operand never
// reallocates the value and ids stay valid as passes append new values. Blocks keep their
// ordered value lists, an optional control value, and mutually consistent predecessor and
// successor lists (at most two successors). The memory state is threaded through side
// effects as ordinary values whose type is the MEM pseudo-type; such values and the
// memory operand slot of loads, stores and calls never take part in liveness or register
// allocation. Submodules implement construction from the pre-SSA IR, dominance, liveness,
// verification and critical-edge splitting.

//! SSA data model.

pub mod builder;
pub mod critical;
pub mod dom;
pub mod liveness;
pub mod op;
pub mod verify;

use std::fmt::Write as _;
use std::ops::Range;

use crate::core::types::{TypeId, TypeRegistry};
use crate::core::value_assignment::ValueLocation;

pub use op::{Cond, Op};

id_type!(
    /// Index of a value inside its function.
    ValueId,
    "v"
);
id_type!(
    /// Index of a block inside its function.
    BlockId,
    "b"
);
id_type!(
    /// Index of a memory local inside its function.
    LocalId,
    "l"
);

/// Callee description attached to call values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub symbol: String,
    /// Arguments at or beyond this index are variadic.
    pub fixed_args: u32,
    /// First argument is the indirect result address passed in `x8`.
    pub indirect_result: bool,
}

/// Auxiliary payload of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aux {
    None,
    Int(i64),
    Sym(String),
    Cond(Cond),
    Local(LocalId),
    Call(Box<CallInfo>),
}

impl Aux {
    /// Integer payload, if the value carries one.
    pub fn int(&self) -> Option<i64> {
        match self {
            Aux::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// One SSA definition.
#[derive(Debug, Clone)]
pub struct Value {
    pub op: Op,
    pub ty: TypeId,
    args: Range<u32>,
    pub aux: Aux,
    /// Number of argument slots and control slots referring to this value.
    pub uses: u32,
    pub block: BlockId,
    pub loc: Option<ValueLocation>,
}

impl Value {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Whether the value is only a memory state or has no result at all.
    pub fn is_memory(&self) -> bool {
        self.ty == TypeId::MEM
    }

    /// Whether the value needs a machine location.
    pub fn has_result(&self) -> bool {
        self.ty != TypeId::MEM && self.ty != TypeId::VOID
    }
}

/// How a block hands over control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// One successor, no control value.
    Plain,
    /// Two successors; taken when the control value is true, else falls to the second.
    If,
    /// No successors; control value is a `Ret`.
    Ret,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub values: Vec<ValueId>,
    pub control: Option<ValueId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Name carried over from the source IR, for diagnostics.
    pub name: String,
}

/// A stack-addressable variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    pub name: String,
    pub ty: TypeId,
}

/// A function in SSA form.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub params: Vec<TypeId>,
    pub result: TypeId,
    pub values: Vec<Value>,
    pub blocks: Vec<Block>,
    pub locals: Vec<Local>,
    pub entry: BlockId,
    arg_pool: Vec<ValueId>,
}

impl Func {
    pub fn new(name: impl Into<String>, params: Vec<TypeId>, result: TypeId) -> Self {
        Self {
            name: name.into(),
            params,
            result,
            values: Vec::new(),
            blocks: Vec::new(),
            locals: Vec::new(),
            entry: BlockId::new(0),
            arg_pool: Vec::new(),
        }
    }

    pub fn add_block(&mut self, kind: BlockKind, name: impl Into<String>) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(Block {
            kind,
            values: Vec::new(),
            control: None,
            preds: Vec::new(),
            succs: Vec::new(),
            name: name.into(),
        });
        id
    }

    /// Connect `from -> to`, keeping both edge lists in sync.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: TypeId) -> LocalId {
        let id = LocalId::new(self.locals.len());
        self.locals.push(Local {
            name: name.into(),
            ty,
        });
        id
    }

    /// Create a value without placing it in the block's value list.
    pub fn new_value(&mut self, block: BlockId, op: Op, ty: TypeId, args: &[ValueId], aux: Aux) -> ValueId {
        let start = self.arg_pool.len() as u32;
        self.arg_pool.extend_from_slice(args);
        let end = self.arg_pool.len() as u32;
        let id = ValueId::new(self.values.len());
        self.values.push(Value {
            op,
            ty,
            args: start..end,
            aux,
            uses: 0,
            block,
            loc: None,
        });
        id
    }

    /// Create a value and append it to `block`.
    pub fn append_value(&mut self, block: BlockId, op: Op, ty: TypeId, args: &[ValueId], aux: Aux) -> ValueId {
        let id = self.new_value(block, op, ty, args, aux);
        self.blocks[block.index()].values.push(id);
        id
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::new)
    }

    pub fn args(&self, id: ValueId) -> &[ValueId] {
        let range = &self.values[id.index()].args;
        &self.arg_pool[range.start as usize..range.end as usize]
    }

    pub fn arg(&self, id: ValueId, index: usize) -> ValueId {
        self.args(id)[index]
    }

    pub fn set_arg(&mut self, id: ValueId, index: usize, arg: ValueId) {
        let start = self.values[id.index()].args.start as usize;
        self.arg_pool[start + index] = arg;
    }

    /// Replace the whole argument list of a value.
    pub fn set_args(&mut self, id: ValueId, args: &[ValueId]) {
        let range = self.values[id.index()].args.clone();
        if range.len() == args.len() {
            self.arg_pool[range.start as usize..range.end as usize].copy_from_slice(args);
        } else {
            let start = self.arg_pool.len() as u32;
            self.arg_pool.extend_from_slice(args);
            self.values[id.index()].args = start..self.arg_pool.len() as u32;
        }
    }

    /// Operands that carry data, i.e. everything except the memory state.
    pub fn data_args(&self, id: ValueId) -> &[ValueId] {
        let value = self.value(id);
        if value.op == Op::Phi && value.is_memory() {
            return &[];
        }
        let args = self.args(id);
        if value.op.info().mem_arg {
            &args[..args.len().saturating_sub(1)]
        } else {
            args
        }
    }

    /// Value defining the memory state consumed by `id`, if any.
    pub fn mem_arg(&self, id: ValueId) -> Option<ValueId> {
        if self.value(id).op.info().mem_arg {
            self.args(id).last().copied()
        } else {
            None
        }
    }

    /// Phi values at the top of `block`.
    pub fn phis(&self, block: BlockId) -> impl Iterator<Item = ValueId> + '_ {
        self.blocks[block.index()]
            .values
            .iter()
            .copied()
            .take_while(|&v| self.value(v).op.is_block_prefix())
            .filter(|&v| self.value(v).op == Op::Phi)
    }

    /// Position of `pred` in `block`'s predecessor list.
    pub fn pred_index(&self, block: BlockId, pred: BlockId) -> Option<usize> {
        self.blocks[block.index()].preds.iter().position(|&p| p == pred)
    }

    /// Recompute use counts from argument and control slots.
    pub fn recount_uses(&mut self) {
        for value in &mut self.values {
            value.uses = 0;
        }
        for b in 0..self.blocks.len() {
            for i in 0..self.blocks[b].values.len() {
                let v = self.blocks[b].values[i];
                let range = self.values[v.index()].args.clone();
                for slot in range {
                    let arg = self.arg_pool[slot as usize];
                    self.values[arg.index()].uses += 1;
                }
            }
            if let Some(control) = self.blocks[b].control {
                self.values[control.index()].uses += 1;
                // A return is a control without a slot in the value list.
                if !self.blocks[b].values.contains(&control) {
                    let range = self.values[control.index()].args.clone();
                    for slot in range {
                        let arg = self.arg_pool[slot as usize];
                        self.values[arg.index()].uses += 1;
                    }
                }
            }
        }
    }

    /// Blocks in reverse postorder from the entry. Unreachable blocks are omitted.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Blocks in postorder from the entry.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![(self.entry, 0usize)];
        visited[self.entry.index()] = true;
        while let Some((block, next)) = stack.pop() {
            let succs = &self.blocks[block.index()].succs;
            if next < succs.len() {
                stack.push((block, next + 1));
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                order.push(block);
            }
        }
        order
    }

    /// Number of phi values in the function.
    pub fn phi_count(&self) -> usize {
        self.block_ids().map(|b| self.phis(b).count()).sum()
    }

    /// Render the function for `--dump-ssa` and test failure messages.
    pub fn dump(&self, types: &TypeRegistry) -> String {
        let mut out = String::new();
        let params: Vec<String> = self.params.iter().map(|&t| types.name(t)).collect();
        let _ = writeln!(out, "func {}({}) -> {}", self.name, params.join(", "), types.name(self.result));
        for (i, local) in self.locals.iter().enumerate() {
            let _ = writeln!(out, "  local l{}: {} ; {}", i, types.name(local.ty), local.name);
        }
        for block_id in self.reverse_postorder() {
            let block = self.block(block_id);
            let preds: Vec<String> = block.preds.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(out, "{}: ; {} preds [{}]", block_id, block.name, preds.join(" "));
            for &v in &block.values {
                let _ = writeln!(out, "  {}", self.format_value(v, types));
            }
            match (block.kind, block.control) {
                (BlockKind::Plain, _) => {
                    let _ = writeln!(out, "  jump {}", block.succs.first().map_or("?".into(), |b| b.to_string()));
                }
                (BlockKind::If, Some(c)) => {
                    let _ = writeln!(out, "  if {} -> {} {}", c, block.succs[0], block.succs[1]);
                }
                (BlockKind::Ret, Some(c)) => {
                    let _ = writeln!(out, "  {}", self.format_value(c, types));
                }
                (_, None) => {
                    let _ = writeln!(out, "  <missing control>");
                }
            }
        }
        out
    }

    pub fn format_value(&self, id: ValueId, types: &TypeRegistry) -> String {
        let value = self.value(id);
        let mut text = format!("{} = {} <{}>", id, value.op, types.name(value.ty));
        for arg in self.args(id) {
            let _ = write!(text, " {arg}");
        }
        match &value.aux {
            Aux::None => {}
            Aux::Int(v) => {
                let _ = write!(text, " [{v}]");
            }
            Aux::Sym(s) => {
                let _ = write!(text, " {{{s}}}");
            }
            Aux::Cond(c) => {
                let _ = write!(text, " [{c}]");
            }
            Aux::Local(l) => {
                let _ = write!(text, " {{{l}}}");
            }
            Aux::Call(call) => {
                let _ = write!(text, " {{{}}}", call.symbol);
            }
        }
        if let Some(loc) = value.loc {
            let _ = write!(text, " : {loc}");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Func {
        let mut f = Func::new("diamond", vec![], TypeId::VOID);
        let b0 = f.add_block(BlockKind::If, "entry");
        let b1 = f.add_block(BlockKind::Plain, "then");
        let b2 = f.add_block(BlockKind::Plain, "else");
        let b3 = f.add_block(BlockKind::Ret, "join");
        f.add_edge(b0, b1);
        f.add_edge(b0, b2);
        f.add_edge(b1, b3);
        f.add_edge(b2, b3);
        f
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(ValueId::new(12).to_string(), "v12");
        assert_eq!(BlockId::new(3).to_string(), "b3");
        assert_eq!(LocalId::new(1).to_string(), "l1");
    }

    #[test]
    fn reverse_postorder_visits_entry_first() {
        let f = diamond();
        let rpo = f.reverse_postorder();
        assert_eq!(rpo.first(), Some(&BlockId::new(0)));
        assert_eq!(rpo.last(), Some(&BlockId::new(3)));
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn args_live_in_shared_pool() {
        let mut f = diamond();
        let b0 = BlockId::new(0);
        let mem = f.append_value(b0, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let c = f.append_value(b0, Op::Const, TypeId::I64, &[], Aux::Int(1));
        let add = f.append_value(b0, Op::Add, TypeId::I64, &[c, c], Aux::None);
        let ret = f.new_value(BlockId::new(3), Op::Ret, TypeId::VOID, &[add, mem], Aux::None);
        f.block_mut(BlockId::new(3)).control = Some(ret);
        assert_eq!(f.args(add), &[c, c]);
        assert_eq!(f.data_args(ret), &[add]);
        assert_eq!(f.mem_arg(ret), Some(mem));

        f.set_args(add, &[c, c, c]);
        assert_eq!(f.args(add).len(), 3);
        f.recount_uses();
        assert_eq!(f.value(c).uses, 3);
        assert_eq!(f.value(mem).uses, 1);
    }
}
