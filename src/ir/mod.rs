// This module defines the pre-SSA intermediate representation handed to the backend by the
// lowering step, plus IrBuilder for constructing it programmatically in tests. An IrFunc is
// a list of named blocks, each holding typed nodes followed by exactly one terminator.
// Nodes are single-assignment temporaries that are only visible inside the block that
// defines them; everything that flows between blocks goes through mutable local slots via
// LoadLocal and StoreLocal. Locals whose address is taken, or whose type is an aggregate
// wider than two machine words, stay in memory; the rest are renamed into SSA values by
// ssa::builder. Aggregates wider than two words are never register values: a node of such
// a type stands for the address of its storage. IrFunc::validate checks the structural
// rules the SSA builder relies on before any conversion starts.

//! Block-structured input IR with mutable locals.

use std::fmt;

use crate::core::error::{CompileError, CompileResult};
use crate::core::types::{TypeId, TypeRegistry};
use crate::ssa::Cond;

id_type!(
    /// Index of a block in an [`IrFunc`]; block 0 is the entry.
    IrBlockId,
    "bb"
);
id_type!(
    /// Index of a node in an [`IrFunc`].
    NodeId,
    "%"
);
id_type!(
    /// Index of a local slot in an [`IrFunc`].
    IrLocalId,
    "$"
);

/// Arithmetic and logic operators. Signedness of `Div`, `Rem` and `Shr`
/// follows the operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn parse(text: &str) -> Option<BinOp> {
        Some(match text {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "mul" => BinOp::Mul,
            "div" => BinOp::Div,
            "rem" => BinOp::Rem,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            "xor" => BinOp::Xor,
            "shl" => BinOp::Shl,
            "shr" => BinOp::Shr,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

/// Integer width conversions; the node type is the target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conv {
    SignExt,
    ZeroExt,
    Trunc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Param(u32),
    Const(i64),
    Binary(BinOp, NodeId, NodeId),
    Unary(UnOp, NodeId),
    Cmp(Cond, NodeId, NodeId),
    Convert(Conv, NodeId),
    LoadLocal(IrLocalId),
    StoreLocal(IrLocalId, NodeId),
    AddrOf(IrLocalId),
    /// Load a value of the node's type from a pointer.
    Load(NodeId),
    Store { ptr: NodeId, value: NodeId },
    /// Pointer plus a constant byte offset.
    Offset(NodeId, i64),
    Global(String),
    Call {
        callee: String,
        args: Vec<NodeId>,
        /// Declared parameter count; later arguments are variadic.
        fixed: usize,
    },
    /// Aggregate built from its fields, in order.
    Aggregate(Vec<NodeId>),
    Extract(NodeId, u32),
    /// Zero `size_of(ty)` bytes at a pointer.
    Zero { ptr: NodeId, ty: TypeId },
    Copy(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ty: TypeId,
    pub kind: NodeKind,
}

impl Node {
    /// Operand nodes in order.
    pub fn operands(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Param(_)
            | NodeKind::Const(_)
            | NodeKind::LoadLocal(_)
            | NodeKind::AddrOf(_)
            | NodeKind::Global(_) => Vec::new(),
            NodeKind::Binary(_, a, b) | NodeKind::Cmp(_, a, b) => vec![*a, *b],
            NodeKind::Unary(_, a)
            | NodeKind::Convert(_, a)
            | NodeKind::StoreLocal(_, a)
            | NodeKind::Load(a)
            | NodeKind::Offset(a, _)
            | NodeKind::Extract(a, _)
            | NodeKind::Copy(a) => vec![*a],
            NodeKind::Zero { ptr, .. } => vec![*ptr],
            NodeKind::Store { ptr, value } => vec![*ptr, *value],
            NodeKind::Call { args, .. } => args.clone(),
            NodeKind::Aggregate(fields) => fields.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump(IrBlockId),
    Branch {
        cond: NodeId,
        then_block: IrBlockId,
        else_block: IrBlockId,
    },
    Ret(Option<NodeId>),
}

impl Terminator {
    pub fn successors(&self) -> Vec<IrBlockId> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Ret(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrBlock {
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub term: Option<Terminator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrLocal {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunc {
    pub name: String,
    pub params: Vec<TypeId>,
    pub result: TypeId,
    pub locals: Vec<IrLocal>,
    pub blocks: Vec<IrBlock>,
    pub nodes: Vec<Node>,
}

impl IrFunc {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn block(&self, id: IrBlockId) -> &IrBlock {
        &self.blocks[id.index()]
    }

    /// Locals that must live in memory: address taken, or too wide for registers.
    pub fn memory_locals(&self, types: &TypeRegistry) -> Vec<bool> {
        let mut in_memory: Vec<bool> = self
            .locals
            .iter()
            .map(|l| !types.is_register_value(l.ty))
            .collect();
        for node in &self.nodes {
            if let NodeKind::AddrOf(local) = node.kind {
                in_memory[local.index()] = true;
            }
        }
        in_memory
    }

    /// Predecessor lists derived from terminators.
    pub fn predecessors(&self) -> Vec<Vec<IrBlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(term) = &block.term {
                for succ in term.successors() {
                    if let Some(list) = preds.get_mut(succ.index()) {
                        list.push(IrBlockId::new(i));
                    }
                }
            }
        }
        preds
    }

    fn invalid(&self, reason: impl Into<String>) -> CompileError {
        CompileError::InvalidIr {
            func: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Check the structural rules the SSA builder depends on.
    pub fn validate(&self, types: &TypeRegistry) -> CompileResult<()> {
        if self.blocks.is_empty() {
            return Err(self.invalid("function has no blocks"));
        }
        for &ty in self.params.iter().chain(std::iter::once(&self.result)) {
            if !types.is_valid(ty) || ty == TypeId::MEM {
                return Err(self.invalid(format!("bad signature type {ty}")));
            }
        }
        if self.params.contains(&TypeId::VOID) {
            return Err(self.invalid("void parameter"));
        }

        let preds = self.predecessors();
        if !preds[0].is_empty() {
            return Err(self.invalid("entry block has predecessors"));
        }

        let mut defined_in = vec![None; self.nodes.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            for &node_id in &block.nodes {
                let node = self.nodes.get(node_id.index()).ok_or_else(|| {
                    self.invalid(format!("block {} refers to missing node {}", block.name, node_id))
                })?;
                for operand in node.operands() {
                    if defined_in.get(operand.index()).copied().flatten() != Some(b) {
                        return Err(self.invalid(format!(
                            "{} uses {} which is not defined earlier in block {}",
                            node_id, operand, block.name
                        )));
                    }
                }
                self.validate_node(node_id, node, types)?;
                if defined_in[node_id.index()].is_some() {
                    return Err(self.invalid(format!("{node_id} placed twice")));
                }
                defined_in[node_id.index()] = Some(b);
            }

            let term = block
                .term
                .as_ref()
                .ok_or_else(|| self.invalid(format!("block {} has no terminator", block.name)))?;
            for succ in term.successors() {
                if succ.index() >= self.blocks.len() {
                    return Err(self.invalid(format!("block {} jumps to missing {}", block.name, succ)));
                }
            }
            match term {
                Terminator::Branch { cond, .. } => {
                    if defined_in.get(cond.index()).copied().flatten() != Some(b)
                        || self.node(*cond).ty != TypeId::BOOL
                     {
                        return Err(self.invalid(format!("bad branch condition in block {}", block.name)));
                    }
                }
                Terminator::Ret(value) => match (value, self.result) {
                    (None, TypeId::VOID) => {}
                    (Some(v), ty) if ty != TypeId::VOID => {
                        if defined_in.get(v.index()).copied().flatten() != Some(b) || self.node(*v).ty != ty {
                            return Err(self.invalid(format!("bad return value in block {}", block.name)));
                        }
                    }
                    _ => return Err(self.invalid(format!("return arity mismatch in block {}", block.name))),
                },
                Terminator::Jump(_) => {}
            }
        }
        Ok(())
    }

    fn validate_node(&self, id: NodeId, node: &Node, types: &TypeRegistry) -> CompileResult<()> {
        if !types.is_valid(node.ty) || node.ty == TypeId::MEM {
            return Err(self.invalid(format!("{} has invalid type {}", id, node.ty)));
        }
        let ty_of = |n: NodeId| self.node(n).ty;
        let local_ok = |l: IrLocalId| l.index() < self.locals.len();
        let ok = match &node.kind {
            NodeKind::Param(i) => self.params.get(*i as usize) == Some(&node.ty),
            NodeKind::Const(_) => types.is_integer(node.ty),
            NodeKind::Binary(_, a, b) => {
                types.is_integer(node.ty) && ty_of(*a) == node.ty && ty_of(*b) == node.ty
            }
            NodeKind::Unary(_, a) => types.is_integer(node.ty) && ty_of(*a) == node.ty,
            NodeKind::Cmp(_, a, b) => {
                node.ty == TypeId::BOOL && types.is_integer(ty_of(*a)) && ty_of(*a) == ty_of(*b)
            }
            NodeKind::Convert(conv, a) => {
                let (from, to) = (types.size(ty_of(*a)), types.size(node.ty));
                types.is_integer(ty_of(*a))
                    && types.is_integer(node.ty)
                    && match conv {
                        Conv::SignExt | Conv::ZeroExt => from <= to,
                        Conv::Trunc => from >= to,
                    }
            }
            NodeKind::LoadLocal(l) => local_ok(*l) && self.locals[l.index()].ty == node.ty,
            NodeKind::StoreLocal(l, v) => {
                local_ok(*l) && node.ty == TypeId::VOID && self.locals[l.index()].ty == ty_of(*v)
            }
            NodeKind::AddrOf(l) => local_ok(*l) && node.ty == TypeId::PTR,
            NodeKind::Load(p) => ty_of(*p) == TypeId::PTR && node.ty != TypeId::VOID,
            NodeKind::Store { ptr, .. } => ty_of(*ptr) == TypeId::PTR && node.ty == TypeId::VOID,
            NodeKind::Offset(p, _) => ty_of(*p) == TypeId::PTR && node.ty == TypeId::PTR,
            NodeKind::Global(name) => !name.is_empty() && node.ty == TypeId::PTR,
            NodeKind::Call { callee, args, fixed } => !callee.is_empty() && *fixed <= args.len(),
            NodeKind::Aggregate(fields) => {
                types.field_count(node.ty) == fields.len()
                    && fields
                        .iter()
                        .enumerate()
                        .all(|(i, &f)| types.field_type(node.ty, i) == Some(ty_of(f)))
            }
            NodeKind::Extract(a, i) => types.field_type(ty_of(*a), *i as usize) == Some(node.ty),
            NodeKind::Zero { ptr, ty } => {
                ty_of(*ptr) == TypeId::PTR && node.ty == TypeId::VOID && types.is_valid(*ty)
            }
            NodeKind::Copy(a) => ty_of(*a) == node.ty,
        };
        if ok {
            Ok(())
        } else {
            Err(self.invalid(format!("ill-typed node {} ({:?})", id, node.kind)))
        }
    }
}

impl fmt::Display for IrFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func {} ({} params) -> {}", self.name, self.params.len(), self.result)?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "{}: ; {}", IrBlockId::new(i), block.name)?;
            for &n in &block.nodes {
                let node = self.node(n);
                writeln!(f, "  {} = {:?} <{}>", n, node.kind, node.ty)?;
            }
            writeln!(f, "  {:?}", block.term)?;
        }
        Ok(())
    }
}

/// Incremental constructor for [`IrFunc`].
///
/// Nodes are appended to the current block, selected with
/// [`IrBuilder::switch_to`]. The first block created is the entry.
pub struct IrBuilder {
    func: IrFunc,
    current: IrBlockId,
}

impl IrBuilder {
    pub fn new(name: &str, params: &[TypeId], result: TypeId) -> Self {
        Self {
            func: IrFunc {
                name: name.to_string(),
                params: params.to_vec(),
                result,
                locals: Vec::new(),
                blocks: Vec::new(),
                nodes: Vec::new(),
            },
            current: IrBlockId::new(0),
        }
    }

    pub fn local(&mut self, name: &str, ty: TypeId) -> IrLocalId {
        let id = IrLocalId::new(self.func.locals.len());
        self.func.locals.push(IrLocal {
            name: name.to_string(),
            ty,
        });
        id
    }

    pub fn block(&mut self, name: &str) -> IrBlockId {
        let id = IrBlockId::new(self.func.blocks.len());
        self.func.blocks.push(IrBlock {
            name: name.to_string(),
            nodes: Vec::new(),
            term: None,
        });
        id
    }

    pub fn switch_to(&mut self, block: IrBlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> IrBlockId {
        self.current
    }

    /// Append a node to the current block.
    pub fn push(&mut self, ty: TypeId, kind: NodeKind) -> NodeId {
        let id = NodeId::new(self.func.nodes.len());
        self.func.nodes.push(Node { ty, kind });
        self.func.blocks[self.current.index()].nodes.push(id);
        id
    }

    fn ty(&self, node: NodeId) -> TypeId {
        self.func.nodes[node.index()].ty
    }

    pub fn param(&mut self, index: u32) -> NodeId {
        let ty = self.func.params.get(index as usize).copied().unwrap_or(TypeId::VOID);
        self.push(ty, NodeKind::Param(index))
    }

    pub fn const_int(&mut self, ty: TypeId, value: i64) -> NodeId {
        self.push(ty, NodeKind::Const(value))
    }

    pub fn binary(&mut self, op: BinOp, a: NodeId, b: NodeId) -> NodeId {
        let ty = self.ty(a);
        self.push(ty, NodeKind::Binary(op, a, b))
    }

    pub fn unary(&mut self, op: UnOp, a: NodeId) -> NodeId {
        let ty = self.ty(a);
        self.push(ty, NodeKind::Unary(op, a))
    }

    pub fn cmp(&mut self, cond: Cond, a: NodeId, b: NodeId) -> NodeId {
        self.push(TypeId::BOOL, NodeKind::Cmp(cond, a, b))
    }

    pub fn convert(&mut self, conv: Conv, ty: TypeId, a: NodeId) -> NodeId {
        self.push(ty, NodeKind::Convert(conv, a))
    }

    pub fn load_local(&mut self, local: IrLocalId) -> NodeId {
        let ty = self.func.locals[local.index()].ty;
        self.push(ty, NodeKind::LoadLocal(local))
    }

    pub fn store_local(&mut self, local: IrLocalId, value: NodeId) -> NodeId {
        self.push(TypeId::VOID, NodeKind::StoreLocal(local, value))
    }

    pub fn addr_of(&mut self, local: IrLocalId) -> NodeId {
        self.push(TypeId::PTR, NodeKind::AddrOf(local))
    }

    pub fn load(&mut self, ty: TypeId, ptr: NodeId) -> NodeId {
        self.push(ty, NodeKind::Load(ptr))
    }

    pub fn store(&mut self, ptr: NodeId, value: NodeId) -> NodeId {
        self.push(TypeId::VOID, NodeKind::Store { ptr, value })
    }

    pub fn offset(&mut self, ptr: NodeId, bytes: i64) -> NodeId {
        self.push(TypeId::PTR, NodeKind::Offset(ptr, bytes))
    }

    pub fn global(&mut self, name: &str) -> NodeId {
        self.push(TypeId::PTR, NodeKind::Global(name.to_string()))
    }

    /// Call with every argument fixed.
    pub fn call(&mut self, ty: TypeId, callee: &str, args: &[NodeId]) -> NodeId {
        self.call_variadic(ty, callee, args, args.len())
    }

    pub fn call_variadic(&mut self, ty: TypeId, callee: &str, args: &[NodeId], fixed: usize) -> NodeId {
        self.push(
            ty,
            NodeKind::Call {
                callee: callee.to_string(),
                args: args.to_vec(),
                fixed,
            },
        )
    }

    pub fn aggregate(&mut self, ty: TypeId, fields: &[NodeId]) -> NodeId {
        self.push(ty, NodeKind::Aggregate(fields.to_vec()))
    }

    pub fn extract(&mut self, types: &TypeRegistry, value: NodeId, index: u32) -> NodeId {
        let ty = types
            .field_type(self.ty(value), index as usize)
            .unwrap_or(TypeId::VOID);
        self.push(ty, NodeKind::Extract(value, index))
    }

    pub fn zero(&mut self, ptr: NodeId, ty: TypeId) -> NodeId {
        self.push(TypeId::VOID, NodeKind::Zero { ptr, ty })
    }

    pub fn copy(&mut self, value: NodeId) -> NodeId {
        let ty = self.ty(value);
        self.push(ty, NodeKind::Copy(value))
    }

    pub fn jump(&mut self, target: IrBlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, cond: NodeId, then_block: IrBlockId, else_block: IrBlockId) {
        self.terminate(Terminator::Branch {
            cond,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, value: Option<NodeId>) {
        self.terminate(Terminator::Ret(value));
    }

    fn terminate(&mut self, term: Terminator) {
        self.func.blocks[self.current.index()].term = Some(term);
    }

    pub fn finish(self) -> IrFunc {
        self.func
    }
}
