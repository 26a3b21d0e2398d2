// This module turns an allocated SSA function into AArch64 machine code. By the time it runs
// every value carries its final location and the register allocator has already inserted
// the spill stores, reloads and rematerialized constants, so code generation is a single
// walk over the blocks in layout order that emits each value in place. The frame layout
// combines memory locals, the spill area and the largest outgoing argument area; leaf
// functions without any of them get no prologue at all. Narrow integers are kept canonical
// in their 64-bit registers (sign- or zero-extended according to their type): arithmetic
// that can leave stray upper bits is followed by an extension, and incoming arguments and
// call results are normalized where they enter the function because the calling
// convention leaves their upper bits unspecified. Word moves that must happen
// simultaneously (phi copies on an edge, call argument setup, returns and multi-word
// copies) go through the parallel-move sequencer with x17 as the cycle temporary; x16 is
// the bounce register for memory-to-memory moves and large immediates. Branches are
// emitted with a zero displacement and patched once every block has an offset; a
// displacement that does not fit its instruction field is reported as BranchOutOfRange.

//! Machine code emission for allocated functions.

use bumpalo::Bump;

use super::calling_convention::{expand_call, RET_REGS};
use super::encoder::{
    self, A64Cond, A64Inst, AddSubOp, BitfieldOp, DataOp2, LogicOp, MemSize, PairMode,
};
use super::regalloc::Allocation;
use crate::core::assembler::{Relocation, RelocationKind};
use crate::core::error::{CompileError, CompileResult};
use crate::core::parallel_move::{sequentialize, PartMove};
use crate::core::register_file::AsmReg;
use crate::core::types::{TypeId, TypeKind, TypeRegistry, WORD_SIZE};
use crate::core::value_assignment::{FrameLayout, PartLocation, StackSlot, ValueLocation, FRAME_RECORD_SIZE};
use crate::ssa::{Aux, BlockId, BlockKind, Func, Op, ValueId};

/// Scratch register for memory bounces and materialized immediates.
const SCRATCH: AsmReg = AsmReg::IP0;
/// Scratch register that breaks parallel-move cycles.
const CYCLE_TEMP: AsmReg = AsmReg::IP1;

/// Largest offset a 64-bit `ldp`/`stp` can address.
const MAX_PAIR_OFFSET: u32 = 504;

/// Emission routine for one operation.
type EmitFn<'a> = fn(&mut FunctionCodegen<'a>, ValueId) -> CompileResult<()>;

/// Code of one function before it is placed in an object file.
#[derive(Debug, Clone)]
pub struct CodegenOutput {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub frame_size: u32,
}

/// Branch instruction families, by displacement field width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// `b`: 26-bit word displacement.
    B26,
    /// `b.cond`: 19-bit word displacement.
    Cond19,
    /// `cbz`/`cbnz`: 19-bit word displacement.
    Cbz19,
}

impl BranchKind {
    /// Exclusive bound on the absolute byte displacement.
    pub fn range(self) -> i64 {
        match self {
            BranchKind::B26 => 1 << 27,
            BranchKind::Cond19 | BranchKind::Cbz19 => 1 << 20,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchKind::B26 => "b",
            BranchKind::Cond19 => "b.cond",
            BranchKind::Cbz19 => "cbz/cbnz",
        }
    }
}

/// A branch waiting for its target's offset.
#[derive(Debug, Clone, Copy)]
pub struct PendingBranch {
    /// Byte offset of the branch instruction.
    pub offset: u32,
    pub target: BlockId,
    pub inst: A64Inst,
    pub kind: BranchKind,
}

/// Rewrite the branch in `words` to jump `displacement` bytes.
pub fn patch_branch(words: &mut [u32], branch: &PendingBranch, displacement: i64, func: &str) -> CompileResult<()> {
    if displacement <= -branch.kind.range() || displacement >= branch.kind.range() {
        return Err(CompileError::BranchOutOfRange {
            func: func.to_string(),
            offset: branch.offset,
            displacement,
            kind: branch.kind.name(),
        });
    }
    let word = branch.inst.with_offset(displacement as i32).encode()?;
    words[(branch.offset / 4) as usize] = word;
    Ok(())
}

/// Split `bytes` starting at a word-aligned offset into naturally aligned
/// accesses, ascending. With `pairs`, 16-byte accesses are allowed while
/// their offset fits a pair instruction.
fn chunk_plan(bytes: u32, pairs: bool) -> Vec<(u32, u32)> {
    let mut plan = Vec::new();
    let mut off = 0;
    while off < bytes {
        let rest = bytes - off;
        let size = if pairs && rest >= 16 && off <= MAX_PAIR_OFFSET - 8 {
            16
        } else {
            [8, 4, 2, 1].into_iter().find(|&s| s <= rest && off % s == 0).unwrap_or(1)
        };
        plan.push((off, size));
        off += size;
    }
    plan
}

/// Generate code for `func` using the locations chosen by `alloc`.
pub fn generate(func: &Func, types: &TypeRegistry, alloc: &Allocation, arena: &Bump) -> CompileResult<CodegenOutput> {
    let locals: Vec<(u32, u32)> = func
        .locals
        .iter()
        .map(|l| (types.size(l.ty), types.align(l.ty)))
        .collect();
    let frame = FrameLayout::new(
        &locals,
        alloc.spill_size,
        alloc.outgoing_size,
        alloc.makes_calls(),
        alloc.signature.uses_stack(),
    );
    let codegen = FunctionCodegen {
        func,
        types,
        alloc,
        arena,
        frame,
        words: Vec::new(),
        block_offsets: vec![None; func.blocks.len()],
        pending: Vec::new(),
        relocations: Vec::new(),
    };
    codegen.finalize()
}

/// Per-function emission state.
pub struct FunctionCodegen<'a> {
    func: &'a Func,
    types: &'a TypeRegistry,
    alloc: &'a Allocation,
    arena: &'a Bump,
    frame: FrameLayout,
    words: Vec<u32>,
    block_offsets: Vec<Option<u32>>,
    pending: Vec<PendingBranch>,
    relocations: Vec<Relocation>,
}

impl<'a> FunctionCodegen<'a> {
    fn finalize(mut self) -> CompileResult<CodegenOutput> {
        self.emit_prologue()?;
        let layout = &self.alloc.layout;
        for (i, &b) in layout.iter().enumerate() {
            self.block_offsets[b.index()] = Some(self.offset());
            let next = layout.get(i + 1).copied();
            self.emit_block(b, next)?;
        }

        let pending = std::mem::take(&mut self.pending);
        for branch in &pending {
            let Some(target) = self.block_offsets[branch.target.index()] else {
                return Err(self.error(format!("branch to unplaced block {}", branch.target)));
            };
            let displacement = target as i64 - branch.offset as i64;
            patch_branch(&mut self.words, branch, displacement, &self.func.name)?;
        }

        log::debug!(
            "{}: {} instructions, frame {} bytes, {} relocations",
            self.func.name,
            self.words.len(),
            self.frame.frame_size(),
            self.relocations.len()
        );
        Ok(CodegenOutput {
            code: self.words.iter().flat_map(|w| w.to_le_bytes()).collect(),
            relocations: self.relocations,
            frame_size: self.frame.frame_size(),
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

    fn offset(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    fn emit(&mut self, inst: A64Inst) -> CompileResult<()> {
        self.words.push(inst.encode()?);
        Ok(())
    }

    fn emit_all(&mut self, insts: Vec<A64Inst>) -> CompileResult<()> {
        for inst in insts {
            self.emit(inst)?;
        }
        Ok(())
    }

    fn emit_branch(&mut self, inst: A64Inst, target: BlockId, kind: BranchKind) -> CompileResult<()> {
        self.pending.push(PendingBranch {
            offset: self.offset(),
            target,
            inst,
            kind,
        });
        self.emit(inst)
    }

    fn relocate(&mut self, symbol: &str, kind: RelocationKind) {
        self.relocations.push(Relocation {
            offset: self.offset(),
            symbol: symbol.to_string(),
            kind,
            addend: 0,
        });
    }

    // ---- locations -----------------------------------------------------------

    fn location(&self, v: ValueId) -> CompileResult<ValueLocation> {
        self.func
            .value(v)
            .loc
            .ok_or_else(|| self.error(format!("{v} has no location")))
    }

    fn regs(&self, v: ValueId) -> CompileResult<Vec<AsmReg>> {
        let loc = self.location(v)?;
        if !loc.is_reg() {
            return Err(self.error(format!("{v} is used from {loc}, not a register")));
        }
        Ok(loc.regs())
    }

    fn reg(&self, v: ValueId) -> CompileResult<AsmReg> {
        Ok(self.regs(v)?[0])
    }

    fn parts(&self, ty: TypeId) -> u32 {
        self.types.parts(ty)
    }

    // ---- frame ---------------------------------------------------------------

    fn emit_prologue(&mut self) -> CompileResult<()> {
        if !self.frame.has_frame_record {
            return Ok(());
        }
        self.emit(A64Inst::LoadStorePair {
            load: false,
            mode: PairMode::PreIndex,
            rt: AsmReg::FP,
            rt2: AsmReg::LR,
            rn: AsmReg::SP,
            offset: -(FRAME_RECORD_SIZE as i32),
        })?;
        self.emit(encoder::mov(AsmReg::FP, AsmReg::SP))?;
        self.adjust_sp(AddSubOp::Sub, self.frame.body_size)
    }

    fn emit_epilogue(&mut self) -> CompileResult<()> {
        if self.frame.has_frame_record {
            if self.frame.body_size > 0 {
                self.emit(encoder::mov(AsmReg::SP, AsmReg::FP))?;
            }
            self.emit(A64Inst::LoadStorePair {
                load: true,
                mode: PairMode::PostIndex,
                rt: AsmReg::FP,
                rt2: AsmReg::LR,
                rn: AsmReg::SP,
                offset: FRAME_RECORD_SIZE as i32,
            })?;
        }
        self.emit(encoder::ret())
    }

    fn adjust_sp(&mut self, op: AddSubOp, amount: u32) -> CompileResult<()> {
        if amount >= 1 << 24 {
            return Err(encoder::EncodingError::ImmediateOutOfRange {
                what: "frame size",
                value: amount as i64,
            }
            .into());
        }
        let (hi, lo) = ((amount >> 12) as u16, (amount & 0xFFF) as u16);
        if hi != 0 {
            self.emit(A64Inst::AddSubImm {
                op,
                rd: AsmReg::SP,
                rn: AsmReg::SP,
                imm12: hi,
                shift12: true,
            })?;
        }
        if lo != 0 {
            self.emit(A64Inst::AddSubImm {
                op,
                rd: AsmReg::SP,
                rn: AsmReg::SP,
                imm12: lo,
                shift12: false,
            })?;
        }
        Ok(())
    }

    /// `rd = rn + imm` for registers other than `sp` as destination.
    fn add_offset(&mut self, rd: AsmReg, rn: AsmReg, imm: i64) -> CompileResult<()> {
        if imm == 0 {
            if rd != rn {
                self.emit(encoder::mov(rd, rn))?;
            }
            return Ok(());
        }
        let magnitude = imm.unsigned_abs();
        let op = if imm < 0 { AddSubOp::Sub } else { AddSubOp::Add };
        if magnitude < 1 << 24 {
            let (hi, lo) = ((magnitude >> 12) as u16, (magnitude & 0xFFF) as u16);
            let mut src = rn;
            if hi != 0 {
                self.emit(A64Inst::AddSubImm {
                    op,
                    rd,
                    rn: src,
                    imm12: hi,
                    shift12: true,
                })?;
                src = rd;
            }
            if lo != 0 {
                self.emit(A64Inst::AddSubImm {
                    op,
                    rd,
                    rn: src,
                    imm12: lo,
                    shift12: false,
                })?;
            }
            return Ok(());
        }
        self.emit_all(encoder::mov_imm(SCRATCH, imm))?;
        // Register 31 reads as xzr in the shifted-register form.
        let base = if rn == AsmReg::SP {
            self.emit(encoder::mov(CYCLE_TEMP, AsmReg::SP))?;
            CYCLE_TEMP
        } else {
            rn
        };
        self.emit(encoder::add(rd, base, SCRATCH))
    }

    fn slot_address(&self, slot: StackSlot) -> (AsmReg, u32) {
        self.frame.address(slot)
    }

    // ---- moves ---------------------------------------------------------------

    fn move_part(&mut self, src: PartLocation, dst: PartLocation) -> CompileResult<()> {
        match (src, dst) {
            (PartLocation::Reg(a), PartLocation::Reg(b)) => {
                if a != b {
                    self.emit(encoder::mov(b, a))?;
                }
            }
            (PartLocation::Stack(s), PartLocation::Reg(b)) => {
                let (base, off) = self.slot_address(s);
                self.emit(encoder::ldr(b, base, off))?;
            }
            (PartLocation::Imm(k), PartLocation::Reg(b)) => self.emit_all(encoder::mov_imm(b, k))?,
            (PartLocation::Reg(a), PartLocation::Stack(t)) => {
                let (base, off) = self.slot_address(t);
                self.emit(encoder::str(a, base, off))?;
            }
            (PartLocation::Stack(s), PartLocation::Stack(t)) => {
                if s != t {
                    let (base, off) = self.slot_address(s);
                    self.emit(encoder::ldr(SCRATCH, base, off))?;
                    let (base, off) = self.slot_address(t);
                    self.emit(encoder::str(SCRATCH, base, off))?;
                }
            }
            (PartLocation::Imm(k), PartLocation::Stack(t)) => {
                let reg = if k == 0 {
                    AsmReg::XZR
                } else {
                    self.emit_all(encoder::mov_imm(SCRATCH, k))?;
                    SCRATCH
                };
                let (base, off) = self.slot_address(t);
                self.emit(encoder::str(reg, base, off))?;
            }
            (_, PartLocation::Imm(_)) => return Err(self.error(format!("move from {src} into an immediate"))),
        }
        Ok(())
    }

    fn emit_parallel(&mut self, moves: &[PartMove]) -> CompileResult<()> {
        let ordered = sequentialize(moves, PartLocation::Reg(CYCLE_TEMP), self.arena);
        for m in ordered {
            self.move_part(m.src, m.dst)?;
        }
        Ok(())
    }

    /// Re-extend a narrow integer in `r` to its canonical 64-bit form.
    fn normalize(&mut self, ty: TypeId, r: AsmReg) -> CompileResult<()> {
        match *self.types.kind(ty) {
            TypeKind::Int { bits, signed } if bits < 64 => {
                let inst = if signed {
                    encoder::sign_extend_bits(r, r, bits as u32)
                } else {
                    encoder::zero_extend_bits(r, r, bits as u32)
                };
                self.emit(inst)
            }
            TypeKind::Bool => self.emit(encoder::zero_extend_bits(r, r, 1)),
            _ => Ok(()),
        }
    }

    fn is_narrow_int(&self, ty: TypeId) -> bool {
        matches!(*self.types.kind(ty), TypeKind::Int { bits, .. } if bits < 64)
    }

    // ---- blocks --------------------------------------------------------------

    fn emit_block(&mut self, b: BlockId, next: Option<BlockId>) -> CompileResult<()> {
        let block = self.func.block(b);
        for &v in &block.values {
            self.emit_value(v)?;
        }

        let moves = self.alloc.edge_moves[b.index()].clone();
        match (block.kind, block.control) {
            (BlockKind::Plain, _) => {
                self.emit_parallel(&moves)?;
                let Some(&succ) = block.succs.first() else {
                    return Err(self.error(format!("{b} has no successor")));
                };
                if Some(succ) != next {
                    self.emit_branch(encoder::b(0), succ, BranchKind::B26)?;
                }
            }
            (BlockKind::If, Some(c)) => {
                if !moves.is_empty() {
                    return Err(self.error(format!("{b} ends in a branch but carries edge copies")));
                }
                let cond = self.reg(c)?;
                let (then, other) = (block.succs[0], block.succs[1]);
                if next == Some(then) {
                    self.emit_branch(encoder::cbz(cond, 0), other, BranchKind::Cbz19)?;
                } else {
                    self.emit_branch(encoder::cbnz(cond, 0), then, BranchKind::Cbz19)?;
                    if next != Some(other) {
                        self.emit_branch(encoder::b(0), other, BranchKind::B26)?;
                    }
                }
            }
            (BlockKind::Ret, Some(ret)) => self.emit_return(ret)?,
            (_, None) => return Err(self.error(format!("{b} has no control value"))),
        }
        Ok(())
    }

    fn emit_return(&mut self, ret: ValueId) -> CompileResult<()> {
        let mut moves = Vec::new();
        if let Some(&v) = self.func.data_args(ret).first() {
            let loc = self.location(v)?;
            for part in 0..self.parts(self.func.value(v).ty) {
                moves.push(PartMove::new(loc.part(part), PartLocation::Reg(RET_REGS[part as usize])));
            }
        }
        self.emit_parallel(&moves)?;
        self.emit_epilogue()
    }

    // ---- values --------------------------------------------------------------

    /// Emitter for each operation; `None` for values that never appear in a
    /// block body.
    fn emitter(op: Op) -> Option<EmitFn<'a>> {
        let emit: EmitFn<'a> = match op {
            Op::InitMem | Op::Phi | Op::ResultPtr => Self::emit_nothing,
            Op::Arg => Self::emit_arg,
            Op::Const => Self::emit_const,
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::SDiv
            | Op::UDiv
            | Op::SRem
            | Op::URem
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Shl
            | Op::LShr
            | Op::AShr => Self::emit_binary,
            Op::Neg | Op::Not => Self::emit_unary,
            Op::Cmp => Self::emit_cmp,
            Op::SignExt | Op::ZeroExt | Op::Trunc => Self::emit_convert,
            Op::Copy | Op::Pack | Op::Extract => Self::emit_copy,
            Op::LocalAddr => Self::emit_local_addr,
            Op::GlobalAddr => Self::emit_global_addr,
            Op::OffPtr => Self::emit_off_ptr,
            Op::Load => Self::emit_load,
            Op::Store => Self::emit_store,
            Op::Zero => Self::emit_zero,
            Op::Move => Self::emit_move,
            Op::Call => Self::emit_call,
            Op::StoreReg => Self::emit_store_reg,
            Op::LoadReg => Self::emit_load_reg,
            Op::Ret => return None,
        };
        Some(emit)
    }

    fn emit_value(&mut self, v: ValueId) -> CompileResult<()> {
        let op = self.func.value(v).op;
        log::trace!("{}: emit {}", self.func.name, self.func.format_value(v, self.types));
        match Self::emitter(op) {
            Some(emit) => emit(self, v),
            None => Err(self.error(format!("{v}: {op} inside a block body"))),
        }
    }

    fn emit_nothing(&mut self, _v: ValueId) -> CompileResult<()> {
        Ok(())
    }

    fn emit_off_ptr(&mut self, v: ValueId) -> CompileResult<()> {
        let rd = self.reg(v)?;
        let rn = self.reg(self.func.arg(v, 0))?;
        let offset = self.int_aux(v)?;
        self.add_offset(rd, rn, offset)
    }

    fn emit_arg(&mut self, v: ValueId) -> CompileResult<()> {
        let ty = self.func.value(v).ty;
        if !self.is_narrow_int(ty) && ty != TypeId::BOOL {
            return Ok(());
        }
        match self.location(v)? {
            ValueLocation::Reg(r) => self.normalize(ty, r),
            // Canonicalize the caller's slot so later word loads see a clean value.
            ValueLocation::Stack(slot) => {
                let (base, off) = self.slot_address(slot);
                let size = MemSize::for_bytes(self.types.size(ty));
                self.emit(encoder::load(size, self.types.is_signed(ty), SCRATCH, base, off))?;
                self.emit(encoder::str(SCRATCH, base, off))
            }
            _ => Ok(()),
        }
    }

    fn emit_const(&mut self, v: ValueId) -> CompileResult<()> {
        match self.location(v)? {
            ValueLocation::Reg(r) => {
                let k = self.int_aux(v)?;
                self.emit_all(encoder::mov_imm(r, k))
            }
            _ => Ok(()),
        }
    }

    fn emit_binary(&mut self, v: ValueId) -> CompileResult<()> {
        let value = self.func.value(v);
        let (op, ty) = (value.op, value.ty);
        let rd = self.reg(v)?;
        let a = self.reg(self.func.arg(v, 0))?;
        let b = self.reg(self.func.arg(v, 1))?;
        let inst = match op {
            Op::Add => encoder::add(rd, a, b),
            Op::Sub => encoder::sub(rd, a, b),
            Op::Mul => encoder::mul(rd, a, b),
            Op::SDiv => encoder::data2(DataOp2::SDiv, rd, a, b),
            Op::UDiv => encoder::data2(DataOp2::UDiv, rd, a, b),
            Op::SRem | Op::URem => {
                let div = if op == Op::SRem { DataOp2::SDiv } else { DataOp2::UDiv };
                self.emit(encoder::data2(div, SCRATCH, a, b))?;
                encoder::msub(rd, SCRATCH, b, a)
            }
            Op::And => encoder::logical(LogicOp::And, rd, a, b),
            Op::Or => encoder::logical(LogicOp::Orr, rd, a, b),
            Op::Xor => encoder::logical(LogicOp::Eor, rd, a, b),
            Op::Shl => encoder::data2(DataOp2::Lslv, rd, a, b),
            Op::LShr => encoder::data2(DataOp2::Lsrv, rd, a, b),
            Op::AShr => encoder::data2(DataOp2::Asrv, rd, a, b),
            _ => return Err(self.error(format!("{v}: {op} is not binary"))),
        };
        self.emit(inst)?;
        if matches!(op, Op::Add | Op::Sub | Op::Mul | Op::SDiv | Op::Shl) {
            self.normalize(ty, rd)?;
        }
        Ok(())
    }

    fn emit_unary(&mut self, v: ValueId) -> CompileResult<()> {
        let value = self.func.value(v);
        let (op, ty) = (value.op, value.ty);
        let rd = self.reg(v)?;
        let a = self.reg(self.func.arg(v, 0))?;
        let inst = if op == Op::Neg {
            encoder::neg(rd, a)
        } else {
            encoder::mvn(rd, a)
        };
        self.emit(inst)?;
        self.normalize(ty, rd)
    }

    fn emit_cmp(&mut self, v: ValueId) -> CompileResult<()> {
        let Aux::Cond(cond) = self.func.value(v).aux else {
            return Err(self.error(format!("{v}: compare without a condition")));
        };
        let rd = self.reg(v)?;
        let a = self.reg(self.func.arg(v, 0))?;
        let b = self.reg(self.func.arg(v, 1))?;
        self.emit(encoder::cmp(a, b))?;
        self.emit(encoder::cset(rd, A64Cond::from_cond(cond)))
    }

    /// Registers already hold narrow values sign or zero extended by their own
    /// signedness, so widening only emits code when the extension kind differs.
    fn emit_convert(&mut self, v: ValueId) -> CompileResult<()> {
        let value = self.func.value(v);
        let (op, ty) = (value.op, value.ty);
        let src = self.func.arg(v, 0);
        let src_ty = self.func.value(src).ty;
        let src_bits = self.types.bits(src_ty);
        let src_signed = self.types.is_signed(src_ty);
        let rd = self.reg(v)?;
        let rn = self.reg(src)?;
        let extend = match op {
            Op::SignExt if src_bits < 64 && !src_signed => Some(encoder::sign_extend_bits(rd, rn, src_bits)),
            Op::ZeroExt if src_bits < 64 && src_signed => Some(encoder::zero_extend_bits(rd, rn, src_bits)),
            _ => None,
        };
        match extend {
            Some(inst) => self.emit(inst)?,
            None if rd != rn => self.emit(encoder::mov(rd, rn))?,
            None => {}
        }
        let renormalize = match op {
            Op::SignExt => !self.types.is_signed(ty),
            Op::ZeroExt => false,
            _ => true,
        };
        if renormalize {
            self.normalize(ty, rd)
        } else {
            Ok(())
        }
    }

    /// `Copy`, `Pack` and `Extract` are pure word moves.
    fn emit_copy(&mut self, v: ValueId) -> CompileResult<()> {
        let value = self.func.value(v);
        let dst = self.location(v)?;
        let mut moves = Vec::new();
        match value.op {
            Op::Copy => {
                let src = self.location(self.func.arg(v, 0))?;
                for part in 0..self.parts(value.ty) {
                    moves.push(PartMove::new(src.part(part), dst.part(part)));
                }
            }
            Op::Pack => {
                for (part, &field) in self.func.args(v).iter().enumerate() {
                    let src = self.location(field)?;
                    moves.push(PartMove::new(src.part(0), dst.part(part as u32)));
                }
            }
            _ => {
                let src = self.location(self.func.arg(v, 0))?;
                let index = self.int_aux(v)? as u32;
                moves.push(PartMove::new(src.part(index), dst.part(0)));
            }
        }
        self.emit_parallel(&moves)
    }

    fn emit_local_addr(&mut self, v: ValueId) -> CompileResult<()> {
        let Aux::Local(local) = self.func.value(v).aux else {
            return Err(self.error(format!("{v}: local address without a local")));
        };
        let rd = self.reg(v)?;
        let (base, off) = self.frame.local_address(local.index());
        self.add_offset(rd, base, off as i64)
    }

    fn emit_global_addr(&mut self, v: ValueId) -> CompileResult<()> {
        let Aux::Sym(symbol) = &self.func.value(v).aux else {
            return Err(self.error(format!("{v}: global address without a symbol")));
        };
        let rd = self.reg(v)?;
        self.relocate(symbol, RelocationKind::AdrPage21);
        self.emit(A64Inst::Adrp { rd, pages: 0 })?;
        self.relocate(symbol, RelocationKind::AddLo12);
        self.emit(encoder::add_imm(rd, rd, 0))
    }

    fn emit_load(&mut self, v: ValueId) -> CompileResult<()> {
        let ty = self.func.value(v).ty;
        let size = self.types.size(ty);
        let regs = self.regs(v)?;
        let ptr = self.reg(self.func.arg(v, 0))?;
        if regs.len() == 2 && size == 2 * WORD_SIZE {
            return self.emit(encoder::ldp(regs[0], regs[1], ptr, 0));
        }
        if regs.len() == 1 && size.is_power_of_two() {
            let signed = self.types.is_signed(ty);
            return self.emit(encoder::load(MemSize::for_bytes(size), signed, regs[0], ptr, 0));
        }

        // The first chunk may overwrite the pointer.
        let base = if regs.contains(&ptr) {
            self.emit(encoder::mov(CYCLE_TEMP, ptr))?;
            CYCLE_TEMP
        } else {
            ptr
        };
        for (part, &rd) in regs.iter().enumerate() {
            let start = part as u32 * WORD_SIZE;
            let bytes = (size - start).min(WORD_SIZE);
            for (i, (off, chunk)) in chunk_plan(bytes, false).into_iter().enumerate() {
                let size = MemSize::for_bytes(chunk);
                if i == 0 {
                    self.emit(encoder::load(size, false, rd, base, start + off))?;
                } else {
                    self.emit(encoder::load(size, false, SCRATCH, base, start + off))?;
                    self.emit(A64Inst::AddSubReg {
                        op: AddSubOp::Add,
                        rd,
                        rn: rd,
                        rm: SCRATCH,
                        shift: (off * 8) as u8,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn emit_store(&mut self, v: ValueId) -> CompileResult<()> {
        let ptr = self.reg(self.func.arg(v, 0))?;
        let stored = self.func.arg(v, 1);
        let size = self.types.size(self.func.value(stored).ty);
        let regs = self.regs(stored)?;
        if regs.len() == 2 && size == 2 * WORD_SIZE {
            return self.emit(encoder::stp(regs[0], regs[1], ptr, 0));
        }
        if regs.len() == 1 && size.is_power_of_two() {
            return self.emit(encoder::store(MemSize::for_bytes(size), regs[0], ptr, 0));
        }

        for (part, &rs) in regs.iter().enumerate() {
            let start = part as u32 * WORD_SIZE;
            let bytes = (size - start).min(WORD_SIZE);
            for (off, chunk) in chunk_plan(bytes, false) {
                let size = MemSize::for_bytes(chunk);
                let src = if off == 0 {
                    rs
                } else {
                    self.emit(A64Inst::Bitfield {
                        op: BitfieldOp::Ubfm,
                        rd: SCRATCH,
                        rn: rs,
                        immr: (off * 8) as u8,
                        imms: 63,
                    })?;
                    SCRATCH
                };
                self.emit(encoder::store(size, src, ptr, start + off))?;
            }
        }
        Ok(())
    }

    fn emit_zero(&mut self, v: ValueId) -> CompileResult<()> {
        let ptr = self.reg(self.func.arg(v, 0))?;
        let bytes = self.int_aux(v)? as u32;
        for (off, chunk) in chunk_plan(bytes, true) {
            if chunk == 16 {
                self.emit(encoder::stp(AsmReg::XZR, AsmReg::XZR, ptr, off as i32))?;
            } else {
                self.emit(encoder::store(MemSize::for_bytes(chunk), AsmReg::XZR, ptr, off))?;
            }
        }
        Ok(())
    }

    fn emit_move(&mut self, v: ValueId) -> CompileResult<()> {
        let dst = self.reg(self.func.arg(v, 0))?;
        let src = self.reg(self.func.arg(v, 1))?;
        if dst == src {
            return Ok(());
        }
        let bytes = self.int_aux(v)? as u32;
        for (off, chunk) in chunk_plan(bytes, true) {
            if chunk == 16 {
                self.emit(encoder::ldp(SCRATCH, CYCLE_TEMP, src, off as i32))?;
                self.emit(encoder::stp(SCRATCH, CYCLE_TEMP, dst, off as i32))?;
            } else {
                let size = MemSize::for_bytes(chunk);
                self.emit(encoder::load(size, false, SCRATCH, src, off))?;
                self.emit(encoder::store(size, SCRATCH, dst, off))?;
            }
        }
        Ok(())
    }

    fn emit_call(&mut self, v: ValueId) -> CompileResult<()> {
        let Aux::Call(info) = &self.func.value(v).aux else {
            return Err(self.error(format!("{v}: call without a callee")));
        };
        let layout = expand_call(self.func, self.types, v)?;

        // Stack arguments first, while every source register is intact.
        let mut reg_moves = Vec::with_capacity(layout.parts.len());
        for arg in &layout.parts {
            let src = self.location(arg.value)?.part(arg.part);
            match arg.dest {
                PartLocation::Stack(_) => self.move_part(src, arg.dest)?,
                dest => reg_moves.push(PartMove::new(src, dest)),
            }
        }
        self.emit_parallel(&reg_moves)?;

        self.relocate(&info.symbol, RelocationKind::Call26);
        self.emit(encoder::bl(0))?;

        let ty = self.func.value(v).ty;
        if let Some(ValueLocation::Reg(r)) = layout.result {
            self.normalize(ty, r)?;
        }
        Ok(())
    }

    fn emit_store_reg(&mut self, v: ValueId) -> CompileResult<()> {
        let src = self.location(self.func.arg(v, 0))?;
        let ValueLocation::Stack(slot) = self.location(v)? else {
            return Err(self.error(format!("spill {v} has no stack slot")));
        };
        let (base, off) = self.slot_address(slot);
        match src {
            ValueLocation::RegPair(lo, hi) if off <= MAX_PAIR_OFFSET => self.emit(encoder::stp(lo, hi, base, off as i32)),
            _ => {
                for part in 0..self.parts(self.func.value(v).ty) {
                    self.move_part(src.part(part), PartLocation::Stack(slot.word(part)))?;
                }
                Ok(())
            }
        }
    }

    fn emit_load_reg(&mut self, v: ValueId) -> CompileResult<()> {
        let dst = self.location(v)?;
        let src = self.location(self.func.arg(v, 0))?;
        match (src, dst) {
            (ValueLocation::Stack(slot), ValueLocation::RegPair(lo, hi)) => {
                let (base, off) = self.slot_address(slot);
                if off <= MAX_PAIR_OFFSET {
                    return self.emit(encoder::ldp(lo, hi, base, off as i32));
                }
                self.move_part(src.part(0), dst.part(0))?;
                self.move_part(src.part(1), dst.part(1))
            }
            (ValueLocation::Stack(_), ValueLocation::Reg(_)) => self.move_part(src.part(0), dst.part(0)),
            _ => Err(self.error(format!("reload {v} from {src} into {dst}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::regalloc::allocate;
    use crate::core::register_file::RegBitSet;

    fn add_function() -> Func {
        let mut f = Func::new("add", vec![TypeId::I64, TypeId::I64], TypeId::I64);
        let entry = f.add_block(BlockKind::Ret, "entry");
        let mem = f.append_value(entry, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let a = f.append_value(entry, Op::Arg, TypeId::I64, &[], Aux::Int(0));
        let b = f.append_value(entry, Op::Arg, TypeId::I64, &[], Aux::Int(1));
        let sum = f.append_value(entry, Op::Add, TypeId::I64, &[a, b], Aux::None);
        let ret = f.new_value(entry, Op::Ret, TypeId::VOID, &[sum, mem], Aux::None);
        f.block_mut(entry).control = Some(ret);
        f.recount_uses();
        f
    }

    #[test]
    fn test_add_is_one_instruction_and_ret() {
        let types = TypeRegistry::new();
        let arena = Bump::new();
        let mut f = add_function();
        let alloc = allocate(&mut f, &types, RegBitSet::first_n(16)).unwrap();
        let out = generate(&f, &types, &alloc, &arena).unwrap();
        let expected: Vec<u8> = [
            encoder::add(AsmReg::X0, AsmReg::X0, AsmReg::X1).encode().unwrap(),
            encoder::ret().encode().unwrap(),
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
        assert_eq!(out.code, expected);
        assert_eq!(out.frame_size, 0);
        assert!(out.relocations.is_empty());
    }

    #[test]
    fn test_out_of_range_branch_is_rejected() {
        let mut words = vec![0u32; 2];
        let branch = PendingBranch {
            offset: 4,
            target: BlockId::new(0),
            inst: encoder::cbnz(AsmReg::X0, 0),
            kind: BranchKind::Cbz19,
        };
        let err = patch_branch(&mut words, &branch, 1 << 21, "far").unwrap_err();
        assert!(matches!(err, CompileError::BranchOutOfRange { kind: "cbz/cbnz", .. }));

        patch_branch(&mut words, &branch, -4, "near").unwrap();
        assert_eq!(A64Inst::decode(words[1]).unwrap(), encoder::cbnz(AsmReg::X0, -4));
    }

    #[test]
    fn test_chunk_plan_uses_aligned_accesses() {
        assert_eq!(chunk_plan(12, false), vec![(0, 8), (8, 4)]);
        assert_eq!(chunk_plan(7, false), vec![(0, 4), (4, 2), (6, 1)]);
        assert_eq!(chunk_plan(40, true), vec![(0, 16), (16, 16), (32, 8)]);
    }

    #[test]
    fn test_call_records_relocation_and_frame() {
        let types = TypeRegistry::new();
        let arena = Bump::new();
        let mut f = Func::new("caller", vec![], TypeId::I64);
        let entry = f.add_block(BlockKind::Ret, "entry");
        let mem = f.append_value(entry, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let info = crate::ssa::CallInfo {
            symbol: "callee".into(),
            fixed_args: 0,
            indirect_result: false,
        };
        let call = f.append_value(entry, Op::Call, TypeId::I64, &[mem], Aux::Call(Box::new(info)));
        let ret = f.new_value(entry, Op::Ret, TypeId::VOID, &[call, call], Aux::None);
        f.block_mut(entry).control = Some(ret);
        f.recount_uses();

        let alloc = allocate(&mut f, &types, RegBitSet::first_n(16)).unwrap();
        let out = generate(&f, &types, &alloc, &arena).unwrap();
        assert_eq!(out.frame_size, 16);
        assert_eq!(out.relocations.len(), 1);
        assert_eq!(out.relocations[0].kind, RelocationKind::Call26);
        assert_eq!(out.relocations[0].symbol, "callee");
        // stp, mov fp, bl, ldp, ret
        assert_eq!(out.code.len(), 5 * 4);
        assert_eq!(out.relocations[0].offset, 8);
    }
}
