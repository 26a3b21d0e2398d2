// This module defines where SSA values live once register allocation is done and how
// stack-resident locations map onto the function's frame. ValueLocation is the tagged
// location every value carries after allocation: a single register, a register pair for
// two-word values, a stack slot, or an immediate for rematerializable constants.
// StackSlot distinguishes the three stack areas the backend addresses: spill slots in the
// current frame, incoming arguments in the caller's outgoing area, and the outgoing area
// used to pass arguments to callees. FrameLayout assigns offsets to locals and spill slots,
// rounds the frame to the 16-byte stack alignment, and turns any slot into a base
// register plus unsigned offset for the code generator.

//! Value locations and frame layout.

use std::fmt;

use super::register_file::AsmReg;
use super::types::{align_to, WORD_SIZE};

/// Required alignment of the stack pointer at call boundaries.
pub const STACK_ALIGN: u32 = 16;

/// Bytes occupied by the saved frame pointer and link register.
pub const FRAME_RECORD_SIZE: u32 = 16;

/// A stack-resident location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackSlot {
    /// Byte offset inside this frame's spill area.
    Spill(u32),
    /// Byte offset inside the caller's outgoing argument area.
    Incoming(u32),
    /// Byte offset inside this frame's outgoing argument area.
    Outgoing(u32),
}

impl StackSlot {
    /// Slot holding word `part` of a multi-word value stored here.
    pub fn word(self, part: u32) -> StackSlot {
        let delta = part * WORD_SIZE;
        match self {
            StackSlot::Spill(o) => StackSlot::Spill(o + delta),
            StackSlot::Incoming(o) => StackSlot::Incoming(o + delta),
            StackSlot::Outgoing(o) => StackSlot::Outgoing(o + delta),
        }
    }
}

impl fmt::Display for StackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackSlot::Spill(o) => write!(f, "spill+{o}"),
            StackSlot::Incoming(o) => write!(f, "in+{o}"),
            StackSlot::Outgoing(o) => write!(f, "out+{o}"),
        }
    }
}

/// Final location of an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    Reg(AsmReg),
    /// Two-word value: low word first.
    RegPair(AsmReg, AsmReg),
    Stack(StackSlot),
    Imm(i64),
}

impl ValueLocation {
    /// Location of one machine word of the value.
    pub fn part(self, part: u32) -> PartLocation {
        match (self, part) {
            (ValueLocation::Reg(r), 0) => PartLocation::Reg(r),
            (ValueLocation::RegPair(lo, _), 0) => PartLocation::Reg(lo),
            (ValueLocation::RegPair(_, hi), 1) => PartLocation::Reg(hi),
            (ValueLocation::Stack(slot), p) => PartLocation::Stack(slot.word(p)),
            (ValueLocation::Imm(v), 0) => PartLocation::Imm(v),
            (loc, p) => unreachable!("{loc} has no part {p}"),
        }
    }

    /// Registers held by this location.
    pub fn regs(self) -> Vec<AsmReg> {
        match self {
            ValueLocation::Reg(r) => vec![r],
            ValueLocation::RegPair(lo, hi) => vec![lo, hi],
            _ => Vec::new(),
        }
    }

    pub fn is_reg(self) -> bool {
        matches!(self, ValueLocation::Reg(_) | ValueLocation::RegPair(..))
    }

    /// Build a register location from per-part registers.
    pub fn from_regs(regs: &[AsmReg]) -> Option<ValueLocation> {
        match regs {
            [r] => Some(ValueLocation::Reg(*r)),
            [lo, hi] => Some(ValueLocation::RegPair(*lo, *hi)),
            _ => None,
        }
    }
}

impl fmt::Display for ValueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueLocation::Reg(r) => write!(f, "{r}"),
            ValueLocation::RegPair(lo, hi) => write!(f, "{lo}:{hi}"),
            ValueLocation::Stack(s) => write!(f, "[{s}]"),
            ValueLocation::Imm(v) => write!(f, "#{v}"),
        }
    }
}

/// Location of a single machine word; the unit moved by parallel copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartLocation {
    Reg(AsmReg),
    Stack(StackSlot),
    Imm(i64),
}

impl fmt::Display for PartLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartLocation::Reg(r) => write!(f, "{r}"),
            PartLocation::Stack(s) => write!(f, "[{s}]"),
            PartLocation::Imm(v) => write!(f, "#{v}"),
        }
    }
}

/// Stack frame of one function.
///
/// ```text
///   fp + 16 + n   incoming stack arguments
///   fp            saved fp, lr
///   ...           spill slots
///   ...           locals
///   sp            outgoing arguments
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    /// Size of the outgoing argument area.
    pub outgoing_size: u32,
    /// Offset of each local inside the locals area.
    pub local_offsets: Vec<u32>,
    pub locals_size: u32,
    pub spill_size: u32,
    /// Bytes subtracted from `sp` after the frame record is pushed.
    pub body_size: u32,
    /// Whether the prologue saves `fp`/`lr`.
    pub has_frame_record: bool,
}

impl FrameLayout {
    /// Lay out locals (size, align) and the spill and outgoing areas.
    pub fn new(
        locals: &[(u32, u32)],
        spill_size: u32,
        outgoing_size: u32,
        makes_calls: bool,
        uses_incoming_stack: bool,
    ) -> Self {
        let mut local_offsets = Vec::with_capacity(locals.len());
        let mut locals_size = 0;
        for &(size, align) in locals {
            locals_size = align_to(locals_size, align.max(1));
            local_offsets.push(locals_size);
            locals_size += size;
        }
        let locals_size = align_to(locals_size, WORD_SIZE);
        let outgoing_size = align_to(outgoing_size, STACK_ALIGN);
        let body_size = align_to(outgoing_size + locals_size + spill_size, STACK_ALIGN);
        let has_frame_record = makes_calls || body_size > 0 || uses_incoming_stack;

        Self {
            outgoing_size,
            local_offsets,
            locals_size,
            spill_size,
            body_size,
            has_frame_record,
        }
    }

    /// Total bytes the function moves the stack pointer by.
    pub fn frame_size(&self) -> u32 {
        self.body_size + if self.has_frame_record { FRAME_RECORD_SIZE } else { 0 }
    }

    /// Base register and unsigned byte offset of a stack slot.
    pub fn address(&self, slot: StackSlot) -> (AsmReg, u32) {
        match slot {
            StackSlot::Outgoing(o) => (AsmReg::SP, o),
            StackSlot::Spill(o) => (AsmReg::SP, self.outgoing_size + self.locals_size + o),
            StackSlot::Incoming(o) => (AsmReg::FP, FRAME_RECORD_SIZE + o),
        }
    }

    /// Base register and offset of local `index`.
    pub fn local_address(&self, index: usize) -> (AsmReg, u32) {
        (AsmReg::SP, self.outgoing_size + self.local_offsets[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_frame_is_empty() {
        let frame = FrameLayout::new(&[], 0, 0, false, false);
        assert_eq!(frame.frame_size(), 0);
        assert!(!frame.has_frame_record);
    }

    #[test]
    fn frame_areas_are_stacked() {
        let frame = FrameLayout::new(&[(4, 4), (8, 8)], 16, 8, true, false);
        assert_eq!(frame.local_offsets, vec![0, 8]);
        assert_eq!(frame.locals_size, 16);
        assert_eq!(frame.outgoing_size, 16);
        assert_eq!(frame.body_size, 48);
        assert_eq!(frame.frame_size(), 64);
        assert_eq!(frame.address(StackSlot::Spill(8)), (AsmReg::SP, 40));
        assert_eq!(frame.local_address(1), (AsmReg::SP, 24));
        assert_eq!(frame.address(StackSlot::Incoming(0)), (AsmReg::FP, 16));
    }

    #[test]
    fn pair_parts() {
        let loc = ValueLocation::RegPair(AsmReg::new(2), AsmReg::new(3));
        assert_eq!(loc.part(1), PartLocation::Reg(AsmReg::new(3)));
        let slot = ValueLocation::Stack(StackSlot::Spill(16));
        assert_eq!(slot.part(1), PartLocation::Stack(StackSlot::Spill(24)));
    }
}
