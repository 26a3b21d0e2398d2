//! Register bookkeeping for the allocator.
//!
//! This module implements the RegisterFile that tracks, for every physical
//! register, which SSA value currently occupies it and whether that value
//! already has a copy in memory. The allocator asks it for free registers,
//! locks the operands of the instruction being allocated, and picks eviction
//! candidates among the remaining occupants.

use std::fmt;

use crate::ssa::ValueId;

/// Number of general-purpose register encodings (x0-x30 plus 31).
pub const NUM_GP_REGS: usize = 32;

/// A general-purpose AArch64 register.
///
/// Encoding 31 means `sp` or `xzr` depending on the instruction field; the
/// two constants below name both readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg(u8);

impl AsmReg {
    pub const X0: AsmReg = AsmReg(0);
    pub const X1: AsmReg = AsmReg(1);
    /// Indirect result location register.
    pub const X8: AsmReg = AsmReg(8);
    /// First intra-procedure-call scratch register, never allocated.
    pub const IP0: AsmReg = AsmReg(16);
    /// Second scratch register, reserved for breaking move cycles.
    pub const IP1: AsmReg = AsmReg(17);
    pub const FP: AsmReg = AsmReg(29);
    pub const LR: AsmReg = AsmReg(30);
    pub const SP: AsmReg = AsmReg(31);
    pub const XZR: AsmReg = AsmReg(31);

    pub const fn new(id: u8) -> Self {
        Self(id & 31)
    }

    pub const fn id(self) -> u8 {
        self.0
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            29 => write!(f, "fp"),
            30 => write!(f, "lr"),
            31 => write!(f, "sp"),
            n => write!(f, "x{n}"),
        }
    }
}

/// Bit set over the 32 register encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet(u32);

impl RegBitSet {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Registers `x0` through `x{count-1}`.
    pub const fn first_n(count: u8) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        self.0 & (1 << reg.id()) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        self.0 |= 1 << reg.id();
    }

    pub fn clear(&mut self, reg: AsmReg) {
        self.0 &= !(1 << reg.id());
    }

    pub fn union(self, other: RegBitSet) -> RegBitSet {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: RegBitSet) -> RegBitSet {
        Self(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered register in the set.
    pub fn first(&self) -> Option<AsmReg> {
        if self.0 == 0 {
            None
        } else {
            Some(AsmReg::new(self.0.trailing_zeros() as u8))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..NUM_GP_REGS as u8)
            .map(AsmReg::new)
            .filter(move |&r| self.contains(r))
    }
}

/// What a register currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    /// Value as named by the original program.
    pub value: ValueId,
    /// Value that defined this register copy (the value itself, a reload or a
    /// rematerialization). Uses of `value` are rewritten to `alias`.
    pub alias: ValueId,
    /// Which word of a two-word value this register holds.
    pub part: u8,
}

/// Per-function register state.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    allocatable: RegBitSet,
    used: RegBitSet,
    /// Registers that must not be evicted while the current instruction is
    /// being allocated.
    locked: RegBitSet,
    /// Registers whose occupant has no copy in memory yet.
    dirty: RegBitSet,
    occupants: [Option<Occupant>; NUM_GP_REGS],
}

impl RegisterFile {
    pub fn new(allocatable: RegBitSet) -> Self {
        Self {
            allocatable,
            used: RegBitSet::new(),
            locked: RegBitSet::new(),
            dirty: RegBitSet::new(),
            occupants: [None; NUM_GP_REGS],
        }
    }

    pub fn allocatable(&self) -> RegBitSet {
        self.allocatable
    }

    /// First free allocatable register that is not excluded.
    pub fn find_free(&self, exclude: RegBitSet) -> Option<AsmReg> {
        self.allocatable
            .difference(self.used)
            .difference(exclude)
            .first()
    }

    pub fn free_count(&self) -> u32 {
        self.allocatable.difference(self.used).count()
    }

    /// Occupied registers that may be evicted.
    pub fn evictable(&self, exclude: RegBitSet) -> impl Iterator<Item = AsmReg> + '_ {
        let candidates = self.used.difference(self.locked).difference(exclude);
        (0..NUM_GP_REGS as u8)
            .map(AsmReg::new)
            .filter(move |&r| candidates.contains(r))
    }

    /// Record that `reg` now holds `occupant`.
    pub fn assign(&mut self, reg: AsmReg, occupant: Occupant, dirty: bool) {
        debug_assert!(!self.used.contains(reg), "{reg} already holds a value");
        self.used.set(reg);
        if dirty {
            self.dirty.set(reg);
        } else {
            self.dirty.clear(reg);
        }
        self.occupants[reg.id() as usize] = Some(occupant);
    }

    /// Free a register, returning its previous occupant.
    pub fn free(&mut self, reg: AsmReg) -> Option<Occupant> {
        self.used.clear(reg);
        self.locked.clear(reg);
        self.dirty.clear(reg);
        self.occupants[reg.id() as usize].take()
    }

    pub fn occupant(&self, reg: AsmReg) -> Option<Occupant> {
        self.occupants[reg.id() as usize]
    }

    pub fn is_dirty(&self, reg: AsmReg) -> bool {
        self.dirty.contains(reg)
    }

    /// Mark every register holding `value` as backed by memory.
    pub fn mark_clean(&mut self, value: ValueId) {
        for reg in self.regs_of(value) {
            self.dirty.clear(reg);
        }
    }

    pub fn lock(&mut self, reg: AsmReg) {
        if self.used.contains(reg) {
            self.locked.set(reg);
        }
    }

    pub fn unlock_all(&mut self) {
        self.locked = RegBitSet::new();
    }

    /// Registers currently holding any part of `value`, ordered by part.
    pub fn regs_of(&self, value: ValueId) -> Vec<AsmReg> {
        let mut regs: Vec<(u8, AsmReg)> = self
            .used
            .iter()
            .filter_map(|r| {
                self.occupant(r)
                    .filter(|o| o.value == value)
                    .map(|o| (o.part, r))
            })
            .collect();
        regs.sort_unstable();
        regs.into_iter().map(|(_, r)| r).collect()
    }

    /// All occupied registers with their occupants.
    pub fn occupied(&self) -> Vec<(AsmReg, Occupant)> {
        self.used
            .iter()
            .filter_map(|r| self.occupant(r).map(|o| (r, o)))
            .collect()
    }

    /// Forget every occupant, e.g. across a call.
    pub fn clear(&mut self) {
        self.used = RegBitSet::new();
        self.locked = RegBitSet::new();
        self.dirty = RegBitSet::new();
        self.occupants = [None; NUM_GP_REGS];
    }
}
