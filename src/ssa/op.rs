// This module defines the closed set of SSA operations together with a static info table
// that every pass consults instead of matching on individual opcodes. The table records
// each operation's printable name, whether its final argument is the threaded memory state,
// whether it produces a new memory state, and whether its operands commute. Cond is the
// IR-level integer comparison code carried in the aux payload of Cmp values; it knows its
// textual spelling for the test IR and how it behaves when operands are swapped.

//! SSA operation codes and comparison conditions.

use std::fmt;

/// SSA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Incoming parameter; aux is the parameter index.
    Arg,
    /// Memory state at function entry.
    InitMem,
    /// Integer constant; aux is the value.
    Const,
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Neg,
    Not,
    /// Integer compare producing a bool; aux is the condition.
    Cmp,
    SignExt,
    ZeroExt,
    Trunc,
    Copy,
    Phi,
    /// Address of a memory local; aux is the local.
    LocalAddr,
    /// Address of a global symbol; aux is the symbol.
    GlobalAddr,
    /// Pointer plus constant byte offset; aux is the offset.
    OffPtr,
    /// `load ptr, mem`
    Load,
    /// `store ptr, value, mem`
    Store,
    /// `zero ptr, mem`; aux is the byte count.
    Zero,
    /// `move dst, src, mem`; aux is the byte count.
    Move,
    /// `call args..., mem`; aux describes the callee.
    Call,
    /// Build a two-word aggregate from its fields.
    Pack,
    /// Field of a two-word aggregate; aux is the field index.
    Extract,
    /// `ret results..., mem`; control value of a return block.
    Ret,
    /// Spill store inserted by the register allocator.
    StoreReg,
    /// Reload inserted by the register allocator.
    LoadReg,
    /// Caller-supplied indirect result address.
    ResultPtr,
}

/// Static properties of an operation.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    /// Last argument is the memory state.
    pub mem_arg: bool,
    /// Produces a memory state.
    pub produces_mem: bool,
    pub commutative: bool,
}

const fn info(name: &'static str, mem_arg: bool, produces_mem: bool, commutative: bool) -> OpInfo {
    OpInfo {
        name,
        mem_arg,
        produces_mem,
        commutative,
    }
}

static OP_INFO: [OpInfo; 38] = [
    info("Arg", false, false, false),
    info("InitMem", false, true, false),
    info("Const", false, false, false),
    info("Add", false, false, true),
    info("Sub", false, false, false),
    info("Mul", false, false, true),
    info("SDiv", false, false, false),
    info("UDiv", false, false, false),
    info("SRem", false, false, false),
    info("URem", false, false, false),
    info("And", false, false, true),
    info("Or", false, false, true),
    info("Xor", false, false, true),
    info("Shl", false, false, false),
    info("LShr", false, false, false),
    info("AShr", false, false, false),
    info("Neg", false, false, false),
    info("Not", false, false, false),
    info("Cmp", false, false, false),
    info("SignExt", false, false, false),
    info("ZeroExt", false, false, false),
    info("Trunc", false, false, false),
    info("Copy", false, false, false),
    info("Phi", false, false, false),
    info("LocalAddr", false, false, false),
    info("GlobalAddr", false, false, false),
    info("OffPtr", false, false, false),
    info("Load", true, false, false),
    info("Store", true, true, false),
    info("Zero", true, true, false),
    info("Move", true, true, false),
    info("Call", true, true, false),
    info("Pack", false, false, false),
    info("Extract", false, false, false),
    info("Ret", true, false, false),
    info("StoreReg", false, false, false),
    info("LoadReg", false, false, false),
    info("ResultPtr", false, false, false),
];

impl Op {
    pub fn info(self) -> &'static OpInfo {
        &OP_INFO[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Two-operand arithmetic or logic operation.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
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
                | Op::AShr
        )
    }

    /// Values that must sit at the top of their block.
    pub fn is_block_prefix(self) -> bool {
        matches!(self, Op::Phi | Op::Arg | Op::InitMem | Op::ResultPtr)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer comparison condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl Cond {
    pub const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Slt,
        Cond::Sle,
        Cond::Sgt,
        Cond::Sge,
        Cond::Ult,
        Cond::Ule,
        Cond::Ugt,
        Cond::Uge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Slt => "slt",
            Cond::Sle => "sle",
            Cond::Sgt => "sgt",
            Cond::Sge => "sge",
            Cond::Ult => "ult",
            Cond::Ule => "ule",
            Cond::Ugt => "ugt",
            Cond::Uge => "uge",
        }
    }

    pub fn parse(text: &str) -> Option<Cond> {
        Cond::ALL.into_iter().find(|c| c.name() == text)
    }

    /// Condition that holds for `b op a` whenever `self` holds for `a op b`.
    pub fn swapped(self) -> Cond {
        match self {
            Cond::Eq | Cond::Ne => self,
            Cond::Slt => Cond::Sgt,
            Cond::Sle => Cond::Sge,
            Cond::Sgt => Cond::Slt,
            Cond::Sge => Cond::Sle,
            Cond::Ult => Cond::Ugt,
            Cond::Ule => Cond::Uge,
            Cond::Ugt => Cond::Ult,
            Cond::Uge => Cond::Ule,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Cond::Slt | Cond::Sle | Cond::Sgt | Cond::Sge)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_table_matches_variants() {
        assert_eq!(Op::Arg.name(), "Arg");
        assert_eq!(Op::ResultPtr.name(), "ResultPtr");
        assert_eq!(Op::Call.name(), "Call");
        assert!(Op::Store.info().mem_arg && Op::Store.info().produces_mem);
        assert!(Op::Load.info().mem_arg && !Op::Load.info().produces_mem);
        assert!(Op::Ret.info().mem_arg);
        assert!(Op::Add.info().commutative);
    }

    #[test]
    fn cond_parse_and_swap() {
        for c in Cond::ALL {
            assert_eq!(Cond::parse(c.name()), Some(c));
            assert_eq!(c.swapped().swapped(), c);
        }
        assert_eq!(Cond::Ult.swapped(), Cond::Ugt);
        assert_eq!(Cond::parse("lt"), None);
    }
}
