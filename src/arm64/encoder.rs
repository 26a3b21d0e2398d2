// This module encodes and decodes the subset of A64 instructions the code generator emits.
// Every instruction is a fixed 32-bit word, so instead of an assembler library the encoder
// describes each instruction class as one A64Inst variant holding its operand fields, and
// encode() packs those fields into the class's fixed bit pattern after checking that every
// immediate fits its field. decode() reverses the process for the same classes; the two are
// exact inverses on well-formed instructions, which the tests exercise together with a set
// of words cross-checked against a reference disassembler. Only the 64-bit (sf = 1) forms
// are produced: narrow integer values are kept canonically sign- or zero-extended in their
// register, so comparisons and divisions always operate on full X registers. Register 31
// reads as SP in the add/sub-immediate and load/store base fields and as XZR everywhere
// else; helper constructors such as mov(), cmp(), cset() and mul() spell the usual aliases
// and pick the right reading. mov_imm() materializes arbitrary 64-bit constants with a
// MOVZ/MOVN + MOVK sequence, starting from whichever base leaves fewer halfwords to patch.

//! A64 instruction encoding and decoding.

use std::fmt;

use thiserror::Error;

use crate::core::register_file::AsmReg;
use crate::ssa::Cond;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Immediate does not fit its instruction field.
    #[error("{what} {value} out of range")]
    ImmediateOutOfRange { what: &'static str, value: i64 },
    /// Offset is not a multiple of the access or instruction size.
    #[error("offset {offset} is not a multiple of {align}")]
    Misaligned { offset: i64, align: u32 },
    /// Word does not belong to any supported instruction class.
    #[error("unknown instruction word {0:#010x}")]
    UnknownEncoding(u32),
}

/// A64 condition codes, numbered as in the `cond` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum A64Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl A64Cond {
    const ALL: [A64Cond; 15] = [
        A64Cond::Eq,
        A64Cond::Ne,
        A64Cond::Hs,
        A64Cond::Lo,
        A64Cond::Mi,
        A64Cond::Pl,
        A64Cond::Vs,
        A64Cond::Vc,
        A64Cond::Hi,
        A64Cond::Ls,
        A64Cond::Ge,
        A64Cond::Lt,
        A64Cond::Gt,
        A64Cond::Le,
        A64Cond::Al,
    ];

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }

    /// Condition that holds exactly when `self` does not.
    pub fn invert(self) -> Self {
        match self {
            A64Cond::Al => A64Cond::Al,
            c => Self::ALL[(c.bits() ^ 1) as usize],
        }
    }

    /// Flags condition after `cmp a, b` for an IR comparison of `a` and `b`.
    pub fn from_cond(cond: Cond) -> Self {
        match cond {
            Cond::Eq => A64Cond::Eq,
            Cond::Ne => A64Cond::Ne,
            Cond::Slt => A64Cond::Lt,
            Cond::Sle => A64Cond::Le,
            Cond::Sgt => A64Cond::Gt,
            Cond::Sge => A64Cond::Ge,
            Cond::Ult => A64Cond::Lo,
            Cond::Ule => A64Cond::Ls,
            Cond::Ugt => A64Cond::Hi,
            Cond::Uge => A64Cond::Hs,
        }
    }

    pub fn name(self) -> &'static str {
        [
            "eq", "ne", "hs", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al",
        ][self as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSubOp {
    Add,
    Adds,
    Sub,
    Subs,
}

impl AddSubOp {
    fn bits(self) -> u32 {
        match self {
            AddSubOp::Add => 0b00,
            AddSubOp::Adds => 0b01,
            AddSubOp::Sub => 0b10,
            AddSubOp::Subs => 0b11,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0b00 => AddSubOp::Add,
            0b01 => AddSubOp::Adds,
            0b10 => AddSubOp::Sub,
            _ => AddSubOp::Subs,
        }
    }

    fn sets_flags(self) -> bool {
        matches!(self, AddSubOp::Adds | AddSubOp::Subs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    Ands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovOp {
    Movn,
    Movz,
    Movk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp2 {
    UDiv,
    SDiv,
    Lslv,
    Lsrv,
    Asrv,
}

impl DataOp2 {
    const TABLE: [(DataOp2, u32); 5] = [
        (DataOp2::UDiv, 0b000010),
        (DataOp2::SDiv, 0b000011),
        (DataOp2::Lslv, 0b001000),
        (DataOp2::Lsrv, 0b001001),
        (DataOp2::Asrv, 0b001010),
    ];

    fn bits(self) -> u32 {
        Self::TABLE
            .iter()
            .find(|(op, _)| *op == self)
            .map_or(0, |&(_, bits)| bits)
    }

    fn from_bits(bits: u32) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|&&(_, b)| b == bits)
            .map(|&(op, _)| op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp3 {
    Madd,
    Msub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldOp {
    Sbfm,
    Ubfm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondSelOp {
    Csel,
    Csinc,
}

/// Kind of single-register memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Store,
    /// Zero-extending load.
    Load,
    /// Sign-extending load into an X register.
    LoadSigned,
}

/// Access width, encoded as log2 of the byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSize {
    B = 0,
    H = 1,
    W = 2,
    X = 3,
}

impl MemSize {
    pub fn bytes(self) -> u32 {
        1 << self as u32
    }

    /// Access size for a value of `bytes` bytes.
    pub fn for_bytes(bytes: u32) -> Self {
        match bytes {
            0 | 1 => MemSize::B,
            2 => MemSize::H,
            3 | 4 => MemSize::W,
            _ => MemSize::X,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => MemSize::B,
            1 => MemSize::H,
            2 => MemSize::W,
            _ => MemSize::X,
        }
    }
}

/// Addressing mode of `ldp`/`stp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairMode {
    PostIndex,
    Offset,
    PreIndex,
}

impl PairMode {
    fn bits(self) -> u32 {
        match self {
            PairMode::PostIndex => 0b01,
            PairMode::Offset => 0b10,
            PairMode::PreIndex => 0b11,
        }
    }
}

/// One A64 instruction. Offsets are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A64Inst {
    /// Shifted-register add/sub; `shift` is an LSL amount applied to `rm`.
    AddSubReg {
        op: AddSubOp,
        rd: AsmReg,
        rn: AsmReg,
        rm: AsmReg,
        shift: u8,
    },
    AddSubImm {
        op: AddSubOp,
        rd: AsmReg,
        rn: AsmReg,
        imm12: u16,
        shift12: bool,
    },
    /// Shifted-register logical op; `invert` selects BIC/ORN/EON/BICS.
    Logical {
        op: LogicOp,
        invert: bool,
        rd: AsmReg,
        rn: AsmReg,
        rm: AsmReg,
    },
    MovWide {
        op: MovOp,
        rd: AsmReg,
        imm16: u16,
        hw: u8,
    },
    DataProc2 {
        op: DataOp2,
        rd: AsmReg,
        rn: AsmReg,
        rm: AsmReg,
    },
    DataProc3 {
        op: DataOp3,
        rd: AsmReg,
        rn: AsmReg,
        rm: AsmReg,
        ra: AsmReg,
    },
    Bitfield {
        op: BitfieldOp,
        rd: AsmReg,
        rn: AsmReg,
        immr: u8,
        imms: u8,
    },
    CondSelect {
        op: CondSelOp,
        rd: AsmReg,
        rn: AsmReg,
        rm: AsmReg,
        cond: A64Cond,
    },
    /// Unsigned scaled-offset load or store.
    LoadStore {
        op: MemOp,
        size: MemSize,
        rt: AsmReg,
        rn: AsmReg,
        offset: u32,
    },
    /// 64-bit `ldp`/`stp`.
    LoadStorePair {
        load: bool,
        mode: PairMode,
        rt: AsmReg,
        rt2: AsmReg,
        rn: AsmReg,
        offset: i32,
    },
    /// `b` or `bl`.
    Branch { link: bool, offset: i32 },
    BranchCond { cond: A64Cond, offset: i32 },
    /// `cbz` or `cbnz` on an X register.
    CompareBranch {
        nonzero: bool,
        rt: AsmReg,
        offset: i32,
    },
    Ret { rn: AsmReg },
    /// Page address relative to the instruction's page; `pages` counts 4 KiB pages.
    Adrp { rd: AsmReg, pages: i32 },
}

fn reg(r: AsmReg) -> u32 {
    r.id() as u32
}

fn field(word: u32, shift: u32, bits: u32) -> u32 {
    (word >> shift) & ((1 << bits) - 1)
}

fn reg_at(word: u32, shift: u32) -> AsmReg {
    AsmReg::new(field(word, shift, 5) as u8)
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Pack a signed, `scale`-aligned byte offset into a `bits`-wide field.
fn scaled_signed(what: &'static str, offset: i64, scale: u32, bits: u32) -> Result<u32, EncodingError> {
    if offset % scale as i64 != 0 {
        return Err(EncodingError::Misaligned { offset, align: scale });
    }
    let units = offset / scale as i64;
    let limit = 1i64 << (bits - 1);
    if units < -limit || units >= limit {
        return Err(EncodingError::ImmediateOutOfRange { what, value: offset });
    }
    Ok((units as u32) & ((1 << bits) - 1))
}

fn check(what: &'static str, value: i64, max: i64) -> Result<u32, EncodingError> {
    if (0..=max).contains(&value) {
        Ok(value as u32)
    } else {
        Err(EncodingError::ImmediateOutOfRange { what, value })
    }
}

impl A64Inst {
    /// Encode into an instruction word.
    pub fn encode(&self) -> Result<u32, EncodingError> {
        let word = match *self {
            A64Inst::AddSubReg { op, rd, rn, rm, shift } => {
                let imm6 = check("shift amount", shift as i64, 63)?;
                0x8B00_0000 | op.bits() << 29 | reg(rm) << 16 | imm6 << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::AddSubImm {
                op,
                rd,
                rn,
                imm12,
                shift12,
            } => {
                let imm = check("add/sub immediate", imm12 as i64, 4095)?;
                0x9100_0000 | op.bits() << 29 | (shift12 as u32) << 22 | imm << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::Logical {
                op,
                invert,
                rd,
                rn,
                rm,
            } => {
                let opc = match op {
                    LogicOp::And => 0b00,
                    LogicOp::Orr => 0b01,
                    LogicOp::Eor => 0b10,
                    LogicOp::Ands => 0b11,
                };
                0x8A00_0000 | opc << 29 | (invert as u32) << 21 | reg(rm) << 16 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::MovWide { op, rd, imm16, hw } => {
                let hw = check("halfword index", hw as i64, 3)?;
                let opc = match op {
                    MovOp::Movn => 0b00,
                    MovOp::Movz => 0b10,
                    MovOp::Movk => 0b11,
                };
                0x9280_0000 | opc << 29 | hw << 21 | (imm16 as u32) << 5 | reg(rd)
            }
            A64Inst::DataProc2 { op, rd, rn, rm } => {
                0x9AC0_0000 | reg(rm) << 16 | op.bits() << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::DataProc3 { op, rd, rn, rm, ra } => {
                let o0 = matches!(op, DataOp3::Msub) as u32;
                0x9B00_0000 | reg(rm) << 16 | o0 << 15 | reg(ra) << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::Bitfield {
                op,
                rd,
                rn,
                immr,
                imms,
            } => {
                let immr = check("immr", immr as i64, 63)?;
                let imms = check("imms", imms as i64, 63)?;
                let opc = match op {
                    BitfieldOp::Sbfm => 0b00,
                    BitfieldOp::Ubfm => 0b10,
                };
                0x9340_0000 | opc << 29 | immr << 16 | imms << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::CondSelect {
                op,
                rd,
                rn,
                rm,
                cond,
            } => {
                let o2 = matches!(op, CondSelOp::Csinc) as u32;
                0x9A80_0000 | reg(rm) << 16 | cond.bits() << 12 | o2 << 10 | reg(rn) << 5 | reg(rd)
            }
            A64Inst::LoadStore {
                op,
                size,
                rt,
                rn,
                offset,
            } => {
                let scale = size.bytes();
                if offset % scale != 0 {
                    return Err(EncodingError::Misaligned {
                        offset: offset as i64,
                        align: scale,
                    });
                }
                let imm12 = check("load/store offset", (offset / scale) as i64, 4095)?;
                let opc = match (op, size) {
                    (MemOp::Store, _) => 0b00,
                    (MemOp::Load, _) | (MemOp::LoadSigned, MemSize::X) => 0b01,
                    (MemOp::LoadSigned, _) => 0b10,
                };
                (size as u32) << 30 | 0x3900_0000 | opc << 22 | imm12 << 10 | reg(rn) << 5 | reg(rt)
            }
            A64Inst::LoadStorePair {
                load,
                mode,
                rt,
                rt2,
                rn,
                offset,
            } => {
                let imm7 = scaled_signed("pair offset", offset as i64, 8, 7)?;
                0xA800_0000
                    | mode.bits() << 23
                    | (load as u32) << 22
                    | imm7 << 15
                    | reg(rt2) << 10
                    | reg(rn) << 5
                    | reg(rt)
            }
            A64Inst::Branch { link, offset } => {
                let imm26 = scaled_signed("branch offset", offset as i64, 4, 26)?;
                0x1400_0000 | (link as u32) << 31 | imm26
            }
            A64Inst::BranchCond { cond, offset } => {
                let imm19 = scaled_signed("conditional branch offset", offset as i64, 4, 19)?;
                0x5400_0000 | imm19 << 5 | cond.bits()
            }
            A64Inst::CompareBranch { nonzero, rt, offset } => {
                let imm19 = scaled_signed("compare-and-branch offset", offset as i64, 4, 19)?;
                0xB400_0000 | (nonzero as u32) << 24 | imm19 << 5 | reg(rt)
            }
            A64Inst::Ret { rn } => 0xD65F_0000 | reg(rn) << 5,
            A64Inst::Adrp { rd, pages } => {
                let imm = scaled_signed("adrp page offset", pages as i64, 1, 21)?;
                0x9000_0000 | (imm & 3) << 29 | (imm >> 2) << 5 | reg(rd)
            }
        };
        Ok(word)
    }

    /// Decode a word produced by [`A64Inst::encode`].
    pub fn decode(word: u32) -> Result<A64Inst, EncodingError> {
        let unknown = EncodingError::UnknownEncoding(word);
        let rd = reg_at(word, 0);
        let rn = reg_at(word, 5);
        let rm = reg_at(word, 16);

        if word & 0xFFFF_FC1F == 0xD65F_0000 {
            return Ok(A64Inst::Ret { rn });
        }
        if word & 0x9F00_0000 == 0x9000_0000 {
            let imm = field(word, 29, 2) | field(word, 5, 19) << 2;
            return Ok(A64Inst::Adrp {
                rd,
                pages: sign_extend(imm, 21),
            });
        }
        if word & 0x7C00_0000 == 0x1400_0000 {
            return Ok(A64Inst::Branch {
                link: word >> 31 == 1,
                offset: sign_extend(field(word, 0, 26), 26) * 4,
            });
        }
        if word & 0xFF00_0010 == 0x5400_0000 {
            let cond = A64Cond::from_bits(field(word, 0, 4)).ok_or(unknown)?;
            return Ok(A64Inst::BranchCond {
                cond,
                offset: sign_extend(field(word, 5, 19), 19) * 4,
            });
        }
        if word & 0xFE00_0000 == 0xB400_0000 {
            return Ok(A64Inst::CompareBranch {
                nonzero: field(word, 24, 1) == 1,
                rt: rd,
                offset: sign_extend(field(word, 5, 19), 19) * 4,
            });
        }
        if word & 0x3F00_0000 == 0x3900_0000 {
            let size = MemSize::from_bits(field(word, 30, 2));
            let op = match (field(word, 22, 2), size) {
                (0b00, _) => MemOp::Store,
                (0b01, MemSize::X) => MemOp::Load,
                (0b01, _) => MemOp::Load,
                (0b10, MemSize::X) => return Err(unknown),
                (0b10, _) => MemOp::LoadSigned,
                _ => return Err(unknown),
            };
            return Ok(A64Inst::LoadStore {
                op,
                size,
                rt: rd,
                rn,
                offset: field(word, 10, 12) * size.bytes(),
            });
        }
        if word & 0xFE00_0000 == 0xA800_0000 {
            let mode = match field(word, 23, 2) {
                0b01 => PairMode::PostIndex,
                0b10 => PairMode::Offset,
                0b11 => PairMode::PreIndex,
                _ => return Err(unknown),
            };
            return Ok(A64Inst::LoadStorePair {
                load: field(word, 22, 1) == 1,
                mode,
                rt: rd,
                rt2: reg_at(word, 10),
                rn,
                offset: sign_extend(field(word, 15, 7), 7) * 8,
            });
        }

        // Everything below is a 64-bit data-processing form.
        if word >> 31 != 1 {
            return Err(unknown);
        }
        let op2 = AddSubOp::from_bits(field(word, 29, 2));
        match word & 0x1F00_0000 {
            0x0B00_0000 if field(word, 21, 3) == 0 => Ok(A64Inst::AddSubReg {
                op: op2,
                rd,
                rn,
                rm,
                shift: field(word, 10, 6) as u8,
            }),
            0x1100_0000 if field(word, 23, 1) == 0 => Ok(A64Inst::AddSubImm {
                op: op2,
                rd,
                rn,
                imm12: field(word, 10, 12) as u16,
                shift12: field(word, 22, 1) == 1,
            }),
            0x0A00_0000 if field(word, 22, 2) == 0 && field(word, 10, 6) == 0 => {
                let op = match field(word, 29, 2) {
                    0b00 => LogicOp::And,
                    0b01 => LogicOp::Orr,
                    0b10 => LogicOp::Eor,
                    _ => LogicOp::Ands,
                };
                Ok(A64Inst::Logical {
                    op,
                    invert: field(word, 21, 1) == 1,
                    rd,
                    rn,
                    rm,
                })
            }
            0x1200_0000 if field(word, 23, 1) == 1 => {
                let op = match field(word, 29, 2) {
                    0b00 => MovOp::Movn,
                    0b10 => MovOp::Movz,
                    0b11 => MovOp::Movk,
                    _ => return Err(unknown),
                };
                Ok(A64Inst::MovWide {
                    op,
                    rd,
                    imm16: field(word, 5, 16) as u16,
                    hw: field(word, 21, 2) as u8,
                })
            }
            0x1300_0000 if field(word, 23, 1) == 0 && field(word, 22, 1) == 1 => {
                let op = match field(word, 29, 2) {
                    0b00 => BitfieldOp::Sbfm,
                    0b10 => BitfieldOp::Ubfm,
                    _ => return Err(unknown),
                };
                Ok(A64Inst::Bitfield {
                    op,
                    rd,
                    rn,
                    immr: field(word, 16, 6) as u8,
                    imms: field(word, 10, 6) as u8,
                })
            }
            0x1B00_0000 if field(word, 21, 3) == 0 && field(word, 29, 2) == 0 => {
                let op = if field(word, 15, 1) == 1 {
                    DataOp3::Msub
                } else {
                    DataOp3::Madd
                };
                Ok(A64Inst::DataProc3 {
                    op,
                    rd,
                    rn,
                    rm,
                    ra: reg_at(word, 10),
                })
            }
            0x1A00_0000 => match field(word, 21, 8) {
                0b1101_0110 if field(word, 29, 2) == 0 => {
                    let op = DataOp2::from_bits(field(word, 10, 6)).ok_or(unknown)?;
                    Ok(A64Inst::DataProc2 { op, rd, rn, rm })
                }
                0b1101_0100 if field(word, 29, 2) == 0 && field(word, 11, 1) == 0 => {
                    let op = if field(word, 10, 1) == 1 {
                        CondSelOp::Csinc
                    } else {
                        CondSelOp::Csel
                    };
                    let cond = A64Cond::from_bits(field(word, 12, 4)).ok_or(unknown)?;
                    Ok(A64Inst::CondSelect { op, rd, rn, rm, cond })
                }
                _ => Err(unknown),
            },
            _ => Err(unknown),
        }
    }

    /// Copy of a branch-like instruction with a new displacement.
    pub fn with_offset(self, new_offset: i32) -> A64Inst {
        match self {
            A64Inst::Branch { link, .. } => A64Inst::Branch { link, offset: new_offset },
            A64Inst::BranchCond { cond, .. } => A64Inst::BranchCond { cond, offset: new_offset },
            A64Inst::CompareBranch { nonzero, rt, .. } => A64Inst::CompareBranch {
                nonzero,
                rt,
                offset: new_offset,
            },
            other => other,
        }
    }
}

// ---- aliases -----------------------------------------------------------------

/// `mov rd, rm`; uses the add-immediate form when either side is `sp`.
pub fn mov(rd: AsmReg, rm: AsmReg) -> A64Inst {
    if rd == AsmReg::SP || rm == AsmReg::SP {
        add_imm(rd, rm, 0)
    } else {
        A64Inst::Logical {
            op: LogicOp::Orr,
            invert: false,
            rd,
            rn: AsmReg::XZR,
            rm,
        }
    }
}

pub fn add(rd: AsmReg, rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::AddSubReg {
        op: AddSubOp::Add,
        rd,
        rn,
        rm,
        shift: 0,
    }
}

pub fn sub(rd: AsmReg, rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::AddSubReg {
        op: AddSubOp::Sub,
        rd,
        rn,
        rm,
        shift: 0,
    }
}

pub fn add_imm(rd: AsmReg, rn: AsmReg, imm12: u16) -> A64Inst {
    A64Inst::AddSubImm {
        op: AddSubOp::Add,
        rd,
        rn,
        imm12,
        shift12: false,
    }
}

pub fn sub_imm(rd: AsmReg, rn: AsmReg, imm12: u16) -> A64Inst {
    A64Inst::AddSubImm {
        op: AddSubOp::Sub,
        rd,
        rn,
        imm12,
        shift12: false,
    }
}

/// `cmp rn, rm`
pub fn cmp(rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::AddSubReg {
        op: AddSubOp::Subs,
        rd: AsmReg::XZR,
        rn,
        rm,
        shift: 0,
    }
}

/// `neg rd, rm`
pub fn neg(rd: AsmReg, rm: AsmReg) -> A64Inst {
    sub(rd, AsmReg::XZR, rm)
}

/// `mvn rd, rm`
pub fn mvn(rd: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::Logical {
        op: LogicOp::Orr,
        invert: true,
        rd,
        rn: AsmReg::XZR,
        rm,
    }
}

pub fn logical(op: LogicOp, rd: AsmReg, rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::Logical {
        op,
        invert: false,
        rd,
        rn,
        rm,
    }
}

pub fn mul(rd: AsmReg, rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::DataProc3 {
        op: DataOp3::Madd,
        rd,
        rn,
        rm,
        ra: AsmReg::XZR,
    }
}

/// `msub rd, rn, rm, ra`: `ra - rn * rm`.
pub fn msub(rd: AsmReg, rn: AsmReg, rm: AsmReg, ra: AsmReg) -> A64Inst {
    A64Inst::DataProc3 {
        op: DataOp3::Msub,
        rd,
        rn,
        rm,
        ra,
    }
}

pub fn data2(op: DataOp2, rd: AsmReg, rn: AsmReg, rm: AsmReg) -> A64Inst {
    A64Inst::DataProc2 { op, rd, rn, rm }
}

/// `cset rd, cond`
pub fn cset(rd: AsmReg, cond: A64Cond) -> A64Inst {
    A64Inst::CondSelect {
        op: CondSelOp::Csinc,
        rd,
        rn: AsmReg::XZR,
        rm: AsmReg::XZR,
        cond: cond.invert(),
    }
}

/// Sign-extend the low `bits` bits of `rn` into `rd`.
pub fn sign_extend_bits(rd: AsmReg, rn: AsmReg, bits: u32) -> A64Inst {
    A64Inst::Bitfield {
        op: BitfieldOp::Sbfm,
        rd,
        rn,
        immr: 0,
        imms: (bits - 1) as u8,
    }
}

/// Zero-extend the low `bits` bits of `rn` into `rd`.
pub fn zero_extend_bits(rd: AsmReg, rn: AsmReg, bits: u32) -> A64Inst {
    A64Inst::Bitfield {
        op: BitfieldOp::Ubfm,
        rd,
        rn,
        immr: 0,
        imms: (bits - 1) as u8,
    }
}

pub fn load(size: MemSize, signed: bool, rt: AsmReg, rn: AsmReg, offset: u32) -> A64Inst {
    A64Inst::LoadStore {
        op: if signed && size != MemSize::X {
            MemOp::LoadSigned
        } else {
            MemOp::Load
        },
        size,
        rt,
        rn,
        offset,
    }
}

pub fn store(size: MemSize, rt: AsmReg, rn: AsmReg, offset: u32) -> A64Inst {
    A64Inst::LoadStore {
        op: MemOp::Store,
        size,
        rt,
        rn,
        offset,
    }
}

pub fn ldr(rt: AsmReg, rn: AsmReg, offset: u32) -> A64Inst {
    load(MemSize::X, false, rt, rn, offset)
}

pub fn str(rt: AsmReg, rn: AsmReg, offset: u32) -> A64Inst {
    store(MemSize::X, rt, rn, offset)
}

pub fn ldp(rt: AsmReg, rt2: AsmReg, rn: AsmReg, offset: i32) -> A64Inst {
    A64Inst::LoadStorePair {
        load: true,
        mode: PairMode::Offset,
        rt,
        rt2,
        rn,
        offset,
    }
}

pub fn stp(rt: AsmReg, rt2: AsmReg, rn: AsmReg, offset: i32) -> A64Inst {
    A64Inst::LoadStorePair {
        load: false,
        mode: PairMode::Offset,
        rt,
        rt2,
        rn,
        offset,
    }
}

pub fn b(offset: i32) -> A64Inst {
    A64Inst::Branch { link: false, offset }
}

pub fn bl(offset: i32) -> A64Inst {
    A64Inst::Branch { link: true, offset }
}

pub fn b_cond(cond: A64Cond, offset: i32) -> A64Inst {
    A64Inst::BranchCond { cond, offset }
}

pub fn cbnz(rt: AsmReg, offset: i32) -> A64Inst {
    A64Inst::CompareBranch {
        nonzero: true,
        rt,
        offset,
    }
}

pub fn cbz(rt: AsmReg, offset: i32) -> A64Inst {
    A64Inst::CompareBranch {
        nonzero: false,
        rt,
        offset,
    }
}

pub fn ret() -> A64Inst {
    A64Inst::Ret { rn: AsmReg::LR }
}

/// Shortest MOVZ/MOVN + MOVK sequence loading `value` into `rd`.
pub fn mov_imm(rd: AsmReg, value: i64) -> Vec<A64Inst> {
    let bits = value as u64;
    let halves: Vec<u16> = (0..4).map(|i| (bits >> (16 * i)) as u16).collect();
    let zeros = halves.iter().filter(|&&h| h == 0).count();
    let ones = halves.iter().filter(|&&h| h == 0xFFFF).count();
    let inverted = ones > zeros;
    let filler = if inverted { 0xFFFF } else { 0 };

    let mut seq = Vec::with_capacity(4);
    for (hw, &half) in halves.iter().enumerate() {
        if half == filler {
            continue;
        }
        let inst = if !seq.is_empty() {
            A64Inst::MovWide {
                op: MovOp::Movk,
                rd,
                imm16: half,
                hw: hw as u8,
            }
        } else if inverted {
            A64Inst::MovWide {
                op: MovOp::Movn,
                rd,
                imm16: !half,
                hw: hw as u8,
            }
        } else {
            A64Inst::MovWide {
                op: MovOp::Movz,
                rd,
                imm16: half,
                hw: hw as u8,
            }
        };
        seq.push(inst);
    }
    if seq.is_empty() {
        seq.push(A64Inst::MovWide {
            op: if inverted { MovOp::Movn } else { MovOp::Movz },
            rd,
            imm16: 0,
            hw: 0,
        });
    }
    seq
}

/// Whether `value` fits an add/sub immediate without shifting.
pub fn is_add_imm(value: i64) -> bool {
    (0..4096).contains(&value)
}

fn xreg(r: AsmReg, sp: bool) -> String {
    match r.id() {
        31 if sp => "sp".into(),
        31 => "xzr".into(),
        n => format!("x{n}"),
    }
}

impl fmt::Display for A64Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = |r: AsmReg| xreg(r, false);
        let s = |r: AsmReg| xreg(r, true);
        match *self {
            A64Inst::AddSubReg { op, rd, rn, rm, shift } => {
                let name = ["add", "adds", "sub", "subs"][op.bits() as usize];
                write!(f, "{name} {}, {}, {}", x(rd), x(rn), x(rm))?;
                if shift != 0 {
                    write!(f, ", lsl #{shift}")?;
                }
                Ok(())
            }
            A64Inst::AddSubImm {
                op,
                rd,
                rn,
                imm12,
                shift12,
            } => {
                let name = ["add", "adds", "sub", "subs"][op.bits() as usize];
                let rd = if op.sets_flags() { x(rd) } else { s(rd) };
                write!(f, "{name} {rd}, {}, #{imm12}", s(rn))?;
                if shift12 {
                    write!(f, ", lsl #12")?;
                }
                Ok(())
            }
            A64Inst::Logical {
                op,
                invert,
                rd,
                rn,
                rm,
            } => {
                let name = match (op, invert) {
                    (LogicOp::And, false) => "and",
                    (LogicOp::And, true) => "bic",
                    (LogicOp::Orr, false) => "orr",
                    (LogicOp::Orr, true) => "orn",
                    (LogicOp::Eor, false) => "eor",
                    (LogicOp::Eor, true) => "eon",
                    (LogicOp::Ands, false) => "ands",
                    (LogicOp::Ands, true) => "bics",
                };
                write!(f, "{name} {}, {}, {}", x(rd), x(rn), x(rm))
            }
            A64Inst::MovWide { op, rd, imm16, hw } => {
                let name = match op {
                    MovOp::Movn => "movn",
                    MovOp::Movz => "movz",
                    MovOp::Movk => "movk",
                };
                write!(f, "{name} {}, #{imm16:#x}, lsl #{}", x(rd), hw as u32 * 16)
            }
            A64Inst::DataProc2 { op, rd, rn, rm } => {
                let name = match op {
                    DataOp2::UDiv => "udiv",
                    DataOp2::SDiv => "sdiv",
                    DataOp2::Lslv => "lsl",
                    DataOp2::Lsrv => "lsr",
                    DataOp2::Asrv => "asr",
                };
                write!(f, "{name} {}, {}, {}", x(rd), x(rn), x(rm))
            }
            A64Inst::DataProc3 { op, rd, rn, rm, ra } => {
                let name = match op {
                    DataOp3::Madd => "madd",
                    DataOp3::Msub => "msub",
                };
                write!(f, "{name} {}, {}, {}, {}", x(rd), x(rn), x(rm), x(ra))
            }
            A64Inst::Bitfield {
                op,
                rd,
                rn,
                immr,
                imms,
            } => {
                let name = match op {
                    BitfieldOp::Sbfm => "sbfm",
                    BitfieldOp::Ubfm => "ubfm",
                };
                write!(f, "{name} {}, {}, #{immr}, #{imms}", x(rd), x(rn))
            }
            A64Inst::CondSelect {
                op,
                rd,
                rn,
                rm,
                cond,
            } => {
                let name = match op {
                    CondSelOp::Csel => "csel",
                    CondSelOp::Csinc => "csinc",
                };
                write!(f, "{name} {}, {}, {}, {}", x(rd), x(rn), x(rm), cond.name())
            }
            A64Inst::LoadStore {
                op,
                size,
                rt,
                rn,
                offset,
            } => {
                let suffix = ["b", "h", "", ""][size as usize];
                let name = match op {
                    MemOp::Store => format!("str{suffix}"),
                    MemOp::Load => format!("ldr{suffix}"),
                    MemOp::LoadSigned if size == MemSize::W => "ldrsw".to_string(),
                    MemOp::LoadSigned => format!("ldrs{suffix}"),
                };
                let rt = match (op, size) {
                    (MemOp::LoadSigned, _) | (_, MemSize::X) => x(rt),
                    _ if rt == AsmReg::XZR => "wzr".to_string(),
                    _ => format!("w{}", rt.id()),
                };
                write!(f, "{name} {rt}, [{}, #{offset}]", s(rn))
            }
            A64Inst::LoadStorePair {
                load,
                mode,
                rt,
                rt2,
                rn,
                offset,
            } => {
                let name = if load { "ldp" } else { "stp" };
                match mode {
                    PairMode::Offset => write!(f, "{name} {}, {}, [{}, #{offset}]", x(rt), x(rt2), s(rn)),
                    PairMode::PreIndex => write!(f, "{name} {}, {}, [{}, #{offset}]!", x(rt), x(rt2), s(rn)),
                    PairMode::PostIndex => write!(f, "{name} {}, {}, [{}], #{offset}", x(rt), x(rt2), s(rn)),
                }
            }
            A64Inst::Branch { link, offset } => write!(f, "{} {offset:+}", if link { "bl" } else { "b" }),
            A64Inst::BranchCond { cond, offset } => write!(f, "b.{} {offset:+}", cond.name()),
            A64Inst::CompareBranch { nonzero, rt, offset } => {
                write!(f, "{} {}, {offset:+}", if nonzero { "cbnz" } else { "cbz" }, x(rt))
            }
            A64Inst::Ret { rn } => write!(f, "ret {}", x(rn)),
            A64Inst::Adrp { rd, pages } => write!(f, "adrp {}, {pages:+}", x(rd)),
        }
    }
}

/// Render little-endian code as one line per instruction word.
pub fn disassemble(code: &[u8]) -> Vec<String> {
    code.chunks(4)
        .enumerate()
        .map(|(i, chunk)| {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let word = u32::from_le_bytes(bytes);
            match A64Inst::decode(word) {
                Ok(inst) => format!("{:6x}: {inst}", i * 4),
                Err(_) => format!("{:6x}: .word {word:#010x}", i * 4),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(n: u8) -> AsmReg {
        AsmReg::new(n)
    }

    #[test]
    fn known_encodings() {
        let cases = [
            (add(x(0), x(0), x(1)), 0x8B01_0000),
            (ret(), 0xD65F_03C0),
            (
                A64Inst::LoadStorePair {
                    load: false,
                    mode: PairMode::PreIndex,
                    rt: AsmReg::FP,
                    rt2: AsmReg::LR,
                    rn: AsmReg::SP,
                    offset: -16,
                },
                0xA9BF_7BFD,
            ),
            (
                A64Inst::LoadStorePair {
                    load: true,
                    mode: PairMode::PostIndex,
                    rt: AsmReg::FP,
                    rt2: AsmReg::LR,
                    rn: AsmReg::SP,
                    offset: 16,
                },
                0xA8C1_7BFD,
            ),
            (mov(AsmReg::FP, AsmReg::SP), 0x9100_03FD),
            (sub_imm(AsmReg::SP, AsmReg::SP, 16), 0xD100_43FF),
            (str(x(0), AsmReg::SP, 8), 0xF900_07E0),
            (ldr(x(1), AsmReg::SP, 8), 0xF940_07E1),
            (cset(x(0), A64Cond::Eq), 0x9A9F_17E0),
            (mul(x(0), x(1), x(2)), 0x9B02_7C20),
            (data2(DataOp2::SDiv, x(0), x(1), x(2)), 0x9AC2_0C20),
            (cbnz(x(0), 8), 0xB500_0040),
            (bl(0), 0x9400_0000),
            (mov(x(0), x(1)), 0xAA01_03E0),
        ];
        for (inst, word) in cases {
            assert_eq!(inst.encode().unwrap(), word, "{inst}");
            assert_eq!(A64Inst::decode(word).unwrap(), inst, "{word:#010x}");
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let insts = [
            cmp(x(3), x(4)),
            neg(x(5), x(6)),
            mvn(x(7), x(8)),
            logical(LogicOp::Eor, x(1), x(2), x(3)),
            msub(x(0), x(1), x(2), x(3)),
            sign_extend_bits(x(9), x(9), 8),
            zero_extend_bits(x(10), x(11), 32),
            load(MemSize::H, true, x(2), x(3), 6),
            load(MemSize::W, false, x(2), x(3), 4092),
            store(MemSize::B, x(4), AsmReg::SP, 4095),
            ldp(x(0), x(1), x(8), 16),
            stp(x(2), x(3), AsmReg::SP, -512),
            b(-4),
            b_cond(A64Cond::Hi, 1 << 19),
            cbz(x(12), -(1 << 20)),
            A64Inst::Adrp { rd: x(16), pages: -3 },
            A64Inst::AddSubImm {
                op: AddSubOp::Subs,
                rd: AsmReg::XZR,
                rn: x(1),
                imm12: 42,
                shift12: true,
            },
        ];
        for inst in insts {
            let word = inst.encode().unwrap();
            assert_eq!(A64Inst::decode(word).unwrap(), inst, "{inst} -> {word:#010x}");
        }
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        assert!(matches!(
            b_cond(A64Cond::Eq, 1 << 20).encode(),
            Err(EncodingError::ImmediateOutOfRange { .. })
        ));
        assert!(matches!(b(2).encode(), Err(EncodingError::Misaligned { .. })));
        assert!(matches!(
            ldr(x(0), AsmReg::SP, 4).encode(),
            Err(EncodingError::Misaligned { .. })
        ));
        assert!(ldr(x(0), AsmReg::SP, 8 * 4096).encode().is_err());
        assert!(stp(x(0), x(1), AsmReg::SP, 512).encode().is_err());
    }

    #[test]
    fn unknown_words_fail_to_decode() {
        assert_eq!(A64Inst::decode(0), Err(EncodingError::UnknownEncoding(0)));
        // 32-bit add is not a form the encoder produces.
        assert!(A64Inst::decode(0x0B01_0000).is_err());
    }

    #[test]
    fn immediate_materialization() {
        assert_eq!(mov_imm(x(0), 1), vec![A64Inst::MovWide { op: MovOp::Movz, rd: x(0), imm16: 1, hw: 0 }]);
        assert_eq!(mov_imm(x(0), 0).len(), 1);
        assert_eq!(mov_imm(x(0), -1), vec![A64Inst::MovWide { op: MovOp::Movn, rd: x(0), imm16: 0, hw: 0 }]);
        assert_eq!(mov_imm(x(0), 0x1234_0000_5678).len(), 2);
        assert_eq!(mov_imm(x(0), -2).len(), 1);
        assert_eq!(mov_imm(x(0), 0x1234_5678_9abc_def0).len(), 4);
    }

    #[test]
    fn condition_inversion() {
        assert_eq!(A64Cond::Eq.invert(), A64Cond::Ne);
        assert_eq!(A64Cond::Lt.invert(), A64Cond::Ge);
        assert_eq!(A64Cond::Hi.invert(), A64Cond::Ls);
        assert_eq!(A64Cond::from_cond(Cond::Uge), A64Cond::Hs);
    }
}
