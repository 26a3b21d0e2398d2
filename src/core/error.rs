// This module defines error types for the backend using the thiserror crate. The core
// assumes a well-typed input program, so every variant here is an internal invariant
// violation rather than a user diagnostic: malformed IR handed over by the lowering step,
// a local read with no reaching definition, a use not dominated by its definition, an
// inconsistent predecessor/successor pair, a register allocation that ran dry or assigned
// one register to two simultaneously live values, a branch displacement that does not fit
// its instruction field, or an operand the encoder cannot represent. Each variant carries
// the offending function together with the value, block or register involved so the
// driver can report exactly where compilation stopped. CompileResult<T> is the usual
// convenience alias.

//! Error types for the backend.
//!
//! All errors are fatal for the function being compiled.

use thiserror::Error;

use crate::arm64::encoder::EncodingError;

/// Main error type for function compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{func}: invalid IR: {reason}")]
    InvalidIr { func: String, reason: String },

    #[error("{func}: local `{local}` read in {block} has no reaching definition")]
    UndefinedVariable {
        func: String,
        local: String,
        block: String,
    },

    #[error("{func}: inconsistent CFG at {block}: {reason}")]
    CfgInconsistent {
        func: String,
        block: String,
        reason: String,
    },

    #[error("{func}: use of {value} in {block} is not dominated by its definition")]
    SsaDominance {
        func: String,
        value: String,
        block: String,
    },

    #[error("{func}: {value} records {found} uses, expected {expected}")]
    UseCount {
        func: String,
        value: String,
        expected: u32,
        found: u32,
    },

    #[error("{func}: phi {value} in {block} is outside the dominance frontier of its inputs")]
    PhiPlacement {
        func: String,
        value: String,
        block: String,
    },

    #[error("{func}: register allocation failed: {reason}")]
    RegisterAllocation { func: String, reason: String },

    #[error("{func}: {a} and {b} are both live in {reg}")]
    RegisterConflict {
        func: String,
        a: String,
        b: String,
        reg: String,
    },

    #[error("{func}: branch at +{offset:#x} cannot reach displacement {displacement} ({kind})")]
    BranchOutOfRange {
        func: String,
        offset: u32,
        displacement: i64,
        kind: &'static str,
    },

    #[error("{func}: unsupported type: {reason}")]
    UnsupportedType { func: String, reason: String },

    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("object file: {0}")]
    ObjectWrite(String),
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
