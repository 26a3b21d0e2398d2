//! AArch64-specific components.
//!
//! This module contains everything that depends on the target:
//! - Instruction word encoding and decoding
//! - AAPCS64 argument and result assignment
//! - Local register allocation with spilling
//! - Per-function code generation with branch fix-ups

pub mod calling_convention;
pub mod encoder;
pub mod function_codegen;
pub mod regalloc;

pub use calling_convention::{Aapcs64Assigner, CCAssigner, CCAssignment, Signature};
pub use encoder::{A64Inst, EncodingError};
pub use function_codegen::{generate, CodegenOutput};
pub use regalloc::{allocate, check_allocation, Allocation};
