// This module gathers the target-independent infrastructure the backend passes share. It
// exports the type registry the input is typed against, the error enum every pass reports
// through, the compilation session with its per-function bump arena and statistics, the
// register file the allocator keeps its bookkeeping in, value locations and the stack
// frame layout, the parallel-move sequencer used for phi copies and call setup, the
// compiler driver that runs the whole pipeline, and the ELF writer at the crate edge.

//! Core infrastructure shared by all passes.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch memory using `bumpalo`, reset after every function
//! - Compilation statistics
//!
//! ## Register Bookkeeping (`register_file`)
//! - Occupant and dirty state per register
//! - Register sets as bitsets
//!
//! ## Locations (`value_assignment`)
//! - Register, register pair, stack slot and immediate locations
//! - Frame layout with locals, spill area and outgoing arguments
//!
//! ## Driver (`compiler`) and Output (`assembler`)
//! - `Compiler` runs SSA construction, allocation and code generation
//! - `ElfAssembler` writes AArch64 relocatable objects

pub mod assembler;
pub mod compiler;
pub mod error;
pub mod parallel_move;
pub mod register_file;
pub mod session;
pub mod types;
pub mod value_assignment;

pub use assembler::{CompiledFunction, ElfAssembler, Relocation, RelocationKind, SymbolEntry, Visibility};
pub use compiler::{CompileOptions, Compiler, FunctionArtifacts};
pub use error::{CompileError, CompileResult};
pub use parallel_move::{sequentialize, PartMove};
pub use register_file::{AsmReg, RegBitSet, RegisterFile};
pub use session::{CompilationSession, SessionStats};
pub use types::{TypeId, TypeRegistry};
pub use value_assignment::{FrameLayout, PartLocation, StackSlot, ValueLocation};
