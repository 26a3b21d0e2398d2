//! a64-backend - SSA middle and back end for AArch64.
//!
//! The crate takes a typed, block-structured IR with mutable local slots and
//! produces encoded AArch64 machine code for each function, together with its
//! relocations and symbol entry.
//!
//! # Primary Usage
//!
//! ```ignore
//! use a64_backend::core::{CompileOptions, Compiler, TypeRegistry};
//! use a64_backend::test_ir::parse_module;
//!
//! let mut types = TypeRegistry::new();
//! let funcs = parse_module(source, &mut types)?;
//! let mut compiler = Compiler::new(&types, CompileOptions::default());
//! let compiled = compiler.compile_module(&funcs)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Pre-SSA input IR and its builder
//! - [`ssa`] - SSA form, construction, dominance, liveness, verification
//! - [`core`] - Shared infrastructure (types, registers, locations, driver)
//! - [`arm64`] - AArch64 encoder, calling convention, allocator, code generator
//! - [`test_ir`] - Textual IR used by tests and the `a64c` driver

/// Declares a `u32` index newtype with a display prefix.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn new(index: usize) -> Self {
                Self(index as u32)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

pub mod arm64;
pub mod core;
pub mod ir;
pub mod ssa;
pub mod test_ir;

pub use crate::core::{
    CompileError, CompileOptions, CompileResult, CompiledFunction, Compiler, ElfAssembler, TypeId,
    TypeRegistry,
};
