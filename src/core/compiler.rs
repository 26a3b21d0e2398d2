// This module defines the compiler driver that runs the whole per-function pipeline. The
// Compiler borrows the TypeRegistry the input was typed against and owns the
// CompilationSession whose bump arena backs the transient state of every pass. For each
// IrFunc it builds SSA form, optionally verifies the CFG, SSA dominance, use counts and the
// phi placement against the iterated dominance frontier, splits critical edges so phi
// copies have a home, allocates registers, re-checks the rewritten function and the
// allocation when verification is on, and finally generates code. The arena is reset after
// each function whether or not it compiled, and SessionStats accumulate across the module.
// compile_module stops at the first failing function. CompileOptions carries the knobs the
// a64c driver exposes: how many registers the allocator may use, whether to verify, and
// whether to dump the SSA form before and after allocation.

//! Compiler driver and options.

use super::assembler::{CompiledFunction, SymbolEntry, Visibility};
use super::error::CompileResult;
use super::session::{CompilationSession, SessionStats};
use super::types::TypeRegistry;
use crate::arm64::calling_convention::{Aapcs64Assigner, CCAssigner, MAX_ALLOCATABLE};
use crate::arm64::function_codegen::generate;
use crate::arm64::regalloc::{allocate, check_allocation, Allocation};
use crate::ir::IrFunc;
use crate::ssa::builder::build_ssa;
use crate::ssa::critical::split_critical_edges;
use crate::ssa::dom::{check_phi_placement, DomTree};
use crate::ssa::verify::verify;
use crate::ssa::Func;

/// Knobs of one compiler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Number of allocatable registers (`x0` upwards), clamped to 4..=16.
    pub allocatable_regs: u8,
    /// Run the SSA and allocation checks.
    pub verify: bool,
    /// Print the SSA form before and after allocation.
    pub dump_ssa: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            allocatable_regs: MAX_ALLOCATABLE,
            verify: true,
            dump_ssa: false,
        }
    }
}

/// Everything produced for one function.
#[derive(Debug, Clone)]
pub struct FunctionArtifacts {
    /// SSA form after register allocation.
    pub func: Func,
    pub allocation: Allocation,
    pub phis_created: usize,
    pub phis_removed: usize,
    pub compiled: CompiledFunction,
}

/// Drives SSA construction, allocation and code generation.
pub struct Compiler<'t> {
    types: &'t TypeRegistry,
    options: CompileOptions,
    session: CompilationSession,
}

impl<'t> Compiler<'t> {
    pub fn new(types: &'t TypeRegistry, options: CompileOptions) -> Self {
        Self {
            types,
            options,
            session: CompilationSession::new(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    /// Compile one function to machine code.
    pub fn compile_function(&mut self, ir: &IrFunc) -> CompileResult<CompiledFunction> {
        Ok(self.compile_function_artifacts(ir)?.compiled)
    }

    /// Compile one function, keeping the allocated SSA form and the
    /// allocator's report.
    pub fn compile_function_artifacts(&mut self, ir: &IrFunc) -> CompileResult<FunctionArtifacts> {
        self.session.set_current_function(&ir.name);
        let result = self.run_pipeline(ir);
        self.session.reset_function_state();
        if let Err(err) = &result {
            log::debug!("{}: compilation failed: {err}", ir.name);
        }
        result
    }

    /// Compile every function, stopping at the first failure.
    pub fn compile_module(&mut self, funcs: &[IrFunc]) -> CompileResult<Vec<CompiledFunction>> {
        let mut compiled = Vec::with_capacity(funcs.len());
        for ir in funcs {
            compiled.push(self.compile_function(ir)?);
        }
        log::debug!("module done:\n{}", self.session.stats());
        Ok(compiled)
    }

    fn run_pipeline(&mut self, ir: &IrFunc) -> CompileResult<FunctionArtifacts> {
        let types = self.types;
        let built = build_ssa(ir, types, self.session.arena())?;
        let mut func = built.func;
        log::debug!(
            "{}: SSA built, {} blocks, {} values, {} phis ({} created, {} removed)",
            func.name,
            func.blocks.len(),
            func.values.len(),
            func.phi_count(),
            built.phis_created,
            built.phis_removed
        );

        if self.options.verify {
            verify(&func)?;
            let dom = DomTree::compute(&func);
            check_phi_placement(&func, &dom, &built.phi_def_sites)?;
        }
        let split = split_critical_edges(&mut func);
        if split > 0 {
            log::debug!("{}: split {split} critical edges", func.name);
        }
        if self.options.dump_ssa {
            println!("{}", func.dump(types));
        }

        let cc = Aapcs64Assigner::new(self.options.allocatable_regs);
        let allocation = allocate(&mut func, types, cc.get_ccinfo().allocatable_regs)?;
        if self.options.verify {
            verify(&func)?;
            check_allocation(&func)?;
        }
        if self.options.dump_ssa {
            println!("{}", func.dump(types));
        }

        let output = generate(&func, types, &allocation, self.session.arena())?;
        let size = output.code.len();
        let compiled = CompiledFunction {
            name: func.name.clone(),
            symbol: SymbolEntry {
                name: func.name.clone(),
                offset: 0,
                size: size as u64,
                visibility: Visibility::Global,
            },
            code: output.code,
            relocations: output.relocations,
            frame_size: output.frame_size,
        };

        self.session.record_function_compiled(&func.name, size);
        self.session.record_phis(built.phis_created, built.phis_removed);
        self.session.record_spill_code(allocation.spills, allocation.reloads);
        self.session.record_call_sites(allocation.call_sites);
        log::info!(
            "compiled {}: {} bytes, frame {} bytes, {} spills, {} reloads",
            func.name,
            size,
            compiled.frame_size,
            allocation.spills,
            allocation.reloads
        );

        Ok(FunctionArtifacts {
            func,
            allocation,
            phis_created: built.phis_created,
            phis_removed: built.phis_removed,
            compiled,
        })
    }
}
