//! Compile a `.tir` module into an AArch64 ELF relocatable object.
//!
//! Usage: `a64c <input.tir> [-o out.o] [--regs N] [--no-verify] [--dump-ssa] [--disasm]`
//!
//! Log output is controlled through `RUST_LOG`.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};

use a64_backend::arm64::encoder::disassemble;
use a64_backend::test_ir::parse_module;
use a64_backend::{CompileOptions, CompileResult, Compiler, ElfAssembler, TypeRegistry};

#[derive(Parser, Debug)]
#[command(name = "a64c")]
#[command(about = "Compile textual IR to an AArch64 object file")]
struct Args {
    /// Input `.tir` file
    input: PathBuf,

    /// Output object file (defaults to the input with an `.o` extension)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Number of allocatable registers, 4 to 16
    #[arg(long = "regs", default_value_t = 16, value_parser = clap::value_parser!(u8).range(4..=16))]
    regs: u8,

    /// Skip the SSA and allocation checks
    #[arg(long = "no-verify")]
    no_verify: bool,

    /// Print the SSA form before and after register allocation
    #[arg(long = "dump-ssa")]
    dump_ssa: bool,

    /// Print the generated instructions of every function
    #[arg(long = "disasm")]
    disasm: bool,
}

fn run(args: &Args, source: &str) -> CompileResult<Vec<u8>> {
    let mut types = TypeRegistry::new();
    let funcs = parse_module(source, &mut types)?;
    let options = CompileOptions {
        allocatable_regs: args.regs,
        verify: !args.no_verify,
        dump_ssa: args.dump_ssa,
    };
    let mut compiler = Compiler::new(&types, options);
    let compiled = compiler.compile_module(&funcs)?;
    info!("{}", compiler.stats());

    if args.disasm {
        for func in &compiled {
            println!("{}:", func.name);
            for line in disassemble(&func.code) {
                println!("  {line}");
            }
        }
    }
    ElfAssembler::build_object(&compiled)
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let source = match fs::read_to_string(&args.input) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to read {}: {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let object = match run(&args, &source) {
        Ok(object) => object,
        Err(e) => {
            error!("{e}");
            eprintln!("a64c: {e}");
            process::exit(1);
        }
    };

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("o"));
    if let Err(e) = fs::write(&output, &object) {
        error!("Failed to write {}: {}", output.display(), e);
        process::exit(1);
    }
    info!("wrote {} ({} bytes)", output.display(), object.len());
}
