// These tests run whole functions through the pipeline and check the outcomes a user of the
// backend relies on. A two-parameter add must take its operands from x0 and x1, consist of a
// single add followed by a return, and need no stack frame. A straight-line function holding
// one more value live than there are allocatable registers must spill and reload, and its
// frame must grow by exactly one slot compared with a variant that fits. A counting loop must
// get exactly one phi at its header, while an if/else assigning the same literal on both arms
// must not get any phi at the join. Finally a call with nine word arguments must pass eight
// in x0-x7 and the ninth at the bottom of the outgoing area, and a function declaring nine
// parameters must find the ninth above its frame record.

//! End-to-end compilation scenarios.

use bumpalo::Bump;

use a64_backend::arm64::calling_convention::expand_call;
use a64_backend::arm64::encoder::{A64Inst, AddSubOp};
use a64_backend::core::{
    AsmReg, CompileOptions, Compiler, FunctionArtifacts, PartLocation, RelocationKind, StackSlot, TypeId,
    TypeRegistry,
};
use a64_backend::ir::{BinOp, IrBuilder, IrFunc};
use a64_backend::ssa::builder::build_ssa;
use a64_backend::ssa::{BlockId, Func, Op, ValueId};
use a64_backend::test_ir::parse_module;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile_ir(types: &TypeRegistry, ir: &IrFunc, regs: u8) -> FunctionArtifacts {
    let options = CompileOptions {
        allocatable_regs: regs,
        ..CompileOptions::default()
    };
    let mut compiler = Compiler::new(types, options);
    compiler.compile_function_artifacts(ir).unwrap()
}

fn parse_one(text: &str, types: &mut TypeRegistry) -> IrFunc {
    let mut funcs = parse_module(text, types).unwrap();
    assert_eq!(funcs.len(), 1);
    funcs.remove(0)
}

fn decode_all(code: &[u8]) -> Vec<A64Inst> {
    code.chunks(4)
        .map(|c| A64Inst::decode(u32::from_le_bytes([c[0], c[1], c[2], c[3]])).unwrap())
        .collect()
}

fn block_named(func: &Func, name: &str) -> BlockId {
    func.block_ids()
        .find(|&b| func.block(b).name == name)
        .unwrap_or_else(|| panic!("no block {name}"))
}

const ADD: &str = "
func add(i64, i64) -> i64 {
entry:
  %a = param 0
  %b = param 1
  %c = add %a, %b
  ret %c
}
";

#[test]
fn two_parameter_add() {
    init_logging();
    let mut types = TypeRegistry::new();
    let ir = parse_one(ADD, &mut types);
    let out = compile_ir(&types, &ir, 16);

    let params = &out.allocation.signature.params;
    assert_eq!(params[0].reg, Some(AsmReg::X0));
    assert_eq!(params[1].reg, Some(AsmReg::X1));

    let insts = decode_all(&out.compiled.code);
    let adds = insts
        .iter()
        .filter(|i| matches!(i, A64Inst::AddSubReg { op: AddSubOp::Add, .. }))
        .count();
    let rets = insts.iter().filter(|i| matches!(i, A64Inst::Ret { .. })).count();
    assert_eq!(adds, 1);
    assert_eq!(rets, 1);
    assert_eq!(insts.len(), 2);
    assert_eq!(out.compiled.frame_size, 0);
    assert!(out.compiled.relocations.is_empty());
}

/// `count` products of the parameter, all live until a final reduction.
fn pressure(count: usize) -> IrFunc {
    let mut b = IrBuilder::new("pressure", &[TypeId::I64], TypeId::I64);
    let entry = b.block("entry");
    b.switch_to(entry);
    let a = b.param(0);
    let mut live = Vec::new();
    for i in 0..count {
        let k = b.const_int(TypeId::I64, i as i64 + 3);
        live.push(b.binary(BinOp::Mul, a, k));
    }
    let mut acc = live[0];
    for &v in &live[1..] {
        acc = b.binary(BinOp::Add, acc, v);
    }
    b.ret(Some(acc));
    b.finish()
}

#[test]
fn one_value_too_many_spills_one_slot() {
    init_logging();
    let types = TypeRegistry::new();
    let fits = compile_ir(&types, &pressure(3), 4);
    let over = compile_ir(&types, &pressure(4), 4);

    assert_eq!(fits.allocation.spills, 0);
    assert_eq!(fits.allocation.spill_size, 0);

    assert!(over.allocation.spills >= 1);
    assert!(over.allocation.reloads >= 1);
    assert_eq!(over.allocation.spill_slots, 1);
    assert_eq!(over.allocation.spill_size, fits.allocation.spill_size + 8);
    assert!(over.compiled.frame_size > fits.compiled.frame_size);

    let ops: Vec<Op> = over.func.values.iter().map(|v| v.op).collect();
    assert!(ops.contains(&Op::StoreReg));
    assert!(ops.contains(&Op::LoadReg));
}

const COUNT: &str = "
func count(i64) -> i64 {
  local i: i64
entry:
  %zero = const i64 0
  store.local i, %zero
  jump header
header:
  %cur = load.local i
  %n = param 0
  %c = cmp slt %cur, %n
  br %c, body, exit
body:
  %cur = load.local i
  %one = const i64 1
  %next = add %cur, %one
  store.local i, %next
  jump header
exit:
  %out = load.local i
  ret %out
}
";

#[test]
fn loop_gets_one_header_phi() {
    init_logging();
    let mut types = TypeRegistry::new();
    let ir = parse_one(COUNT, &mut types);
    let arena = Bump::new();
    let built = build_ssa(&ir, &types, &arena).unwrap();
    let func = &built.func;

    let header = block_named(func, "header");
    let phis: Vec<_> = func.phis(header).collect();
    assert_eq!(phis.len(), 1);
    assert_eq!(func.phi_count(), 1);
    let args = func.args(phis[0]);
    assert_eq!(args.len(), 2);
    assert_ne!(args[0], args[1]);
    assert_eq!(func.value(phis[0]).ty, TypeId::I64);

    let out = compile_ir(&types, &ir, 16);
    assert!(!out.compiled.code.is_empty());
}

const SAME_LITERAL: &str = "
func pick(i64) -> i64 {
  local x: i64
entry:
  %p = param 0
  %z = const i64 0
  %c = cmp sgt %p, %z
  br %c, then, else
then:
  %k = const i64 7
  store.local x, %k
  jump join
else:
  %k = const i64 7
  store.local x, %k
  jump join
join:
  %v = load.local x
  ret %v
}
";

#[test]
fn same_literal_on_both_arms_needs_no_phi() {
    init_logging();
    let mut types = TypeRegistry::new();
    let ir = parse_one(SAME_LITERAL, &mut types);
    let arena = Bump::new();
    let built = build_ssa(&ir, &types, &arena).unwrap();
    let func = &built.func;

    assert!(built.phis_removed >= 1);
    assert_eq!(func.phi_count(), 0);

    let join = block_named(func, "join");
    let ret = func.block(join).control.unwrap();
    let returned = func.data_args(ret)[0];
    assert_eq!(func.value(returned).op, Op::Const);
    assert_eq!(func.value(returned).aux.int(), Some(7));
    let sevens = func
        .values
        .iter()
        .filter(|v| v.op == Op::Const && v.aux.int() == Some(7))
        .count();
    assert_eq!(sevens, 1);

    compile_ir(&types, &ir, 16);
}

const NINE_ARGS: &str = "
func caller() -> i64 {
entry:
  %a1 = const i64 1
  %a2 = const i64 2
  %a3 = const i64 3
  %a4 = const i64 4
  %a5 = const i64 5
  %a6 = const i64 6
  %a7 = const i64 7
  %a8 = const i64 8
  %a9 = const i64 9
  %r = call i64 @callee(%a1, %a2, %a3, %a4, %a5, %a6, %a7, %a8, %a9)
  ret %r
}
";

#[test]
fn ninth_argument_goes_on_the_stack() {
    init_logging();
    let mut types = TypeRegistry::new();
    let ir = parse_one(NINE_ARGS, &mut types);
    let out = compile_ir(&types, &ir, 16);

    let call = out
        .func
        .values
        .iter()
        .position(|v| v.op == Op::Call)
        .map(ValueId::new)
        .unwrap();
    let layout = expand_call(&out.func, &types, call).unwrap();
    assert_eq!(layout.parts.len(), 9);
    for (i, part) in layout.parts.iter().take(8).enumerate() {
        assert_eq!(part.dest, PartLocation::Reg(AsmReg::new(i as u8)));
    }
    assert_eq!(layout.parts[8].dest, PartLocation::Stack(StackSlot::Outgoing(0)));
    assert_eq!(layout.stack_size, 16);
    assert_eq!(out.allocation.outgoing_size, 16);

    // Frame record plus the 16-byte outgoing area.
    assert_eq!(out.compiled.frame_size, 32);
    assert_eq!(out.compiled.relocations.len(), 1);
    assert_eq!(out.compiled.relocations[0].kind, RelocationKind::Call26);
    assert_eq!(out.compiled.relocations[0].symbol, "callee");
}

#[test]
fn ninth_parameter_is_read_from_the_caller_frame() {
    init_logging();
    let mut types = TypeRegistry::new();
    let ir = parse_one(
        "
func last(i64, i64, i64, i64, i64, i64, i64, i64, i64) -> i64 {
entry:
  %x = param 8
  ret %x
}
",
        &mut types,
    );
    let out = compile_ir(&types, &ir, 16);
    let sig = &out.allocation.signature;
    for p in &sig.params[..8] {
        assert!(p.reg.is_some());
    }
    assert_eq!(sig.params[8].reg, None);
    assert_eq!(sig.params[8].stack_off, Some(0));
    assert_eq!(sig.stack_size, 16);
    assert!(sig.uses_stack());

    let insts = decode_all(&out.compiled.code);
    assert!(matches!(insts[0], A64Inst::LoadStorePair { load: false, .. }));
    assert!(matches!(insts.last(), Some(A64Inst::Ret { .. })));
}
