// These tests look at the instruction words the code generator produces. Signed remainder
// is a division followed by a multiply-subtract. Arithmetic on narrow signed integers is
// followed by a sign extension so registers always hold canonical values. Every branch in a
// loop must land on an instruction inside the function, including the backward edge. A
// value spilled under register pressure is stored into the frame with an SP-relative store
// and read back with an SP-relative load, and the prologue and epilogue bracket the body.

//! Generated instruction sequences.

use a64_backend::arm64::encoder::{disassemble, A64Inst, BitfieldOp, DataOp2, DataOp3, MemOp, PairMode};
use a64_backend::core::{AsmReg, CompileOptions, Compiler, CompiledFunction, TypeRegistry};
use a64_backend::test_ir::parse_module;

fn compile_with(text: &str, regs: u8) -> CompiledFunction {
    let mut types = TypeRegistry::new();
    let funcs = parse_module(text, &mut types).unwrap();
    let options = CompileOptions {
        allocatable_regs: regs,
        ..CompileOptions::default()
    };
    let mut compiler = Compiler::new(&types, options);
    compiler.compile_function(&funcs[0]).unwrap()
}

fn decode(func: &CompiledFunction) -> Vec<A64Inst> {
    func.words()
        .into_iter()
        .map(|w| A64Inst::decode(w).unwrap_or_else(|e| panic!("{w:#010x}: {e}")))
        .collect()
}

#[test]
fn signed_remainder_uses_msub() {
    let func = compile_with(
        "
func srem(i64, i64) -> i64 {
entry:
  %a = param 0
  %b = param 1
  %r = rem %a, %b
  ret %r
}
",
        16,
    );
    let insts = decode(&func);
    let div = insts
        .iter()
        .position(|i| matches!(i, A64Inst::DataProc2 { op: DataOp2::SDiv, .. }))
        .unwrap();
    assert!(matches!(insts[div + 1], A64Inst::DataProc3 { op: DataOp3::Msub, .. }));
}

#[test]
fn narrow_signed_add_is_sign_extended() {
    let func = compile_with(
        "
func add8(i8, i8) -> i8 {
entry:
  %a = param 0
  %b = param 1
  %c = add %a, %b
  ret %c
}
",
        16,
    );
    let insts = decode(&func);
    let add = insts
        .iter()
        .position(|i| matches!(i, A64Inst::AddSubReg { .. }))
        .unwrap();
    match insts[add + 1] {
        A64Inst::Bitfield { op: BitfieldOp::Sbfm, immr: 0, imms: 7, .. } => {}
        other => panic!("expected sxtb after add, got {other:?}\n{:#?}", disassemble(&func.code)),
    }
}

#[test]
fn loop_branches_stay_inside_the_function() {
    let func = compile_with(
        "
func sum(i64) -> i64 {
  local i: i64
  local s: i64
entry:
  %z = const i64 0
  store.local i, %z
  store.local s, %z
  jump head
head:
  %i = load.local i
  %n = param 0
  %c = cmp slt %i, %n
  br %c, body, done
body:
  %i = load.local i
  %s = load.local s
  %s2 = add %s, %i
  store.local s, %s2
  %one = const i64 1
  %i2 = add %i, %one
  store.local i, %i2
  jump head
done:
  %s = load.local s
  ret %s
}
",
        16,
    );
    let insts = decode(&func);
    let len = (insts.len() * 4) as i64;
    let mut backward = 0;
    for (index, inst) in insts.iter().enumerate() {
        let offset = match *inst {
            A64Inst::Branch { link: false, offset }
            | A64Inst::BranchCond { offset, .. }
            | A64Inst::CompareBranch { offset, .. } => offset as i64,
            _ => continue,
        };
        let target = index as i64 * 4 + offset;
        assert!((0..len).contains(&target), "branch at {index} leaves the function");
        if offset < 0 {
            backward += 1;
        }
    }
    assert_eq!(backward, 1);
    assert!(func.relocations.is_empty());
}

#[test]
fn spilled_value_round_trips_through_the_frame() {
    let func = compile_with(
        "
func pressure(i64) -> i64 {
entry:
  %a = param 0
  %k1 = const i64 3
  %v1 = mul %a, %k1
  %k2 = const i64 4
  %v2 = mul %a, %k2
  %k3 = const i64 5
  %v3 = mul %a, %k3
  %k4 = const i64 6
  %v4 = mul %a, %k4
  %k5 = const i64 7
  %v5 = mul %a, %k5
  %s1 = add %v1, %v2
  %s2 = add %s1, %v3
  %s3 = add %s2, %v4
  %s4 = add %s3, %v5
  ret %s4
}
",
        4,
    );
    let insts = decode(&func);
    let sp_access = |load: bool| {
        insts.iter().any(|i| match *i {
            A64Inst::LoadStore { op, rn, .. } => rn == AsmReg::SP && (op != MemOp::Store) == load,
            A64Inst::LoadStorePair { load: l, rn, mode: PairMode::Offset, .. } => rn == AsmReg::SP && l == load,
            _ => false,
        })
    };
    assert!(sp_access(false), "no spill store");
    assert!(sp_access(true), "no reload");

    assert!(matches!(
        insts[0],
        A64Inst::LoadStorePair { load: false, mode: PairMode::PreIndex, rt, .. } if rt == AsmReg::FP
    ));
    assert!(matches!(insts.last(), Some(A64Inst::Ret { rn }) if *rn == AsmReg::LR));
    assert!(func.frame_size >= 32);
}

#[test]
fn widened_call_result_is_extended_once() {
    let func = compile_with(
        "
func widen(i64) -> i64 {
entry:
  %a = param 0
  %n = call i32 @get(%a)
  %w = sext i64 %n
  ret %w
}
",
        16,
    );
    let insts = decode(&func);
    let sxtw = insts
        .iter()
        .filter(|i| matches!(i, A64Inst::Bitfield { op: BitfieldOp::Sbfm, immr: 0, imms: 31, .. }))
        .count();
    assert_eq!(sxtw, 1, "{:#?}", disassemble(&func.code));
}

#[test]
fn pair_in_the_middle_of_a_module() {
    let mut types = TypeRegistry::new();
    let funcs = parse_module(
        "
func swap(i64, i64) -> {i64, i64} {
entry:
  %a = param 0
  %b = param 1
  %p = pair {i64, i64} %b, %a
  %q = copy %p
  ret %q
}

func first(i64, i64) -> i64 {
entry:
  %a = param 0
  %b = param 1
  %p = pair {i64, i64} %a, %b
  %x = extract %p, 0
  ret %x
}
",
        &mut types,
    )
    .unwrap();
    assert_eq!(funcs.len(), 2);
    let mut compiler = Compiler::new(&types, CompileOptions::default());
    let compiled = compiler.compile_module(&funcs).unwrap();
    assert_eq!(compiled.len(), 2);
    for func in &compiled {
        assert!(matches!(decode(func).last(), Some(A64Inst::Ret { .. })));
    }
}
