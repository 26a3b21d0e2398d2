// These tests check AAPCS64 placement as seen through compiled call sites and function
// signatures. Word arguments take x0-x7 in order and then stack words. Two-word arguments
// need two free registers, otherwise they and every later argument go
// to the stack at a 16-byte aligned offset. Arguments past the declared parameter count of a
// variadic callee always go to the stack. Results of up to two words come back in x0 and
// x1, and wider aggregates are returned through the address the caller passes in x8.

//! Calling convention placement.

use a64_backend::arm64::calling_convention::{expand_call, CallLayout, Signature};
use a64_backend::core::{
    AsmReg, CompileOptions, Compiler, FunctionArtifacts, PartLocation, StackSlot, TypeRegistry, ValueLocation,
};
use a64_backend::ssa::{Op, ValueId};
use a64_backend::test_ir::parse_module;

fn compile(text: &str) -> (TypeRegistry, FunctionArtifacts) {
    let mut types = TypeRegistry::new();
    let mut funcs = parse_module(text, &mut types).unwrap();
    let ir = funcs.remove(0);
    let out = Compiler::new(&types, CompileOptions::default())
        .compile_function_artifacts(&ir)
        .unwrap();
    (types, out)
}

fn only_call(types: &TypeRegistry, out: &FunctionArtifacts) -> CallLayout {
    let call = out
        .func
        .values
        .iter()
        .position(|v| v.op == Op::Call)
        .map(ValueId::new)
        .unwrap();
    expand_call(&out.func, types, call).unwrap()
}

fn reg(id: u8) -> PartLocation {
    PartLocation::Reg(AsmReg::new(id))
}

fn outgoing(offset: u32) -> PartLocation {
    PartLocation::Stack(StackSlot::Outgoing(offset))
}

#[test]
fn variadic_arguments_use_the_stack() {
    let (types, out) = compile(
        "
func log(ptr, i64, i32) {
entry:
  %fmt = param 0
  %x = param 1
  %y = param 2
  %n = call i32 @printf(%fmt, ...%x, %y)
  ret
}
",
    );
    let layout = only_call(&types, &out);
    let dests: Vec<PartLocation> = layout.parts.iter().map(|p| p.dest).collect();
    assert_eq!(dests, vec![reg(0), outgoing(0), outgoing(8)]);
    assert_eq!(layout.stack_size, 16);
    assert_eq!(layout.result, Some(ValueLocation::Reg(AsmReg::X0)));
}

#[test]
fn pair_argument_after_seven_words_goes_to_aligned_stack() {
    let (types, out) = compile(
        "
func f(i64, slice) {
entry:
  %w = param 0
  %s = param 1
  call @g(%w, %w, %w, %w, %w, %w, %w, %s, %w)
  ret
}
",
    );
    let layout = only_call(&types, &out);
    let dests: Vec<PartLocation> = layout.parts.iter().map(|p| p.dest).collect();
    let mut expected: Vec<PartLocation> = (0..7).map(reg).collect();
    // x7 stays unused; the slice and everything after it go to the stack.
    expected.extend([outgoing(0), outgoing(8), outgoing(16)]);
    assert_eq!(dests, expected);
    assert_eq!(layout.stack_size, 32);
    assert_eq!(out.allocation.outgoing_size, 32);
}

#[test]
fn pair_parameter_takes_consecutive_registers() {
    let (_, out) = compile(
        "
func len(i32, slice) -> i64 {
entry:
  %s = param 1
  %n = extract %s, 1
  ret %n
}
",
    );
    let sig: &Signature = &out.allocation.signature;
    assert_eq!(sig.params[0].reg, Some(AsmReg::X0));
    assert_eq!(sig.params[1].reg, Some(AsmReg::new(1)));
    assert_eq!(sig.params[1].consecutive, 2);
    assert_eq!(sig.param_location(1), Some(ValueLocation::RegPair(AsmReg::new(1), AsmReg::new(2))));
    assert!(!sig.uses_stack());
}

#[test]
fn wide_result_is_returned_through_x8() {
    let (_, out) = compile(
        "
func make(i64) -> {i64, i64, i64} {
entry:
  %a = param 0
  %r = pair {i64, i64, i64} %a, %a, %a
  ret %r
}
",
    );
    let sig = &out.allocation.signature;
    assert!(sig.indirect_result);
    assert_eq!(sig.result, None);
    // The caller's x8 does not consume an argument register.
    assert_eq!(sig.params[0].reg, Some(AsmReg::X0));
    let result_ptr = out.func.values.iter().find(|v| v.op == Op::ResultPtr).unwrap();
    assert_eq!(result_ptr.loc, Some(ValueLocation::Reg(AsmReg::X8)));
    assert!(out.func.values.iter().any(|v| v.op == Op::Move));
}

#[test]
fn two_word_result_comes_back_in_x0_x1() {
    let (types, out) = compile(
        "
func pair_of(i64) -> {i64, i64} {
entry:
  %a = param 0
  %r = call {i64, i64} @split(%a)
  ret %r
}
",
    );
    let layout = only_call(&types, &out);
    assert_eq!(layout.result, Some(ValueLocation::RegPair(AsmReg::X0, AsmReg::X1)));
    assert_eq!(layout.parts[0].dest, reg(0));
    let sig = &out.allocation.signature;
    assert_eq!(sig.result.and_then(|r| r.reg), Some(AsmReg::X0));
}
