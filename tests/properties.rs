// These tests check structural properties of the passes on a small corpus of programs that
// exercise loops, nested control flow, swaps through phis, calls inside loops, narrow
// integer types and aggregates. Every program must convert to SSA form in which each use is
// dominated by its definition and every recorded use count matches. The dominator tree must
// agree with brute force path enumeration: a block dominates another exactly when removing
// it disconnects the other from the entry. Liveness must be a fixed point, so one more
// round of the dataflow equations changes nothing. Register allocation must be sound for
// every register budget from the smallest to the largest, meaning no two values that are
// live at the same time share a register and no register value survives a call.

//! Property checks over a corpus of programs.

use std::collections::VecDeque;

use bumpalo::Bump;

use a64_backend::arm64::regalloc::check_allocation;
use a64_backend::core::{CompileOptions, Compiler, TypeId, TypeRegistry};
use a64_backend::ir::IrFunc;
use a64_backend::ssa::builder::build_ssa;
use a64_backend::ssa::dom::DomTree;
use a64_backend::ssa::liveness::Liveness;
use a64_backend::ssa::verify::{check_ssa_dominance, verify};
use a64_backend::ssa::{BlockId, Func};
use a64_backend::test_ir::parse_module;

const CORPUS: &str = "
; i, j nested loops accumulating into s
func nested(i64) -> i64 {
  local i: i64
  local j: i64
  local s: i64
entry:
  %z = const i64 0
  store.local i, %z
  store.local s, %z
  jump outer
outer:
  %i = load.local i
  %n = param 0
  %c = cmp slt %i, %n
  br %c, outer_body, done
outer_body:
  %z = const i64 0
  store.local j, %z
  jump inner
inner:
  %j = load.local j
  %i = load.local i
  %c = cmp slt %j, %i
  br %c, inner_body, outer_next
inner_body:
  %s = load.local s
  %j = load.local j
  %t = mul %j, %j
  %s2 = add %s, %t
  store.local s, %s2
  %one = const i64 1
  %j2 = add %j, %one
  store.local j, %j2
  jump inner
outer_next:
  %i = load.local i
  %one = const i64 1
  %i2 = add %i, %one
  store.local i, %i2
  jump outer
done:
  %s = load.local s
  ret %s
}

; a and b swap every iteration
func swap(i64, i64, i64) -> i64 {
  local a: i64
  local b: i64
  local i: i64
entry:
  %x = param 0
  %y = param 1
  %z = const i64 0
  store.local a, %x
  store.local b, %y
  store.local i, %z
  jump head
head:
  %i = load.local i
  %n = param 2
  %c = cmp slt %i, %n
  br %c, body, done
body:
  %a = load.local a
  %b = load.local b
  store.local a, %b
  store.local b, %a
  %i = load.local i
  %one = const i64 1
  %i2 = add %i, %one
  store.local i, %i2
  jump head
done:
  %a = load.local a
  %b = load.local b
  %r = sub %a, %b
  ret %r
}

func calls(i64) -> i64 {
  local acc: i64
  local i: i64
entry:
  %z = const i64 0
  store.local acc, %z
  store.local i, %z
  jump head
head:
  %i = load.local i
  %n = param 0
  %c = cmp ult %i, %n
  br %c, body, done
body:
  %acc = load.local acc
  %i = load.local i
  %r = call i64 @step(%acc, %i)
  %one = const i64 1
  %i2 = add %i, %one
  store.local i, %i2
  store.local acc, %r
  jump head
done:
  %acc = load.local acc
  ret %acc
}

; diamond whose arms define different values
func select(i32, i32) -> i32 {
  local m: i32
entry:
  %a = param 0
  %b = param 1
  %c = cmp sgt %a, %b
  br %c, left, right
left:
  %a = param 0
  store.local m, %a
  jump join
right:
  %b = param 1
  %d = neg %b
  store.local m, %d
  jump join
join:
  %m = load.local m
  ret %m
}

func narrow(i8, u16, ptr) -> i32 {
entry:
  %a = param 0
  %b = param 1
  %p = param 2
  %x = sext i32 %a
  %y = zext i32 %b
  %s = add %x, %y
  %q = offset %p, 4
  store %q, %s
  %l = load i32 %q
  %t = trunc i8 %l
  %u = sext i32 %t
  ret %u
}

func flip(slice) -> {i64, i64} {
entry:
  %s = param 0
  %lo = extract %s, 0
  %hi = extract %s, 1
  %w = copy %hi
  %r = pair {i64, i64} %w, %hi
  ret %r
}

func big(i64, i64, i64) -> {i64, i64, i64} {
entry:
  %a = param 0
  %b = param 1
  %c = param 2
  %r = pair {i64, i64, i64} %c, %b, %a
  ret %r
}

; address-taken local lives in memory across a branch
func mem_local(i64) -> i64 {
  local x: i64
  local buf: {i64, i64, i64}
entry:
  %p = addr x
  %v = param 0
  store %p, %v
  %q = addr buf
  zero %q, {i64, i64, i64}
  %z = const i64 0
  %c = cmp eq %v, %z
  br %c, yes, no
yes:
  %p = addr x
  %one = const i64 1
  store %p, %one
  jump out
no:
  jump out
out:
  %p = addr x
  %r = load i64 %p
  %g = global @counter
  store %g, %r
  ret %r
}

; loop entered from two places, so neither header dominates the other
func irreducible(i64) -> i64 {
  local k: i64
entry:
  %n = param 0
  store.local k, %n
  %z = const i64 0
  %c = cmp eq %n, %z
  br %c, left, right
left:
  %k = load.local k
  %one = const i64 1
  %d = sub %k, %one
  store.local k, %d
  %z = const i64 0
  %c = cmp sle %d, %z
  br %c, exit, right
right:
  %k = load.local k
  %two = const i64 2
  %d = sub %k, %two
  store.local k, %d
  %z = const i64 0
  %c = cmp sle %d, %z
  br %c, exit, left
exit:
  %k = load.local k
  ret %k
}
";

fn corpus(types: &mut TypeRegistry) -> Vec<IrFunc> {
    parse_module(CORPUS, types).unwrap()
}

/// Blocks reachable from the entry without passing through `removed`.
fn reachable_without(func: &Func, removed: Option<BlockId>) -> Vec<bool> {
    let mut seen = vec![false; func.blocks.len()];
    if removed == Some(func.entry) {
        return seen;
    }
    let mut queue = VecDeque::from([func.entry]);
    seen[func.entry.index()] = true;
    while let Some(b) = queue.pop_front() {
        for &s in &func.block(b).succs {
            if Some(s) != removed && !seen[s.index()] {
                seen[s.index()] = true;
                queue.push_back(s);
            }
        }
    }
    seen
}

#[test]
fn ssa_form_is_well_formed() {
    let mut types = TypeRegistry::new();
    let funcs = corpus(&mut types);
    assert_eq!(funcs.len(), 9);
    for ir in &funcs {
        let arena = Bump::new();
        let built = build_ssa(ir, &types, &arena).unwrap();
        verify(&built.func).unwrap_or_else(|e| panic!("{}: {e}\n{}", ir.name, built.func.dump(&types)));
        let dom = DomTree::compute(&built.func);
        check_ssa_dominance(&built.func, &dom).unwrap();
    }
}

#[test]
fn dominance_matches_path_enumeration() {
    let mut types = TypeRegistry::new();
    for ir in &corpus(&mut types) {
        let arena = Bump::new();
        let func = build_ssa(ir, &types, &arena).unwrap().func;
        let dom = DomTree::compute(&func);
        let reachable = reachable_without(&func, None);
        for a in func.block_ids() {
            let without_a = reachable_without(&func, Some(a));
            for b in func.block_ids() {
                if !reachable[a.index()] || !reachable[b.index()] {
                    continue;
                }
                let expected = a == b || !without_a[b.index()];
                assert_eq!(
                    dom.dominates(a, b),
                    expected,
                    "{}: dominates({a}, {b})",
                    func.name
                );
            }
        }
    }
}

#[test]
fn irreducible_loop_headers_do_not_dominate_each_other() {
    let mut types = TypeRegistry::new();
    let ir = corpus(&mut types).into_iter().find(|f| f.name == "irreducible").unwrap();
    let arena = Bump::new();
    let func = build_ssa(&ir, &types, &arena).unwrap().func;
    let dom = DomTree::compute(&func);
    let named = |name: &str| func.block_ids().find(|&b| func.block(b).name == name).unwrap();
    let (left, right) = (named("left"), named("right"));
    assert!(!dom.dominates(left, right));
    assert!(!dom.dominates(right, left));
    assert_eq!(dom.idom(left), Some(func.entry));
    assert_eq!(dom.idom(right), Some(func.entry));
}

#[test]
fn liveness_is_a_fixed_point() {
    let mut types = TypeRegistry::new();
    for ir in &corpus(&mut types) {
        let arena = Bump::new();
        let func = build_ssa(ir, &types, &arena).unwrap().func;
        let mut live = Liveness::compute(&func);
        let before: Vec<usize> = func.block_ids().map(|b| live.live_in(b).len()).collect();
        assert!(!live.iterate_once(&func), "{}: liveness changed", func.name);
        let after: Vec<usize> = func.block_ids().map(|b| live.live_in(b).len()).collect();
        assert_eq!(before, after);
        assert!(live.live_in(func.entry).is_empty(), "{}: values live into entry", func.name);
    }
}

#[test]
fn allocation_is_sound_for_every_budget() {
    let mut types = TypeRegistry::new();
    let funcs = corpus(&mut types);
    for regs in [4u8, 5, 8, 16] {
        let options = CompileOptions {
            allocatable_regs: regs,
            ..CompileOptions::default()
        };
        let mut compiler = Compiler::new(&types, options);
        for ir in &funcs {
            let out = compiler
                .compile_function_artifacts(ir)
                .unwrap_or_else(|e| panic!("{} with {regs} registers: {e}", ir.name));
            check_allocation(&out.func).unwrap();
            verify(&out.func).unwrap();
            assert_eq!(out.compiled.code.len() % 4, 0);
            for v in &out.func.values {
                if let Some(loc) = v.loc {
                    for r in loc.regs() {
                        assert!(r.id() < regs || r.id() == 8, "{}: {r} outside the budget", ir.name);
                    }
                }
            }
        }
        assert_eq!(compiler.stats().functions_compiled, funcs.len());
    }
}

#[test]
fn irreducible_loop_compiles_with_checks_enabled() {
    let mut types = TypeRegistry::new();
    let ir = corpus(&mut types).into_iter().find(|f| f.name == "irreducible").unwrap();
    for regs in [4u8, 16] {
        let options = CompileOptions {
            allocatable_regs: regs,
            verify: true,
            ..CompileOptions::default()
        };
        let out = Compiler::new(&types, options)
            .compile_function_artifacts(&ir)
            .unwrap_or_else(|e| panic!("{regs} registers: {e}"));
        check_allocation(&out.func).unwrap();
        assert!(out.compiled.relocations.is_empty());
    }

    // Only `k` needs merging; memory is never written inside the loop.
    let arena = Bump::new();
    let built = build_ssa(&ir, &types, &arena).unwrap();
    let phis: Vec<_> = built.func.block_ids().flat_map(|b| built.func.phis(b)).collect();
    assert_eq!(phis.len(), 3);
    assert!(phis.iter().all(|&p| built.func.value(p).ty == TypeId::I64));
}

#[test]
fn scarce_registers_cost_spill_code() {
    let mut types = TypeRegistry::new();
    let funcs = corpus(&mut types);
    let calls = funcs.iter().find(|f| f.name == "calls").unwrap();
    let mut compiler = Compiler::new(&types, CompileOptions::default());
    let out = compiler.compile_function_artifacts(calls).unwrap();
    // The bound and the counter are live across the call.
    assert!(out.allocation.spills >= 2);
    assert!(out.allocation.makes_calls());
}
