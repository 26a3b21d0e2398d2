//! Structural and SSA invariant checks.
//!
//! Run after construction and again after register allocation when
//! verification is enabled. Every failure names the function and the
//! offending block or value.

use super::dom::DomTree;
use super::{BlockId, BlockKind, Func, Op, ValueId};
use crate::core::error::{CompileError, CompileResult};
use crate::core::types::TypeId;

/// Run every check on `func`.
pub fn verify(func: &Func) -> CompileResult<()> {
    check_cfg(func)?;
    let dom = DomTree::compute(func);
    check_ssa_dominance(func, &dom)?;
    check_use_counts(func)
}

fn cfg_error(func: &Func, block: BlockId, reason: impl Into<String>) -> CompileError {
    CompileError::CfgInconsistent {
        func: func.name.clone(),
        block: block.to_string(),
        reason: reason.into(),
    }
}

/// Edge lists mutually consistent, successor counts match block kinds,
/// phis first with one operand per predecessor.
pub fn check_cfg(func: &Func) -> CompileResult<()> {
    for b in func.block_ids() {
        let block = func.block(b);
        if block.succs.len() > 2 {
            return Err(cfg_error(func, b, "more than two successors"));
        }
        let expected = match block.kind {
            BlockKind::Plain => 1,
            BlockKind::If => 2,
            BlockKind::Ret => 0,
        };
        if block.succs.len() != expected {
            return Err(cfg_error(
                func,
                b,
                format!("{:?} block with {} successors", block.kind, block.succs.len()),
            ));
        }
        match (block.kind, block.control) {
            (BlockKind::If, Some(c)) if func.value(c).ty == TypeId::BOOL => {}
            (BlockKind::Ret, Some(c)) if func.value(c).op == Op::Ret => {}
            (BlockKind::Plain, None) => {}
            _ => return Err(cfg_error(func, b, "control value does not match block kind")),
        }

        for &s in &block.succs {
            let back = func.block(s).preds.iter().filter(|&&p| p == b).count();
            let fwd = block.succs.iter().filter(|&&x| x == s).count();
            if back != fwd {
                return Err(cfg_error(func, b, format!("edge to {s} missing from its predecessor list")));
            }
        }
        for &p in &block.preds {
            if !func.block(p).succs.contains(&b) {
                return Err(cfg_error(func, b, format!("predecessor {p} does not list it as successor")));
            }
        }

        let mut in_prefix = true;
        for &v in &block.values {
            let value = func.value(v);
            if value.block != b {
                return Err(cfg_error(func, b, format!("{v} records block {}", value.block)));
            }
            if value.op == Op::Phi {
                if !in_prefix {
                    return Err(cfg_error(func, b, format!("phi {v} after ordinary values")));
                }
                if value.arg_count() != block.preds.len() {
                    return Err(cfg_error(
                        func,
                        b,
                        format!("phi {v} has {} operands for {} predecessors", value.arg_count(), block.preds.len()),
                    ));
                }
            } else if !value.op.is_block_prefix() {
                in_prefix = false;
            }
        }
    }
    Ok(())
}

/// Position of every placed value: (block, index within the block).
fn positions(func: &Func) -> Vec<Option<(BlockId, usize)>> {
    let mut pos = vec![None; func.values.len()];
    for b in func.block_ids() {
        for (i, &v) in func.block(b).values.iter().enumerate() {
            pos[v.index()] = Some((b, i));
        }
    }
    pos
}

/// Every use is dominated by its definition; phi operands are checked at the
/// end of the corresponding predecessor.
pub fn check_ssa_dominance(func: &Func, dom: &DomTree) -> CompileResult<()> {
    let pos = positions(func);
    let error = |value: ValueId, block: BlockId| CompileError::SsaDominance {
        func: func.name.clone(),
        value: value.to_string(),
        block: block.to_string(),
    };

    // Uses at (block, index); usize::MAX stands for the block's end.
    let check = |arg: ValueId, block: BlockId, index: usize| -> CompileResult<()> {
        let Some((def_block, def_index)) = pos.get(arg.index()).copied().flatten() else {
            return Err(error(arg, block));
        };
        let ok = if def_block == block {
            def_index < index
        } else {
            dom.dominates(def_block, block)
        };
        if ok {
            Ok(())
        } else {
            Err(error(arg, block))
        }
    };

    for &b in dom.rpo() {
        let block = func.block(b);
        for (i, &v) in block.values.iter().enumerate() {
            if func.value(v).op == Op::Phi {
                for (k, &arg) in func.args(v).iter().enumerate() {
                    check(arg, block.preds[k], usize::MAX)?;
                }
            } else {
                for &arg in func.args(v) {
                    check(arg, b, i)?;
                }
            }
        }
        if let Some(control) = block.control {
            if block.kind == BlockKind::Ret {
                for &arg in func.args(control) {
                    check(arg, b, usize::MAX)?;
                }
            } else {
                check(control, b, usize::MAX)?;
            }
        }
    }
    Ok(())
}

/// Stored use counts equal the number of referencing slots.
pub fn check_use_counts(func: &Func) -> CompileResult<()> {
    let mut counted = func.clone();
    counted.recount_uses();
    for (i, (have, want)) in func.values.iter().zip(&counted.values).enumerate() {
        if have.uses != want.uses {
            return Err(CompileError::UseCount {
                func: func.name.clone(),
                value: ValueId::new(i).to_string(),
                expected: want.uses,
                found: have.uses,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::Aux;

    fn simple() -> (Func, ValueId, ValueId) {
        let mut f = Func::new("f", vec![], TypeId::I64);
        let entry = f.add_block(BlockKind::Ret, "entry");
        let mem = f.append_value(entry, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let c = f.append_value(entry, Op::Const, TypeId::I64, &[], Aux::Int(7));
        let ret = f.new_value(entry, Op::Ret, TypeId::VOID, &[c, mem], Aux::None);
        f.block_mut(entry).control = Some(ret);
        f.recount_uses();
        (f, c, ret)
    }

    #[test]
    fn well_formed_function_passes() {
        let (f, _, _) = simple();
        verify(&f).unwrap();
    }

    #[test]
    fn stale_use_count_is_reported() {
        let (mut f, c, _) = simple();
        f.value_mut(c).uses = 5;
        let err = verify(&f).unwrap_err();
        assert!(matches!(err, CompileError::UseCount { expected: 1, found: 5, .. }));
    }

    #[test]
    fn use_before_definition_is_reported() {
        let mut f = Func::new("f", vec![], TypeId::I64);
        let entry = f.add_block(BlockKind::Ret, "entry");
        let mem = f.append_value(entry, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let later = ValueId::new(f.values.len() + 1);
        let add = f.append_value(entry, Op::Add, TypeId::I64, &[later, later], Aux::None);
        let c = f.append_value(entry, Op::Const, TypeId::I64, &[], Aux::Int(1));
        assert_eq!(c, later);
        let ret = f.new_value(entry, Op::Ret, TypeId::VOID, &[add, mem], Aux::None);
        f.block_mut(entry).control = Some(ret);
        f.recount_uses();
        let err = verify(&f).unwrap_err();
        assert!(matches!(err, CompileError::SsaDominance { .. }));
    }

    #[test]
    fn one_sided_edge_is_reported() {
        let mut f = Func::new("f", vec![], TypeId::VOID);
        let a = f.add_block(BlockKind::Plain, "a");
        let b = f.add_block(BlockKind::Ret, "b");
        f.block_mut(a).succs.push(b);
        let mem = f.append_value(a, Op::InitMem, TypeId::MEM, &[], Aux::None);
        let ret = f.new_value(b, Op::Ret, TypeId::VOID, &[mem], Aux::None);
        f.block_mut(b).control = Some(ret);
        let err = check_cfg(&f).unwrap_err();
        assert!(matches!(err, CompileError::CfgInconsistent { .. }));
    }
}
