//! Critical-edge splitting.
//!
//! Phi copies are placed at the end of a predecessor. On an edge from a block
//! with two successors into a block with several predecessors that position
//! would also execute on the other path, so such edges get an empty block of
//! their own. Predecessor positions are preserved, keeping phi operand order
//! valid.

use super::{BlockKind, Func};

/// Split every critical edge; returns how many blocks were inserted.
pub fn split_critical_edges(func: &mut Func) -> usize {
    let mut inserted = 0;
    let original = func.blocks.len();
    for p in 0..original {
        let pred = super::BlockId::new(p);
        if func.block(pred).succs.len() < 2 {
            continue;
        }
        for i in 0..func.block(pred).succs.len() {
            let succ = func.block(pred).succs[i];
            if func.block(succ).preds.len() < 2 {
                continue;
            }
            let name = format!("{}.{}", func.block(pred).name, func.block(succ).name);
            let split = func.add_block(BlockKind::Plain, name);
            func.block_mut(pred).succs[i] = split;
            func.block_mut(split).preds.push(pred);
            func.block_mut(split).succs.push(succ);
            if let Some(j) = func.pred_index(succ, pred) {
                func.block_mut(succ).preds[j] = split;
            }
            inserted += 1;
        }
    }
    if inserted > 0 {
        log::debug!("{}: split {} critical edges", func.name, inserted);
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeId;
    use crate::ssa::BlockId;

    #[test]
    fn loop_exit_edge_is_split() {
        // 0 -> 1; 1 -> 1 (back edge), 1 -> 2
        let mut f = Func::new("f", vec![], TypeId::VOID);
        f.add_block(BlockKind::Plain, "entry");
        f.add_block(BlockKind::If, "loop");
        f.add_block(BlockKind::Ret, "exit");
        f.add_edge(BlockId::new(0), BlockId::new(1));
        f.add_edge(BlockId::new(1), BlockId::new(1));
        f.add_edge(BlockId::new(1), BlockId::new(2));

        assert_eq!(split_critical_edges(&mut f), 1);
        let split = BlockId::new(3);
        assert_eq!(f.block(BlockId::new(1)).succs, vec![split, BlockId::new(2)]);
        assert_eq!(f.block(BlockId::new(1)).preds, vec![BlockId::new(0), split]);
        assert_eq!(f.block(split).succs, vec![BlockId::new(1)]);
        assert_eq!(f.block(split).name, "loop.loop");
    }

    #[test]
    fn diamond_needs_no_split() {
        let mut f = Func::new("f", vec![], TypeId::VOID);
        for name in ["a", "b", "c", "d"] {
            f.add_block(BlockKind::Plain, name);
        }
        f.add_edge(BlockId::new(0), BlockId::new(1));
        f.add_edge(BlockId::new(0), BlockId::new(2));
        f.add_edge(BlockId::new(1), BlockId::new(3));
        f.add_edge(BlockId::new(2), BlockId::new(3));
        assert_eq!(split_critical_edges(&mut f), 0);
    }
}
