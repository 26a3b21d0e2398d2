// This module computes the dominator tree of an SSA function with the iterative algorithm
// over reverse postorder. Every reachable block except the entry starts undefined; each
// round takes the already-processed predecessors of a block and folds them with intersect,
// which lifts the deeper of the two candidates until both sit at the same tree depth and
// then walks both up in lockstep until they meet. Rounds repeat until no immediate
// dominator changes, which for structured control flow happens after two or three passes.
// The finished tree is numbered in preorder and postorder so dominates() is a constant
// time interval test. Dominance frontiers use the predecessor-runner formulation, and the
// phi placement cross-check verifies that every phi left by the SSA builder sits in the
// iterated dominance frontier of the blocks that assign its variable.

//! Dominator tree, dominance frontiers, and phi placement cross-check.

use super::builder::PhiDefSites;
use super::{BlockId, Func};
use crate::core::error::{CompileError, CompileResult};

/// Immediate dominators and tree depth per block.
#[derive(Debug, Clone)]
pub struct DomTree {
    idom: Vec<Option<BlockId>>,
    depth: Vec<u32>,
    rpo: Vec<BlockId>,
    children: Vec<Vec<BlockId>>,
    pre: Vec<u32>,
    post: Vec<u32>,
    iterations: usize,
}

const UNREACHABLE: u32 = u32::MAX;

impl DomTree {
    pub fn compute(func: &Func) -> Self {
        let n = func.blocks.len();
        let rpo = func.reverse_postorder();
        let mut rpo_index = vec![UNREACHABLE; n];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[b.index()] = i as u32;
        }

        let entry = func.entry;
        let mut idom: Vec<Option<BlockId>> = vec![None; n];
        idom[entry.index()] = Some(entry);

        let mut iterations = 0;
        let mut changed = true;
        while changed {
            changed = false;
            iterations += 1;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in &func.block(b).preds {
                    if rpo_index[p.index()] == UNREACHABLE || idom[p.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, entry, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); n];
        let mut depth = vec![0; n];
        for &b in rpo.iter().skip(1) {
            if let Some(d) = idom[b.index()] {
                children[d.index()].push(b);
                // Parents precede children in reverse postorder.
                depth[b.index()] = depth[d.index()] + 1;
            }
        }

        let mut pre = vec![UNREACHABLE; n];
        let mut post = vec![UNREACHABLE; n];
        let mut clock = 0;
        let mut stack = vec![(entry, 0usize)];
        pre[entry.index()] = clock;
        clock += 1;
        while let Some((b, next)) = stack.pop() {
            if let Some(&child) = children[b.index()].get(next) {
                stack.push((b, next + 1));
                pre[child.index()] = clock;
                clock += 1;
                stack.push((child, 0));
            } else {
                post[b.index()] = clock;
                clock += 1;
            }
        }

        idom[entry.index()] = None;
        log::debug!(
            "{}: dominators converged after {} iterations",
            func.name,
            iterations
        );

        Self {
            idom,
            depth,
            rpo,
            children,
            pre,
            post,
            iterations,
        }
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idom[b.index()]
    }

    pub fn depth(&self, b: BlockId) -> u32 {
        self.depth[b.index()]
    }

    pub fn children(&self, b: BlockId) -> &[BlockId] {
        &self.children[b.index()]
    }

    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Rounds the fixpoint iteration needed, including the final stable one.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.pre[b.index()] != UNREACHABLE
    }

    /// Whether `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.is_reachable(a)
            && self.is_reachable(b)
            && self.pre[a.index()] <= self.pre[b.index()]
            && self.post[b.index()] <= self.post[a.index()]
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Dominance frontier of every block.
    pub fn frontiers(&self, func: &Func) -> Vec<Vec<BlockId>> {
        let mut df: Vec<Vec<BlockId>> = vec![Vec::new(); func.blocks.len()];
        for &b in &self.rpo {
            let preds = &func.block(b).preds;
            if preds.len() < 2 {
                continue;
            }
            let stop = self.idom(b);
            for &p in preds {
                if !self.is_reachable(p) {
                    continue;
                }
                let mut runner = Some(p);
                while let Some(r) = runner {
                    if Some(r) == stop {
                        break;
                    }
                    if !df[r.index()].contains(&b) {
                        df[r.index()].push(b);
                    }
                    runner = self.idom(r);
                }
            }
        }
        df
    }

    /// Iterated dominance frontier of a set of blocks, as a membership map.
    pub fn iterated_frontier(&self, frontiers: &[Vec<BlockId>], blocks: &[BlockId]) -> Vec<bool> {
        let mut in_idf = vec![false; frontiers.len()];
        let mut queued = vec![false; frontiers.len()];
        let mut work: Vec<BlockId> = Vec::new();
        for &b in blocks {
            if !queued[b.index()] {
                queued[b.index()] = true;
                work.push(b);
            }
        }
        while let Some(b) = work.pop() {
            for &f in &frontiers[b.index()] {
                if !in_idf[f.index()] {
                    in_idf[f.index()] = true;
                    if !queued[f.index()] {
                        queued[f.index()] = true;
                        work.push(f);
                    }
                }
            }
        }
        in_idf
    }
}

/// Nearest common ancestor of `a` and `b` in the partial tree.
fn intersect(idom: &[Option<BlockId>], entry: BlockId, mut a: BlockId, mut b: BlockId) -> BlockId {
    let mut da = depth_in(idom, entry, a);
    let mut db = depth_in(idom, entry, b);
    while da > db {
        a = parent(idom, entry, a);
        da -= 1;
    }
    while db > da {
        b = parent(idom, entry, b);
        db -= 1;
    }
    while a != b {
        a = parent(idom, entry, a);
        b = parent(idom, entry, b);
    }
    a
}

fn parent(idom: &[Option<BlockId>], entry: BlockId, b: BlockId) -> BlockId {
    idom[b.index()].unwrap_or(entry)
}

fn depth_in(idom: &[Option<BlockId>], entry: BlockId, mut b: BlockId) -> u32 {
    let mut depth = 0;
    while b != entry {
        b = parent(idom, entry, b);
        depth += 1;
    }
    depth
}

/// Check that each phi lies in the iterated dominance frontier of the blocks
/// that define its variable.
pub fn check_phi_placement(func: &Func, dom: &DomTree, sites: &[PhiDefSites]) -> CompileResult<()> {
    let frontiers = dom.frontiers(func);
    for site in sites {
        let block = func.value(site.phi).block;
        let idf = dom.iterated_frontier(&frontiers, &site.def_blocks);
        if !idf[block.index()] {
            return Err(CompileError::PhiPlacement {
                func: func.name.clone(),
                value: site.phi.to_string(),
                block: block.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeId;
    use crate::ssa::BlockKind;

    fn cfg(n: usize, edges: &[(usize, usize)]) -> Func {
        let mut f = Func::new("cfg", vec![], TypeId::VOID);
        for i in 0..n {
            f.add_block(BlockKind::Plain, format!("b{i}"));
        }
        for &(a, b) in edges {
            f.add_edge(BlockId::new(a), BlockId::new(b));
        }
        f
    }

    fn b(i: usize) -> BlockId {
        BlockId::new(i)
    }

    #[test]
    fn diamond_idoms() {
        let f = cfg(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b(0)), None);
        assert_eq!(dom.idom(b(1)), Some(b(0)));
        assert_eq!(dom.idom(b(3)), Some(b(0)));
        assert_eq!(dom.depth(b(3)), 1);
        assert!(dom.dominates(b(0), b(3)));
        assert!(!dom.dominates(b(1), b(3)));
        let df = dom.frontiers(&f);
        assert_eq!(df[1], vec![b(3)]);
        assert_eq!(df[2], vec![b(3)]);
        assert!(df[0].is_empty());
    }

    #[test]
    fn loop_frontier_contains_header() {
        // 0 -> 1 (header) -> 2 (body) -> 1, 1 -> 3 (exit)
        let f = cfg(4, &[(0, 1), (1, 2), (2, 1), (1, 3)]);
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b(2)), Some(b(1)));
        assert_eq!(dom.idom(b(3)), Some(b(1)));
        let df = dom.frontiers(&f);
        assert_eq!(df[2], vec![b(1)]);
        assert_eq!(df[1], vec![b(1)]);
        let idf = dom.iterated_frontier(&df, &[b(2)]);
        assert!(idf[1]);
        assert!(!idf[3]);
    }

    #[test]
    fn intersect_equalizes_depth() {
        // Deep left arm, shallow right arm meeting at 5.
        let f = cfg(6, &[(0, 1), (1, 2), (2, 3), (3, 5), (0, 4), (4, 5)]);
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b(5)), Some(b(0)));
        assert_eq!(dom.depth(b(3)), 3);
        assert!(dom.iterations() <= 3);
    }

    #[test]
    fn unreachable_blocks_are_ignored() {
        let f = cfg(3, &[(0, 1), (2, 1)]);
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b(1)), Some(b(0)));
        assert!(!dom.is_reachable(b(2)));
        assert!(!dom.dominates(b(2), b(1)));
    }
}
