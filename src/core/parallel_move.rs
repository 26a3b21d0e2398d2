//! Sequentialization of parallel word moves.
//!
//! Phi copies on an edge, call argument setup and multi-word copies all read
//! every source before any destination is written. This module orders such a
//! set of moves so it can run one move at a time, breaking cycles through a
//! scratch location. One scratch location is always enough because every
//! destination is written exactly once, so the move graph is a set of trees
//! hanging off at most one cycle each.

use bumpalo::{collections::Vec as BumpVec, Bump};

use super::value_assignment::PartLocation;

/// Resolution state of one move while walking the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    Unvisited,
    /// Waiting for the moves that read its destination.
    OnStack,
    Resolved,
}

/// A single-word copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartMove {
    pub src: PartLocation,
    pub dst: PartLocation,
}

impl PartMove {
    pub fn new(src: PartLocation, dst: PartLocation) -> Self {
        Self { src, dst }
    }
}

/// Order `moves` so that executing them one after another has the effect of
/// executing them simultaneously.
///
/// Destinations must be pairwise distinct and must not include `temp`.
/// Self-moves are dropped.
pub fn sequentialize(moves: &[PartMove], temp: PartLocation, arena: &Bump) -> Vec<PartMove> {
    debug_assert!(
        moves.iter().enumerate().all(|(i, m)| moves[..i].iter().all(|o| o.dst != m.dst)),
        "parallel move writes a location twice"
    );

    let mut src: BumpVec<PartLocation> = BumpVec::new_in(arena);
    let mut dst: BumpVec<PartLocation> = BumpVec::new_in(arena);
    for m in moves.iter().filter(|m| m.src != m.dst) {
        src.push(m.src);
        dst.push(m.dst);
    }
    let n = src.len();
    let mut state = BumpVec::from_iter_in(std::iter::repeat(MoveState::Unvisited).take(n), arena);
    // (move index, next move to inspect) frames of the depth-first walk.
    let mut stack: BumpVec<(usize, usize)> = BumpVec::new_in(arena);
    let mut out = Vec::with_capacity(n + 1);

    for root in 0..n {
        if state[root] != MoveState::Unvisited {
            continue;
        }
        state[root] = MoveState::OnStack;
        stack.push((root, 0));

        while let Some(&(i, next)) = stack.last() {
            if next < n {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                // Move `next` still needs the value that move `i` overwrites.
                if src[next] != dst[i] {
                    continue;
                }
                match state[next] {
                    MoveState::Unvisited => {
                        state[next] = MoveState::OnStack;
                        stack.push((next, 0));
                    }
                    MoveState::OnStack => {
                        log::trace!("parallel move cycle broken at {} via {}", src[next], temp);
                        out.push(PartMove::new(src[next], temp));
                        src[next] = temp;
                    }
                    MoveState::Resolved => {}
                }
            } else {
                out.push(PartMove::new(src[i], dst[i]));
                state[i] = MoveState::Resolved;
                stack.pop();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::AsmReg;
    use crate::core::value_assignment::StackSlot;
    use std::collections::HashMap;

    fn reg(n: u8) -> PartLocation {
        PartLocation::Reg(AsmReg::new(n))
    }

    fn temp() -> PartLocation {
        PartLocation::Reg(AsmReg::IP1)
    }

    /// Execute `seq` on a symbolic machine and check that every destination
    /// received the original contents of its source.
    fn check(moves: &[PartMove], seq: &[PartMove]) {
        let mut machine: HashMap<PartLocation, PartLocation> = HashMap::new();
        let read = |m: &HashMap<PartLocation, PartLocation>, l: PartLocation| *m.get(&l).unwrap_or(&l);
        for mv in seq {
            let v = read(&machine, mv.src);
            machine.insert(mv.dst, v);
        }
        for mv in moves {
            assert_eq!(read(&machine, mv.dst), mv.src, "{} did not receive {}", mv.dst, mv.src);
        }
    }

    #[test]
    fn test_chain_is_ordered_back_to_front() {
        let arena = Bump::new();
        let moves = [PartMove::new(reg(0), reg(1)), PartMove::new(reg(1), reg(2))];
        let seq = sequentialize(&moves, temp(), &arena);
        assert_eq!(seq, vec![PartMove::new(reg(1), reg(2)), PartMove::new(reg(0), reg(1))]);
        check(&moves, &seq);
    }

    #[test]
    fn test_swap_uses_temp_once() {
        let arena = Bump::new();
        let moves = [PartMove::new(reg(0), reg(1)), PartMove::new(reg(1), reg(0))];
        let seq = sequentialize(&moves, temp(), &arena);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.iter().filter(|m| m.dst == temp()).count(), 1);
        check(&moves, &seq);
    }

    #[test]
    fn test_rotation_with_fan_out() {
        let arena = Bump::new();
        let moves = [
            PartMove::new(reg(0), reg(1)),
            PartMove::new(reg(1), reg(2)),
            PartMove::new(reg(2), reg(0)),
            PartMove::new(reg(0), reg(3)),
            PartMove::new(PartLocation::Imm(7), reg(4)),
        ];
        let seq = sequentialize(&moves, temp(), &arena);
        check(&moves, &seq);
    }

    #[test]
    fn test_cycle_through_memory() {
        let arena = Bump::new();
        let a = PartLocation::Stack(StackSlot::Spill(0));
        let b = PartLocation::Stack(StackSlot::Spill(8));
        let moves = [PartMove::new(a, b), PartMove::new(b, reg(3)), PartMove::new(reg(3), a)];
        let seq = sequentialize(&moves, temp(), &arena);
        check(&moves, &seq);
    }

    #[test]
    fn test_self_moves_vanish() {
        let arena = Bump::new();
        let moves = [PartMove::new(reg(5), reg(5))];
        assert!(sequentialize(&moves, temp(), &arena).is_empty());
    }
}
