//! Live-in / live-out dataflow over SSA values.
//!
//! Backward iterative analysis to fixpoint. Only values that need a machine
//! location take part: memory states and the memory operand slot of loads,
//! stores, calls and returns are skipped. A phi operand is live out of the
//! predecessor it arrives from rather than live into the phi's block.

use super::{BlockId, BlockKind, Func, Op, ValueId};

/// Dense bit set of value ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueSet {
    words: Vec<u64>,
}

impl ValueSet {
    pub fn with_capacity(values: usize) -> Self {
        Self {
            words: vec![0; values.div_ceil(64)],
        }
    }

    fn ensure(&mut self, index: usize) {
        let needed = index / 64 + 1;
        if self.words.len() < needed {
            self.words.resize(needed, 0);
        }
    }

    pub fn insert(&mut self, v: ValueId) -> bool {
        let i = v.index();
        self.ensure(i);
        let bit = 1u64 << (i % 64);
        let was = self.words[i / 64] & bit != 0;
        self.words[i / 64] |= bit;
        !was
    }

    pub fn remove(&mut self, v: ValueId) {
        let i = v.index();
        if let Some(word) = self.words.get_mut(i / 64) {
            *word &= !(1u64 << (i % 64));
        }
    }

    pub fn contains(&self, v: ValueId) -> bool {
        let i = v.index();
        self.words
            .get(i / 64)
            .is_some_and(|w| w & (1u64 << (i % 64)) != 0)
    }

    /// Add every member of `other`; returns whether anything was added.
    pub fn union_with(&mut self, other: &ValueSet) -> bool {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (w, &o) in self.words.iter_mut().zip(&other.words) {
            let merged = *w | o;
            changed |= merged != *w;
            *w = merged;
        }
        changed
    }

    /// `self - other`
    pub fn difference(&self, other: &ValueSet) -> ValueSet {
        let words = self
            .words
            .iter()
            .enumerate()
            .map(|(i, &w)| w & !other.words.get(i).copied().unwrap_or(0))
            .collect();
        ValueSet { words }
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64)
                .filter(move |bit| w & (1u64 << bit) != 0)
                .map(move |bit| ValueId::new(i * 64 + bit))
        })
    }

    /// Semantic equality ignoring trailing zero words.
    pub fn same_members(&self, other: &ValueSet) -> bool {
        let n = self.words.len().max(other.words.len());
        (0..n).all(|i| self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0))
    }
}

/// Values whose register uses a block performs, in program order.
///
/// Phi operands are excluded; the `If` control value and the data operands of
/// a `Ret` control are included.
pub fn block_uses(func: &Func, block: BlockId) -> Vec<ValueId> {
    let b = func.block(block);
    let mut uses = Vec::new();
    for &v in &b.values {
        if func.value(v).op == Op::Phi {
            continue;
        }
        uses.extend(func.data_args(v).iter().copied().filter(|&a| func.value(a).has_result()));
    }
    if let Some(control) = b.control {
        match b.kind {
            BlockKind::If => uses.push(control),
            BlockKind::Ret => uses.extend(
                func.data_args(control)
                    .iter()
                    .copied()
                    .filter(|&a| func.value(a).has_result()),
            ),
            BlockKind::Plain => {}
        }
    }
    uses
}

/// Phi operands flowing along the edge `pred -> succ`.
pub fn edge_uses(func: &Func, pred: BlockId, succ: BlockId) -> Vec<ValueId> {
    let Some(index) = func.pred_index(succ, pred) else {
        return Vec::new();
    };
    func.phis(succ)
        .filter(|&phi| func.value(phi).has_result())
        .map(|phi| func.arg(phi, index))
        .filter(|&a| func.value(a).has_result())
        .collect()
}

/// Per-block live sets.
#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: Vec<ValueSet>,
    live_out: Vec<ValueSet>,
    /// Upward-exposed uses.
    gen: Vec<ValueSet>,
    /// Definitions, phis included.
    kill: Vec<ValueSet>,
    /// Phi operands each block feeds to its successors.
    phi_out: Vec<ValueSet>,
    order: Vec<BlockId>,
    iterations: usize,
}

impl Liveness {
    pub fn compute(func: &Func) -> Self {
        let n = func.blocks.len();
        let nv = func.values.len();
        let mut gen = vec![ValueSet::with_capacity(nv); n];
        let mut kill = vec![ValueSet::with_capacity(nv); n];
        let mut phi_out = vec![ValueSet::with_capacity(nv); n];

        let order = func.postorder();
        for &b in &order {
            let block = func.block(b);
            // Backward scan so uses after a local definition are not exposed.
            let mut exposed = ValueSet::with_capacity(nv);
            if let Some(control) = block.control {
                if block.kind == BlockKind::If {
                    exposed.insert(control);
                } else if block.kind == BlockKind::Ret {
                    for &a in func.data_args(control) {
                        if func.value(a).has_result() {
                            exposed.insert(a);
                        }
                    }
                }
            }
            for &v in block.values.iter().rev() {
                let value = func.value(v);
                if value.has_result() {
                    kill[b.index()].insert(v);
                    exposed.remove(v);
                }
                if value.op == Op::Phi {
                    continue;
                }
                for &a in func.data_args(v) {
                    if func.value(a).has_result() {
                        exposed.insert(a);
                    }
                }
            }
            gen[b.index()] = exposed;

            for &s in &block.succs {
                for a in edge_uses(func, b, s) {
                    phi_out[b.index()].insert(a);
                }
            }
        }

        let mut live = Self {
            live_in: vec![ValueSet::with_capacity(nv); n],
            live_out: vec![ValueSet::with_capacity(nv); n],
            gen,
            kill,
            phi_out,
            order,
            iterations: 0,
        };
        while live.iterate_once(func) {}
        log::debug!(
            "{}: liveness converged after {} iterations",
            func.name,
            live.iterations
        );
        live
    }

    /// One pass over all blocks in postorder; returns whether any set changed.
    pub fn iterate_once(&mut self, func: &Func) -> bool {
        self.iterations += 1;
        let mut changed = false;
        for i in 0..self.order.len() {
            let b = self.order[i];
            let mut out = self.phi_out[b.index()].clone();
            for &s in &func.block(b).succs {
                out.union_with(&self.live_in[s.index()]);
            }
            let mut input = out.difference(&self.kill[b.index()]);
            input.union_with(&self.gen[b.index()]);

            if !out.same_members(&self.live_out[b.index()]) {
                self.live_out[b.index()] = out;
                changed = true;
            }
            if !input.same_members(&self.live_in[b.index()]) {
                self.live_in[b.index()] = input;
                changed = true;
            }
        }
        changed
    }

    pub fn live_in(&self, b: BlockId) -> &ValueSet {
        &self.live_in[b.index()]
    }

    pub fn live_out(&self, b: BlockId) -> &ValueSet {
        &self.live_out[b.index()]
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}
