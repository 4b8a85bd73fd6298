//! Interference graph construction.
//!
//! Two values interfere when one is defined while the other is live. Walking each block
//! backwards from its live-out set:
//!
//! - an instruction result interferes with everything live after the instruction, except
//!   the source of a `move`, which holds the same value;
//! - a result interferes even when it is never read, so a dead definition cannot clobber a
//!   live register;
//! - phi results interfere with everything live after the phis and with each other.

use crate::{
    ir::Op,
    regalloc::liveness::Liveness,
    ssa::{SsaMethod, ValueId},
    utils::bitset::BitSet,
};

/// Symmetric interference relation over SSA values.
#[derive(Debug, Clone)]
pub struct InterferenceGraph {
    adjacency: Vec<BitSet>,
}

impl InterferenceGraph {
    /// Creates a graph without edges.
    #[must_use]
    pub fn new(values: usize) -> Self {
        InterferenceGraph {
            adjacency: vec![BitSet::new(values); values],
        }
    }

    /// Records that `a` and `b` interfere.
    pub fn add(&mut self, a: ValueId, b: ValueId) {
        if a != b {
            self.adjacency[a.index()].insert(b.index());
            self.adjacency[b.index()].insert(a.index());
        }
    }

    /// Returns `true` if `a` and `b` interfere.
    #[must_use]
    pub fn interferes(&self, a: ValueId, b: ValueId) -> bool {
        self.adjacency[a.index()].contains(b.index())
    }

    /// The values interfering with `value`.
    #[must_use]
    pub fn neighbors(&self, value: ValueId) -> &BitSet {
        &self.adjacency[value.index()]
    }

    /// Number of values the graph covers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Returns `true` if the graph covers no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }
}

/// Builds the interference graph of `method` from its liveness.
#[must_use]
pub fn build(method: &SsaMethod, liveness: &Liveness) -> InterferenceGraph {
    let mut graph = InterferenceGraph::new(method.value_count());
    for (b, block) in method.blocks.iter().enumerate() {
        let mut live = liveness.live_out[b].clone();
        for insn in block.insns.iter().rev() {
            if let Some(result) = insn.result {
                let copied = match (&insn.op, insn.sources.as_slice()) {
                    (Op::Move, [source]) => Some(*source),
                    _ => None,
                };
                for other in live.iter() {
                    let other = ValueId::new(other);
                    if Some(other) != copied {
                        graph.add(result, other);
                    }
                }
                live.remove(result.index());
            }
            for source in &insn.sources {
                live.insert(source.index());
            }
        }
        for (i, phi) in block.phis.iter().enumerate() {
            for other in live.iter() {
                graph.add(phi.result, ValueId::new(other));
            }
            for later in &block.phis[i + 1..] {
                graph.add(phi.result, later.result);
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_is_symmetric_and_irreflexive() {
        let mut graph = InterferenceGraph::new(3);
        graph.add(ValueId::new(0), ValueId::new(2));
        graph.add(ValueId::new(1), ValueId::new(1));
        assert!(graph.interferes(ValueId::new(2), ValueId::new(0)));
        assert!(!graph.interferes(ValueId::new(1), ValueId::new(1)));
        assert_eq!(graph.neighbors(ValueId::new(0)).count(), 1);
    }
}
