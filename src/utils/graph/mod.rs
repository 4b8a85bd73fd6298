//! Minimal directed-graph toolkit for control-flow analysis.
//!
//! Control-flow graphs in this crate are plain vectors of blocks; this module supplies the
//! node identifier, the adjacency traits those block vectors implement, and the algorithms
//! (traversal orders, dominators, dominance frontiers) that SSA construction is built on.

mod dominators;
mod traversal;

pub use dominators::{compute_dominance_frontiers, compute_dominators, DominatorTree};
pub use traversal::{postorder, reverse_postorder};

use std::fmt;

/// Strongly typed index of a node (basic block) in a graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Creates a node id from a raw index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        NodeId(index)
    }

    /// The raw index of this node.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Core properties shared by all graphs.
pub trait GraphBase {
    /// Number of nodes; node ids are dense in `0..node_count()`.
    fn node_count(&self) -> usize;
}

/// Forward adjacency.
pub trait Successors: GraphBase {
    /// Outgoing neighbours of `node`.
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// Backward adjacency.
pub trait Predecessors: GraphBase {
    /// Incoming neighbours of `node`.
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// A graph with a designated entry node.
pub trait RootedGraph: Successors + Predecessors {
    /// The entry node.
    fn entry(&self) -> NodeId;
}
