//! Dominator tree computation using the Lengauer-Tarjan algorithm.
//!
//! A node `d` **dominates** a node `n` if every path from the entry node to `n` passes
//! through `d`. The **immediate dominator** of `n` is the unique strict dominator of `n` that
//! does not strictly dominate any other dominator of `n`; making it the parent of `n` forms
//! the dominator tree.
//!
//! SSA construction needs three things from this module: the tree itself (renaming walks it
//! in preorder), dominance queries (the definite-assignment check), and dominance frontiers
//! (phi placement). All results are ordered by node index so that everything derived from
//! them is deterministic.

use crate::utils::graph::{NodeId, Predecessors, Successors};

/// Immediate-dominator relation of a rooted graph.
///
/// Nodes not reachable from the entry have no dominator and are dominated by nothing.
///
/// # Examples
///
/// ```rust,ignore
/// // Diamond CFG: entry -> a, entry -> b, a -> exit, b -> exit
/// let tree = compute_dominators(&graph, entry);
/// assert_eq!(tree.immediate_dominator(exit), Some(entry));
/// assert!(!tree.strictly_dominates(a, exit));
/// ```
#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: NodeId,
    idom: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
}

impl DominatorTree {
    /// The root of the tree.
    #[inline]
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Immediate dominator of `node`, or `None` for the entry and for unreachable nodes.
    #[inline]
    pub fn immediate_dominator(&self, node: NodeId) -> Option<NodeId> {
        if node == self.entry {
            None
        } else {
            self.idom.get(node.index()).copied().flatten()
        }
    }

    /// Returns `true` if `node` is reachable from the entry.
    pub fn is_reachable(&self, node: NodeId) -> bool {
        node == self.entry || self.immediate_dominator(node).is_some()
    }

    /// Checks if `a` dominates `b`. Every reachable node dominates itself.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.immediate_dominator(current) {
                Some(idom) => current = idom,
                None => return false,
            }
        }
    }

    /// Checks if `a` dominates `b` and `a != b`.
    #[inline]
    pub fn strictly_dominates(&self, a: NodeId, b: NodeId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Children of `node` in the dominator tree, in ascending node order.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.children
            .get(node.index())
            .map_or(&[][..], Vec::as_slice)
    }

    /// Nodes of the tree in preorder, children visited in ascending node order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.idom.len());
        if self.idom.is_empty() {
            return order;
        }
        let mut stack = vec![self.entry];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        order
    }

    /// Number of nodes the tree was computed over.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.idom.len()
    }
}

/// Computes the dominator tree of `graph` rooted at `entry`.
///
/// # Complexity
///
/// O(E α(V)) with path compression.
pub fn compute_dominators<G>(graph: &G, entry: NodeId) -> DominatorTree
where
    G: Successors + Predecessors,
{
    let n = graph.node_count();
    if n == 0 {
        return DominatorTree {
            entry,
            idom: Vec::new(),
            children: Vec::new(),
        };
    }

    let mut lt = LengauerTarjan::new(n);
    lt.number(graph, entry);
    lt.compute(graph);

    let mut idom = vec![None; n];
    let mut children = vec![Vec::new(); n];
    for node in 0..n {
        if node != entry.index() && lt.dfnum[node] != 0 {
            let parent = lt.idom[node];
            idom[node] = Some(NodeId::new(parent));
            children[parent].push(NodeId::new(node));
        }
    }

    DominatorTree {
        entry,
        idom,
        children,
    }
}

const NONE: usize = usize::MAX;

/// Working state of the Lengauer-Tarjan algorithm. Nodes are raw indices, DFS numbers start
/// at 1 so that 0 marks "not visited".
struct LengauerTarjan {
    dfnum: Vec<usize>,
    vertex: Vec<usize>,
    parent: Vec<usize>,
    semi: Vec<usize>,
    idom: Vec<usize>,
    ancestor: Vec<usize>,
    best: Vec<usize>,
    bucket: Vec<Vec<usize>>,
}

impl LengauerTarjan {
    fn new(n: usize) -> Self {
        Self {
            dfnum: vec![0; n],
            vertex: Vec::with_capacity(n),
            parent: vec![NONE; n],
            semi: (0..n).collect(),
            idom: vec![NONE; n],
            ancestor: vec![NONE; n],
            best: (0..n).collect(),
            bucket: vec![Vec::new(); n],
        }
    }

    fn number<G: Successors>(&mut self, graph: &G, entry: NodeId) {
        let mut stack = vec![(entry.index(), NONE)];
        while let Some((node, parent)) = stack.pop() {
            if self.dfnum[node] != 0 {
                continue;
            }
            self.vertex.push(node);
            self.dfnum[node] = self.vertex.len();
            self.parent[node] = parent;
            let succs: Vec<usize> = graph.successors(NodeId::new(node)).map(NodeId::index).collect();
            for succ in succs.into_iter().rev() {
                if self.dfnum[succ] == 0 {
                    stack.push((succ, node));
                }
            }
        }
    }

    fn compute<G: Predecessors>(&mut self, graph: &G) {
        for i in (1..self.vertex.len()).rev() {
            let w = self.vertex[i];
            let parent_w = self.parent[w];

            for v in graph.predecessors(NodeId::new(w)) {
                let v = v.index();
                if self.dfnum[v] == 0 {
                    continue;
                }
                let u = self.eval(v);
                if self.dfnum[self.semi[u]] < self.dfnum[self.semi[w]] {
                    self.semi[w] = self.semi[u];
                }
            }

            let semi_w = self.semi[w];
            self.bucket[semi_w].push(w);
            self.ancestor[w] = parent_w;

            for v in std::mem::take(&mut self.bucket[parent_w]) {
                let u = self.eval(v);
                self.idom[v] = if self.semi[u] == self.semi[v] {
                    parent_w
                } else {
                    u
                };
            }
        }

        for i in 1..self.vertex.len() {
            let w = self.vertex[i];
            if self.idom[w] != self.semi[w] {
                self.idom[w] = self.idom[self.idom[w]];
            }
        }
    }

    fn eval(&mut self, v: usize) -> usize {
        if self.ancestor[v] == NONE {
            return v;
        }
        self.compress(v);
        self.best[v]
    }

    fn compress(&mut self, v: usize) {
        // Iterative path compression: collect the path to the forest root first.
        let mut path = Vec::new();
        let mut current = v;
        while self.ancestor[current] != NONE && self.ancestor[self.ancestor[current]] != NONE {
            path.push(current);
            current = self.ancestor[current];
        }
        for &node in path.iter().rev() {
            let anc = self.ancestor[node];
            if self.dfnum[self.semi[self.best[anc]]] < self.dfnum[self.semi[self.best[node]]] {
                self.best[node] = self.best[anc];
            }
            self.ancestor[node] = self.ancestor[anc];
        }
    }
}

/// Computes the dominance frontier of every node.
///
/// `result[n]` lists, in ascending order, every node `m` such that `n` dominates a
/// predecessor of `m` but does not strictly dominate `m`.
pub fn compute_dominance_frontiers<G>(graph: &G, tree: &DominatorTree) -> Vec<Vec<NodeId>>
where
    G: Predecessors,
{
    let n = graph.node_count();
    let mut frontiers: Vec<Vec<NodeId>> = vec![Vec::new(); n];

    for node_idx in 0..n {
        let node = NodeId::new(node_idx);
        if !tree.is_reachable(node) {
            continue;
        }
        let preds: Vec<NodeId> = graph
            .predecessors(node)
            .filter(|&p| tree.is_reachable(p))
            .collect();
        if preds.len() < 2 {
            continue;
        }
        let idom = tree.immediate_dominator(node);
        for pred in preds {
            let mut runner = Some(pred);
            while let Some(r) = runner {
                if Some(r) == idom {
                    break;
                }
                if !frontiers[r.index()].contains(&node) {
                    frontiers[r.index()].push(node);
                }
                runner = tree.immediate_dominator(r);
            }
        }
    }

    for frontier in &mut frontiers {
        frontier.sort_unstable();
    }
    frontiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::graph::testing::TestGraph;

    fn n(i: usize) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn test_dominator_single_node() {
        let graph = TestGraph::new(1, &[]);
        let tree = compute_dominators(&graph, n(0));
        assert_eq!(tree.immediate_dominator(n(0)), None);
        assert!(tree.dominates(n(0), n(0)));
        assert_eq!(tree.preorder(), vec![n(0)]);
    }

    #[test]
    fn test_dominator_diamond() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let tree = compute_dominators(&graph, n(0));
        assert_eq!(tree.immediate_dominator(n(1)), Some(n(0)));
        assert_eq!(tree.immediate_dominator(n(2)), Some(n(0)));
        assert_eq!(tree.immediate_dominator(n(3)), Some(n(0)));
        assert!(!tree.strictly_dominates(n(1), n(3)));
        assert_eq!(tree.children(n(0)), &[n(1), n(2), n(3)]);
    }

    #[test]
    fn test_dominator_loop() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let tree = compute_dominators(&graph, n(0));
        assert_eq!(tree.immediate_dominator(n(2)), Some(n(1)));
        assert_eq!(tree.immediate_dominator(n(3)), Some(n(2)));
        assert!(tree.dominates(n(1), n(3)));
    }

    #[test]
    fn test_dominator_unreachable() {
        let graph = TestGraph::new(3, &[(0, 1), (2, 1)]);
        let tree = compute_dominators(&graph, n(0));
        assert!(!tree.is_reachable(n(2)));
        assert!(!tree.dominates(n(0), n(2)));
        assert_eq!(tree.immediate_dominator(n(1)), Some(n(0)));
    }

    #[test]
    fn test_dominance_frontiers() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let tree = compute_dominators(&graph, n(0));
        let df = compute_dominance_frontiers(&graph, &tree);
        assert_eq!(df[1], vec![n(3)]);
        assert_eq!(df[2], vec![n(3)]);
        assert!(df[0].is_empty());
        assert!(df[3].is_empty());
    }

    #[test]
    fn test_dominance_frontier_of_loop_header() {
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let tree = compute_dominators(&graph, n(0));
        let df = compute_dominance_frontiers(&graph, &tree);
        assert_eq!(df[2], vec![n(1)]);
        assert_eq!(df[1], vec![n(1)]);
    }
}
