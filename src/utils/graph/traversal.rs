//! Depth-first traversal orders.
//!
//! Reverse postorder is the iteration order of every forward dataflow problem in the crate
//! (definite assignment, constant propagation); postorder drives the backward ones.

use crate::utils::graph::{NodeId, Successors};

/// Nodes reachable from `start` in DFS postorder. Successors are explored in the order the
/// graph yields them.
pub fn postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let n = graph.node_count();
    let mut order = Vec::with_capacity(n);
    if start.index() >= n {
        return order;
    }
    let mut visited = vec![false; n];
    let mut stack: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

    visited[start.index()] = true;
    stack.push((start, graph.successors(start).collect::<Vec<_>>().into_iter().rev().collect()));

    while let Some((node, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(succ) => {
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    let succs: Vec<NodeId> = graph.successors(succ).collect();
                    stack.push((succ, succs.into_iter().rev().collect()));
                }
            }
            None => {
                order.push(*node);
                stack.pop();
            }
        }
    }
    order
}

/// Nodes reachable from `start` in reverse postorder: every node appears before its
/// successors, except along back edges.
pub fn reverse_postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let mut order = postorder(graph, start);
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::graph::testing::TestGraph;

    fn ids(v: &[usize]) -> Vec<NodeId> {
        v.iter().map(|&i| NodeId::new(i)).collect()
    }

    #[test]
    fn test_postorder_diamond() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        assert_eq!(postorder(&graph, NodeId::new(0)), ids(&[3, 1, 2, 0]));
    }

    #[test]
    fn test_reverse_postorder_with_cycle() {
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        assert_eq!(reverse_postorder(&graph, NodeId::new(0)), ids(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_postorder_skips_unreachable() {
        let graph = TestGraph::new(3, &[(0, 1), (2, 1)]);
        assert_eq!(postorder(&graph, NodeId::new(0)), ids(&[1, 0]));
    }
}
