//! Liveness of SSA values.
//!
//! A phi operand is live out of the predecessor it arrives from, not live into the phi's
//! block; a phi result is defined on block entry and never live in. With those two rules
//! the usual backward dataflow applies unchanged.

use crate::{
    ssa::SsaMethod,
    utils::{bitset::BitSet, graph::postorder},
};

/// Per-block live-in and live-out sets over value indices.
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Values live on entry, before phis.
    pub live_in: Vec<BitSet>,
    /// Values live on exit, phi operands for the successors included.
    pub live_out: Vec<BitSet>,
}

/// Computes liveness for every reachable block of `method`.
#[must_use]
pub fn compute(method: &SsaMethod) -> Liveness {
    let values = method.value_count();
    let count = method.blocks.len();

    let mut uses = vec![BitSet::new(values); count];
    let mut defs = vec![BitSet::new(values); count];
    let mut phi_uses = vec![BitSet::new(values); count];
    for (b, block) in method.blocks.iter().enumerate() {
        for phi in &block.phis {
            defs[b].insert(phi.result.index());
            for operand in &phi.operands {
                phi_uses[operand.predecessor.index()].insert(operand.value.index());
            }
        }
        for insn in &block.insns {
            for source in &insn.sources {
                if !defs[b].contains(source.index()) {
                    uses[b].insert(source.index());
                }
            }
            if let Some(result) = insn.result {
                defs[b].insert(result.index());
            }
        }
    }

    let order = postorder(method, method.entry);
    let mut live_in = vec![BitSet::new(values); count];
    let mut live_out = vec![BitSet::new(values); count];
    let mut changed = true;
    while changed {
        changed = false;
        for &node in &order {
            let b = node.index();
            let mut out = phi_uses[b].clone();
            for succ in &method.blocks[b].successors {
                out.union_with(&live_in[succ.index()]);
            }
            let mut inn = out.clone();
            inn.difference_with(&defs[b]);
            inn.union_with(&uses[b]);
            if out != live_out[b] {
                live_out[b] = out;
                changed = true;
            }
            if inn != live_in[b] {
                live_in[b] = inn;
                changed = true;
            }
        }
    }
    Liveness { live_in, live_out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::Code,
        cfg,
        ir::{Cond, Constant},
        ssa,
        types::{MethodRef, TypeId},
    };

    #[test]
    fn test_phi_operands_live_out_of_predecessors() {
        let mut c = Code::new(
            MethodRef::new(TypeId::class("a/B"), "m", TypeId::Int, vec![TypeId::Int]),
            true,
        );
        let x = c.param(0).unwrap();
        let y = c.new_local(TypeId::Int).unwrap();
        let other = c.new_label();
        let join = c.new_label();
        c.branch_zero(Cond::Eq, x, other).unwrap();
        c.load_constant(y, Constant::Int(1)).unwrap();
        c.jump(join).unwrap();
        c.mark(other).unwrap();
        c.load_constant(y, Constant::Int(2)).unwrap();
        c.mark(join).unwrap();
        c.return_value(y).unwrap();
        let method = ssa::build(cfg::build(&c).unwrap()).unwrap();
        let live = compute(&method);

        let (join_idx, phi) = method
            .blocks
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.phis.first().map(|p| (i, p.clone())))
            .unwrap();
        assert!(!live.live_in[join_idx].contains(phi.result.index()));
        for operand in &phi.operands {
            let pred = operand.predecessor.index();
            assert!(live.live_out[pred].contains(operand.value.index()));
            assert!(!live.live_in[join_idx].contains(operand.value.index()));
        }
        // The parameter dies at the branch.
        let param = method.blocks[method.entry.index()].insns[0].result.unwrap();
        assert!(!live.live_in[join_idx].contains(param.index()));
    }
}
