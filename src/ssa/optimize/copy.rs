//! Copy propagation.
//!
//! Replaces every use of a copy's result with the copied value. Two kinds of copies are
//! recognized:
//!
//! - `move` instructions between values of the same kind,
//! - trivial phis, whose operands are all the same value once self-references are ignored.
//!
//! Copy chains are resolved to their ultimate source before rewriting, and the copies
//! themselves are deleted. SSA guarantees the source dominates every use of the copy, so the
//! rewrite never reads a value before its definition.

use crate::{
    ir::Op,
    ssa::{optimize::SsaPass, SsaMethod, ValueId},
    Result,
};

/// Copy propagation over moves and trivial phis.
pub struct CopyPropagationPass;

impl SsaPass for CopyPropagationPass {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn run_on_method(&self, method: &mut SsaMethod) -> Result<bool> {
        let mut copy_of: Vec<Option<ValueId>> = vec![None; method.value_count()];
        let mut found = false;

        for block in &method.blocks {
            for insn in &block.insns {
                if insn.op != Op::Move {
                    continue;
                }
                if let (Some(result), [source]) = (insn.result, insn.sources.as_slice()) {
                    if method.kind(result) == method.kind(*source) {
                        copy_of[result.index()] = Some(*source);
                        found = true;
                    }
                }
            }
            for phi in &block.phis {
                let mut unique = None;
                let mut trivial = true;
                for operand in &phi.operands {
                    if operand.value == phi.result || Some(operand.value) == unique {
                        continue;
                    }
                    if unique.is_some() {
                        trivial = false;
                        break;
                    }
                    unique = Some(operand.value);
                }
                if let (true, Some(source)) = (trivial, unique) {
                    copy_of[phi.result.index()] = Some(source);
                    found = true;
                }
            }
        }
        if !found {
            return Ok(false);
        }

        let resolved: Vec<Option<ValueId>> = (0..copy_of.len())
            .map(|idx| copy_of[idx].map(|_| resolve(&copy_of, ValueId::new(idx))))
            .collect();

        for block in &mut method.blocks {
            block.phis.retain(|phi| resolved[phi.result.index()].is_none());
            block
                .insns
                .retain(|insn| insn.result.is_none_or(|r| resolved[r.index()].is_none()));
            for phi in &mut block.phis {
                for operand in &mut phi.operands {
                    if let Some(source) = resolved[operand.value.index()] {
                        operand.value = source;
                    }
                }
            }
            for insn in &mut block.insns {
                for source in &mut insn.sources {
                    if let Some(root) = resolved[source.index()] {
                        *source = root;
                    }
                }
            }
        }
        Ok(true)
    }
}

/// Follows a copy chain to the first value that is not itself a copy.
fn resolve(copy_of: &[Option<ValueId>], start: ValueId) -> ValueId {
    let mut current = start;
    // Chains are acyclic in SSA; the bound only guards against malformed input.
    for _ in 0..copy_of.len() {
        match copy_of[current.index()] {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{Cond, Constant},
        ssa::optimize::testing::{code, insn_count, to_ssa},
        types::TypeId,
    };

    #[test]
    fn test_move_chain_collapses() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        let a = c.new_local(TypeId::Int).unwrap();
        let b = c.new_local(TypeId::Int).unwrap();
        c.move_value(a, x).unwrap();
        c.move_value(b, a).unwrap();
        c.return_value(b).unwrap();
        let mut ssa = to_ssa(&c);
        let before = insn_count(&ssa);
        assert!(CopyPropagationPass.run_on_method(&mut ssa).unwrap());
        assert_eq!(insn_count(&ssa), before - 2);
        let ret = ssa.blocks[ssa.entry.index()].last().unwrap();
        let param = ssa.blocks[ssa.entry.index()].insns[0].result.unwrap();
        assert_eq!(ret.sources, vec![param]);
    }

    #[test]
    fn test_loop_phi_of_invariant_is_trivial() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let n = c.param(0).unwrap();
        let k = c.new_local(TypeId::Int).unwrap();
        let top = c.new_label();
        let done = c.new_label();
        c.load_constant(k, Constant::Int(3)).unwrap();
        c.mark(top).unwrap();
        c.branch_zero(Cond::Le, n, done).unwrap();
        c.move_value(k, k).unwrap();
        c.binary(crate::ir::BinOp::Sub, n, n, k).unwrap();
        c.jump(top).unwrap();
        c.mark(done).unwrap();
        c.return_value(k).unwrap();
        let mut ssa = to_ssa(&c);
        let phis_before: usize = ssa.blocks.iter().map(|b| b.phis.len()).sum();
        assert_eq!(phis_before, 2);
        while CopyPropagationPass.run_on_method(&mut ssa).unwrap() {}
        let phis_after: usize = ssa.blocks.iter().map(|b| b.phis.len()).sum();
        assert_eq!(phis_after, 1);
    }

    #[test]
    fn test_no_copies_reports_unchanged() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        c.return_value(x).unwrap();
        let mut ssa = to_ssa(&c);
        assert!(!CopyPropagationPass.run_on_method(&mut ssa).unwrap());
    }
}
