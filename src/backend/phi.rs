//! Phi elimination: SSA with an allocation back to register form.
//!
//! Every value is replaced by its register. Each phi becomes a move at the end of every
//! predecessor, right before the `goto` that edge splitting guarantees is there; the moves
//! of one edge are a parallel batch and are ordered by [`super::moves::sequentialize`].
//! Operands that are undefined along an edge produce no move.

use crate::{
    backend::moves::{sequentialize, ParallelMove},
    ir::{BasicBlock, Insn, Op, RegSpec, RopMethod},
    regalloc::Allocation,
    ssa::{Definition, SsaMethod, ValueId},
    utils::graph::NodeId,
    Error, Result,
};

/// Rewrites `method` over the registers of `allocation`, inserting phi moves.
///
/// The returned method still has parameters at the bottom of the frame.
///
/// # Errors
/// Returns [`Error::AllocationInvariant`] if a used value has no register or a phi
/// predecessor does not end in a `goto`.
pub fn eliminate(method: &SsaMethod, allocation: &Allocation) -> Result<RopMethod> {
    let invariant = |message: String| Error::AllocationInvariant {
        method: method.name.clone(),
        message,
    };
    let reg = |value: ValueId| -> Result<RegSpec> {
        allocation
            .register(value)
            .map(|r| RegSpec::new(r, method.kind(value)))
            .ok_or_else(|| invariant(format!("{value} is used but has no register")))
    };

    let mut blocks: Vec<BasicBlock> = Vec::with_capacity(method.blocks.len());
    for block in &method.blocks {
        let mut insns = Vec::with_capacity(block.insns.len());
        for insn in &block.insns {
            let result = insn.result.map(reg).transpose()?;
            let sources = insn
                .sources
                .iter()
                .map(|&s| reg(s))
                .collect::<Result<Vec<_>>>()?;
            insns.push(Insn {
                op: insn.op.clone(),
                result,
                sources,
                line: insn.line,
            });
        }
        blocks.push(BasicBlock {
            insns,
            successors: block.successors.clone(),
            primary: block.primary,
            catches: block.catches.clone(),
            predecessors: block.predecessors.clone(),
        });
    }

    // Parallel batches, one per predecessor edge.
    let mut batches: Vec<Vec<ParallelMove>> = vec![Vec::new(); blocks.len()];
    for block in &method.blocks {
        for phi in &block.phis {
            let dst = reg(phi.result)?;
            for operand in &phi.operands {
                if method.value(operand.value).def == Definition::Undefined {
                    continue;
                }
                let Some(src) = allocation.register(operand.value) else {
                    continue;
                };
                batches[operand.predecessor.index()].push(ParallelMove {
                    dst,
                    src: RegSpec::new(src, dst.kind),
                });
            }
        }
    }

    let mut reg_count = allocation.reg_count;
    for (b, batch) in batches.into_iter().enumerate() {
        if batch.is_empty() {
            continue;
        }
        let (moves, temps) = sequentialize(&batch, allocation.reg_count);
        reg_count = reg_count.max(allocation.reg_count + temps);
        if moves.is_empty() {
            continue;
        }
        let block = &mut blocks[b];
        let line = match block.insns.last() {
            Some(last) if last.op == Op::Goto => last.line,
            _ => {
                return Err(invariant(format!(
                    "phi predecessor {} does not end in goto",
                    NodeId::new(b)
                )))
            }
        };
        let at = block.insns.len() - 1;
        block.insns.splice(
            at..at,
            moves
                .into_iter()
                .map(|m| Insn::new(Op::Move, Some(m.dst), vec![m.src]).at_line(line)),
        );
    }

    Ok(RopMethod {
        name: method.name.clone(),
        blocks,
        entry: method.entry,
        reg_count,
        param_words: allocation.param_words,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::Code,
        cfg,
        ir::{BinOp, Cond, Constant},
        regalloc, ssa,
        types::{MethodRef, TypeId},
    };

    #[test]
    fn test_loop_phis_become_moves() {
        let mut c = Code::new(
            MethodRef::new(TypeId::class("a/B"), "sum", TypeId::Int, vec![TypeId::Int]),
            true,
        );
        let n = c.param(0).unwrap();
        let acc = c.new_local(TypeId::Int).unwrap();
        let one = c.new_local(TypeId::Int).unwrap();
        let top = c.new_label();
        let done = c.new_label();
        c.load_constant(acc, Constant::Int(0)).unwrap();
        c.load_constant(one, Constant::Int(1)).unwrap();
        c.mark(top).unwrap();
        c.branch_zero(Cond::Le, n, done).unwrap();
        c.binary(BinOp::Add, acc, acc, n).unwrap();
        c.binary(BinOp::Sub, n, n, one).unwrap();
        c.jump(top).unwrap();
        c.mark(done).unwrap();
        c.return_value(acc).unwrap();

        let method = ssa::build(cfg::build(&c).unwrap()).unwrap();
        let allocation = regalloc::allocate(&method).unwrap();
        let rop = eliminate(&method, &allocation).unwrap();
        assert_eq!(rop.blocks.len(), method.blocks.len());
        assert!(rop.reg_count >= allocation.reg_count);
        for block in &rop.blocks {
            if let Some(last) = block.last() {
                if last.op == Op::Goto {
                    for insn in &block.insns[..block.insns.len() - 1] {
                        if insn.op == Op::Move {
                            let (dst, src) = (insn.result.unwrap(), insn.sources[0]);
                            assert_ne!(dst, src);
                        }
                    }
                }
            }
        }
    }
}
