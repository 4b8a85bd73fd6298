//! Dead code elimination.
//!
//! Mark-and-sweep over SSA values. Everything that can have an effect beyond its result is
//! a root: control transfers, stores, calls, allocations, anything that may throw, and the
//! parameter, exception and pseudo-result moves that pin block structure. Values reachable
//! from the roots through sources and phi operands are live; pure instructions and phis
//! defining only dead values are removed. Unused call results are dropped so no
//! `move-result` is emitted for them.

use crate::{
    ir::Op,
    ssa::{optimize::SsaPass, SsaMethod, ValueId},
    utils::bitset::BitSet,
    Result,
};

/// Removes unused pure instructions and phis.
pub struct DeadCodeEliminationPass;

#[derive(Clone, Copy)]
enum Def {
    Phi(usize, usize),
    Insn(usize, usize),
}

impl SsaPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run_on_method(&self, method: &mut SsaMethod) -> Result<bool> {
        let mut defs: Vec<Option<Def>> = vec![None; method.value_count()];
        let mut live = BitSet::new(method.value_count());
        let mut worklist: Vec<ValueId> = Vec::new();

        for (b, block) in method.blocks.iter().enumerate() {
            for (i, phi) in block.phis.iter().enumerate() {
                defs[phi.result.index()] = Some(Def::Phi(b, i));
            }
            for (i, insn) in block.insns.iter().enumerate() {
                if let Some(result) = insn.result {
                    defs[result.index()] = Some(Def::Insn(b, i));
                }
                if !method.is_pure(insn) {
                    worklist.extend(insn.sources.iter().copied());
                }
            }
        }

        while let Some(value) = worklist.pop() {
            if !live.insert(value.index()) {
                continue;
            }
            match defs[value.index()] {
                Some(Def::Phi(b, i)) => {
                    worklist.extend(method.blocks[b].phis[i].operands.iter().map(|o| o.value));
                }
                Some(Def::Insn(b, i)) => {
                    worklist.extend(method.blocks[b].insns[i].sources.iter().copied());
                }
                None => {}
            }
        }

        let mut changed = false;
        for b in 0..method.blocks.len() {
            let before = method.blocks[b].phis.len();
            method.blocks[b]
                .phis
                .retain(|phi| live.contains(phi.result.index()));
            changed |= method.blocks[b].phis.len() != before;

            let kinds: Vec<bool> = method.blocks[b]
                .insns
                .iter()
                .map(|insn| method.is_pure(insn))
                .collect();
            let mut index = 0;
            let before = method.blocks[b].insns.len();
            method.blocks[b].insns.retain(|insn| {
                let pure = kinds[index];
                index += 1;
                !pure || insn.result.is_some_and(|r| live.contains(r.index()))
            });
            changed |= method.blocks[b].insns.len() != before;

            for insn in &mut method.blocks[b].insns {
                if let (Op::Invoke(..), Some(result)) = (&insn.op, insn.result) {
                    if !live.contains(result.index()) {
                        insn.result = None;
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{BinOp, Constant},
        ssa::optimize::testing::{code, insn_count, to_ssa},
        types::{MethodRef, TypeId},
    };

    #[test]
    fn test_removes_unused_arithmetic() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        let t = c.new_local(TypeId::Int).unwrap();
        c.load_constant(t, Constant::Int(9)).unwrap();
        c.binary(BinOp::Add, t, t, x).unwrap();
        c.return_value(x).unwrap();
        let mut ssa = to_ssa(&c);
        let before = insn_count(&ssa);
        assert!(DeadCodeEliminationPass.run_on_method(&mut ssa).unwrap());
        assert_eq!(insn_count(&ssa), before - 2);
    }

    #[test]
    fn test_keeps_throwing_division_and_params() {
        let mut c = code(vec![TypeId::Int, TypeId::Int], TypeId::Void);
        let a = c.param(0).unwrap();
        let b = c.param(1).unwrap();
        let t = c.new_local(TypeId::Int).unwrap();
        c.binary(BinOp::Div, t, a, b).unwrap();
        c.return_void().unwrap();
        let mut ssa = to_ssa(&c);
        let before = insn_count(&ssa);
        assert!(!DeadCodeEliminationPass.run_on_method(&mut ssa).unwrap());
        assert_eq!(insn_count(&ssa), before);
    }

    #[test]
    fn test_keeps_guarded_division_with_pseudo_result() {
        let arithmetic = TypeId::class("java/lang/ArithmeticException");
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        let hundred = c.new_local(TypeId::Int).unwrap();
        let result = c.new_local(TypeId::Int).unwrap();
        let caught = c.new_local(TypeId::throwable()).unwrap();
        let handler = c.new_label();
        c.load_constant(hundred, Constant::Int(100)).unwrap();
        c.load_constant(result, Constant::Int(-1)).unwrap();
        c.add_catch(Some(arithmetic.clone()), handler).unwrap();
        c.binary(BinOp::Div, result, hundred, x).unwrap();
        c.remove_catch(Some(&arithmetic)).unwrap();
        c.return_value(result).unwrap();
        c.mark(handler).unwrap();
        c.move_exception(caught).unwrap();
        c.return_value(result).unwrap();
        let mut ssa = to_ssa(&c);

        let division = |m: &SsaMethod| {
            m.blocks
                .iter()
                .flat_map(|b| &b.insns)
                .find(|i| i.op == Op::Binary(BinOp::Div))
                .cloned()
        };
        let div = division(&ssa).unwrap();
        assert!(div.result.is_none());
        assert!(ssa.can_throw(&div));

        DeadCodeEliminationPass.run_on_method(&mut ssa).unwrap();
        assert!(division(&ssa).is_some());
        assert!(ssa
            .blocks
            .iter()
            .flat_map(|b| &b.insns)
            .any(|i| i.op == Op::MoveResultPseudo));
    }

    #[test]
    fn test_drops_unused_call_result() {
        let mut c = code(vec![], TypeId::Void);
        let callee = MethodRef::new(TypeId::class("a/C"), "f", TypeId::Long, vec![]);
        let r = c.new_local(TypeId::Long).unwrap();
        c.invoke_static(&callee, Some(r), &[]).unwrap();
        c.return_void().unwrap();
        let mut ssa = to_ssa(&c);
        assert!(DeadCodeEliminationPass.run_on_method(&mut ssa).unwrap());
        let invoke = &ssa.blocks[ssa.entry.index()].insns[0];
        assert!(matches!(invoke.op, Op::Invoke(..)));
        assert!(invoke.result.is_none());
    }
}
