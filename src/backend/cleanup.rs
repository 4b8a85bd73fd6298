//! Post-allocation block cleanup.
//!
//! Runs on the register-form method produced by phi elimination, in this order:
//!
//! 1. **Result folding** - a pseudo move receiving the result of a throwing instruction is
//!    folded back into that instruction. `check-cast` casts its source in place, so its
//!    result becomes a plain `move-object`. Call results stay as `move-result` in the
//!    successor, which layout must place directly after the call.
//! 2. **Goto-only removal** - blocks holding a single `goto` are bypassed.
//! 3. **Identical-block merging** - blocks with equal instructions and equal edges are
//!    merged, typically the handler copies created by edge splitting.
//! 4. **Parameter renumbering** - the argument words move from the bottom of the frame to
//!    the top, as the calling convention requires.

use log::trace;
use rustc_hash::FxHashMap;

use crate::{
    ir::{CatchEdge, Insn, Op, RegSpec, RopMethod},
    utils::graph::NodeId,
};

/// Runs every cleanup step on `method`.
pub fn run(method: &mut RopMethod) {
    fold_results(method);
    split_casts(method);
    let bypassed = remove_goto_only(method);
    let merged = merge_identical(method);
    renumber_params(method);
    trace!(
        "{}: bypassed {bypassed} goto blocks, merged {merged} duplicates, frame {}",
        method.name,
        method.reg_count
    );
}

enum Fold {
    Keep,
    Cast(Option<RegSpec>),
    Result,
}

fn fold_results(method: &mut RopMethod) {
    for b in 0..method.blocks.len() {
        let Some(primary) = method.blocks[b].primary else {
            continue;
        };
        let p = primary.index();
        if p == b || !method.blocks[p].starts_with_move_result() {
            continue;
        }
        let fold = match method.blocks[b].insns.last() {
            Some(Insn {
                op: Op::Invoke(..), ..
            })
            | None => Fold::Keep,
            Some(Insn {
                op: Op::CheckCast(_),
                sources,
                ..
            }) => Fold::Cast(sources.first().copied()),
            Some(_) => Fold::Result,
        };
        let pseudo = &method.blocks[p].insns[0];
        let (result, line) = (pseudo.result, pseudo.line);
        match fold {
            Fold::Keep => {}
            Fold::Cast(source) => match (result, source) {
                (Some(dst), Some(src)) if dst != src => {
                    method.blocks[p].insns[0] =
                        Insn::new(Op::Move, Some(dst), vec![src]).at_line(line);
                }
                _ => {
                    method.blocks[p].insns.remove(0);
                }
            },
            Fold::Result => {
                if let Some(last) = method.blocks[b].insns.last_mut() {
                    last.result = result;
                }
                method.blocks[p].insns.remove(0);
            }
        }
    }
}

/// `check-cast` outside a try region with a distinct result register.
fn split_casts(method: &mut RopMethod) {
    for block in &mut method.blocks {
        let mut i = 0;
        while i < block.insns.len() {
            let insn = &mut block.insns[i];
            if let (Op::CheckCast(_), Some(dst), [src]) =
                (&insn.op, insn.result, insn.sources.as_slice())
            {
                let src = *src;
                let line = insn.line;
                insn.result = None;
                if dst != src {
                    block
                        .insns
                        .insert(i + 1, Insn::new(Op::Move, Some(dst), vec![src]).at_line(line));
                    i += 1;
                }
            }
            i += 1;
        }
    }
}

fn remove_goto_only(method: &mut RopMethod) -> usize {
    let mut removed = 0;
    let mut keep = vec![true; method.blocks.len()];
    for b in 0..method.blocks.len() {
        if !method.blocks[b].is_goto_only() {
            continue;
        }
        let Some(target) = method.blocks[b].primary else {
            continue;
        };
        if target.index() == b || method.blocks[target.index()].starts_with_move_result() {
            continue;
        }
        let node = NodeId::new(b);
        for other in &mut method.blocks {
            other.replace_successor(node, target);
        }
        if method.entry == node {
            method.entry = target;
        }
        keep[b] = false;
        removed += 1;
    }
    if removed > 0 {
        method.retain_blocks(&keep);
    }
    removed
}

#[derive(PartialEq, Eq, Hash)]
struct BlockShape<'a> {
    insns: &'a [Insn],
    successors: &'a [NodeId],
    primary: Option<NodeId>,
    catches: &'a [CatchEdge],
}

fn merge_identical(method: &mut RopMethod) -> usize {
    let mut merged = 0;
    loop {
        let mut survivor: FxHashMap<BlockShape<'_>, usize> = FxHashMap::default();
        let mut redirect: Vec<(NodeId, NodeId)> = Vec::new();
        for (b, block) in method.blocks.iter().enumerate() {
            if NodeId::new(b) == method.entry || block.starts_with_move_result() {
                continue;
            }
            let shape = BlockShape {
                insns: &block.insns,
                successors: &block.successors,
                primary: block.primary,
                catches: &block.catches,
            };
            // A block branching to itself is only equal to another in name.
            if block.successors.contains(&NodeId::new(b)) {
                continue;
            }
            match survivor.get(&shape) {
                Some(&first) => redirect.push((NodeId::new(b), NodeId::new(first))),
                None => {
                    survivor.insert(shape, b);
                }
            }
        }
        if redirect.is_empty() {
            return merged;
        }
        let mut keep = vec![true; method.blocks.len()];
        for &(duplicate, first) in &redirect {
            for block in &mut method.blocks {
                block.replace_successor(duplicate, first);
            }
            keep[duplicate.index()] = false;
        }
        merged += redirect.len();
        method.retain_blocks(&keep);
    }
}

/// Moves the argument words from `0..param_words` to the top of the frame.
fn renumber_params(method: &mut RopMethod) {
    let frame = method.reg_count.max(method.param_words);
    let words = method.param_words;
    let shift = |spec: &mut RegSpec| {
        spec.reg = if spec.reg < words {
            spec.reg + (frame - words)
        } else {
            spec.reg - words
        };
    };
    for block in &mut method.blocks {
        for insn in &mut block.insns {
            if let Some(result) = &mut insn.result {
                shift(result);
            }
            for source in &mut insn.sources {
                shift(source);
            }
        }
    }
    method.reg_count = frame;
}

/// Register of parameter word `index` after renumbering.
#[must_use]
pub fn param_register(method: &RopMethod, index: u32) -> u32 {
    method.reg_count - method.param_words + index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{BasicBlock, Constant},
        types::{Kind, TypeId},
    };

    fn goto(target: usize) -> BasicBlock {
        BasicBlock {
            insns: vec![Insn::goto()],
            successors: vec![NodeId::new(target)],
            primary: Some(NodeId::new(target)),
            ..BasicBlock::default()
        }
    }

    fn ret(reg: u32) -> BasicBlock {
        BasicBlock {
            insns: vec![Insn::new(Op::Return, None, vec![RegSpec::new(reg, Kind::Int)])],
            ..BasicBlock::default()
        }
    }

    fn method(blocks: Vec<BasicBlock>, reg_count: u32, param_words: u32) -> RopMethod {
        let mut m = RopMethod {
            name: "m".into(),
            blocks,
            entry: NodeId::new(0),
            reg_count,
            param_words,
        };
        m.compute_predecessors();
        m
    }

    #[test]
    fn test_goto_chain_is_bypassed() {
        let branch = BasicBlock {
            insns: vec![Insn::new(
                Op::IfZ(crate::ir::Cond::Eq),
                None,
                vec![RegSpec::new(0, Kind::Int)],
            )],
            successors: vec![NodeId::new(1), NodeId::new(2)],
            primary: Some(NodeId::new(1)),
            ..BasicBlock::default()
        };
        let mut m = method(vec![branch, goto(3), goto(3), ret(0)], 1, 1);
        run(&mut m);
        assert_eq!(m.blocks.len(), 2);
        assert_eq!(m.blocks[0].successors, vec![NodeId::new(1), NodeId::new(1)]);
    }

    #[test]
    fn test_identical_handlers_merge() {
        let handler = |reg: u32| BasicBlock {
            insns: vec![
                Insn::new(Op::MoveException, Some(RegSpec::new(reg, Kind::Object)), vec![]),
                Insn::new(Op::Throw, None, vec![RegSpec::new(reg, Kind::Object)]),
            ],
            ..BasicBlock::default()
        };
        let call = |handler: usize, next: usize| BasicBlock {
            insns: vec![Insn::new(
                Op::SGet(crate::types::FieldRef::new(TypeId::class("a/B"), "f", TypeId::Int)),
                Some(RegSpec::new(0, Kind::Int)),
                vec![],
            )],
            successors: vec![NodeId::new(next), NodeId::new(handler)],
            primary: Some(NodeId::new(next)),
            catches: vec![CatchEdge {
                ty: None,
                handler: NodeId::new(handler),
            }],
            ..BasicBlock::default()
        };
        let mut m = method(
            vec![call(3, 1), call(4, 2), ret(0), handler(1), handler(1)],
            2,
            0,
        );
        run(&mut m);
        assert_eq!(m.blocks.len(), 4);
        assert_eq!(m.blocks[0].catches[0].handler, m.blocks[1].catches[0].handler);
    }

    #[test]
    fn test_params_move_to_top() {
        let block = BasicBlock {
            insns: vec![
                Insn::new(Op::MoveParam { index: 0 }, Some(RegSpec::new(0, Kind::Int)), vec![]),
                Insn::new(Op::Const(Constant::Int(1)), Some(RegSpec::new(1, Kind::Int)), vec![]),
                Insn::new(
                    Op::Binary(crate::ir::BinOp::Add),
                    Some(RegSpec::new(1, Kind::Int)),
                    vec![RegSpec::new(0, Kind::Int), RegSpec::new(1, Kind::Int)],
                ),
                Insn::new(Op::Return, None, vec![RegSpec::new(1, Kind::Int)]),
            ],
            ..BasicBlock::default()
        };
        let mut m = method(vec![block], 2, 1);
        run(&mut m);
        let insns = &m.blocks[0].insns;
        assert_eq!(insns[0].result.unwrap().reg, 1);
        assert_eq!(insns[1].result.unwrap().reg, 0);
        assert_eq!(param_register(&m, 0), 1);
    }

    #[test]
    fn test_cast_result_becomes_move() {
        let obj = |reg| RegSpec::new(reg, Kind::Object);
        let block = BasicBlock {
            insns: vec![
                Insn::new(Op::CheckCast(TypeId::string()), Some(obj(1)), vec![obj(0)]),
                Insn::new(Op::Return, None, vec![obj(1)]),
            ],
            ..BasicBlock::default()
        };
        let mut m = method(vec![block], 2, 0);
        run(&mut m);
        let insns = &m.blocks[0].insns;
        assert!(insns[0].result.is_none());
        assert_eq!(insns[1].op, Op::Move);
    }
}
