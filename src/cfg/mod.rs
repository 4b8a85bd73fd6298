//! Control-flow graph assembly.
//!
//! [`build`] partitions a method's instruction stream into basic blocks and wires up normal
//! and exceptional edges, following the block conventions of [`crate::ir`]:
//!
//! - a block begins at every marked label and after every control or catch-covered throwing
//!   instruction;
//! - a block that would fall into the next one is closed with an explicit `goto`;
//! - a throwing instruction whose result must not be visible on its exception edges gets a
//!   dedicated successor block that receives the result through a pseudo move.
//!
//! Structural problems are reported as [`Error::Structural`] with the stream position of the
//! offending instruction: branches to labels that were never marked, code that runs off the
//! end of the method, `move-exception` outside a handler head, and locals read before they are
//! definitely assigned on every path.

use log::trace;

use crate::{
    builder::{Code, Item, Label, StreamInsn},
    ir::{BasicBlock, CatchEdge, Insn, Op, RopMethod},
    utils::{
        bitset::BitSet,
        graph::{reverse_postorder, NodeId},
    },
    Error, Result,
};

#[derive(Default)]
struct RawBlock<'a> {
    insns: Vec<(usize, &'a StreamInsn)>,
}

struct Assembler<'a> {
    code: &'a Code,
    blocks: Vec<BasicBlock>,
    /// Stream position of every instruction, parallel to `blocks`.
    positions: Vec<Vec<usize>>,
    /// Blocks whose normal successor would lie past the last instruction.
    falls_off: Vec<Option<usize>>,
}

/// Builds the control-flow graph of `code`.
///
/// # Errors
/// Returns [`Error::Structural`] for malformed instruction streams.
pub fn build(code: &Code) -> Result<RopMethod> {
    let (raw, label_block) = partition(code);
    let mut asm = Assembler {
        code,
        blocks: Vec::with_capacity(raw.len()),
        positions: Vec::with_capacity(raw.len()),
        falls_off: Vec::with_capacity(raw.len()),
    };
    for _ in 0..raw.len() {
        asm.blocks.push(BasicBlock::default());
        asm.positions.push(Vec::new());
        asm.falls_off.push(None);
    }
    for (index, block) in raw.iter().enumerate() {
        asm.wire(index, block, raw.len(), &label_block)?;
    }

    let mut method = RopMethod {
        name: code.method().to_string(),
        blocks: asm.blocks,
        entry: NodeId::new(0),
        reg_count: code.local_count(),
        param_words: code.param_words(),
    };
    method.compute_predecessors();
    if !method.blocks[0].predecessors.is_empty() {
        // The entry block must not be a branch target.
        method.blocks.push(BasicBlock {
            insns: vec![Insn::goto()],
            successors: vec![NodeId::new(0)],
            primary: Some(NodeId::new(0)),
            ..BasicBlock::default()
        });
        asm.positions.push(vec![0]);
        asm.falls_off.push(None);
        method.entry = NodeId::new(method.blocks.len() - 1);
        method.compute_predecessors();
    }

    let order = reverse_postorder(&method, method.entry);
    for node in &order {
        if let Some(position) = asm.falls_off[node.index()] {
            return Err(structural(code, position, "control falls off the end of the method"));
        }
        let block = &method.blocks[node.index()];
        for (i, insn) in block.insns.iter().enumerate() {
            let misplaced = match insn.op {
                Op::MoveException => i != 0,
                Op::MoveParam { .. } => *node != method.entry,
                _ => false,
            };
            if misplaced {
                return Err(structural(
                    code,
                    asm.positions[node.index()][i],
                    format!("{} must start its block", insn.op),
                ));
            }
        }
    }

    check_definite_assignment(&method, &order, &asm.positions, code)?;
    method.remove_unreachable();
    trace!(
        "assembled {} into {} blocks",
        method.name,
        method.blocks.len()
    );
    Ok(method)
}

/// Splits the stream into raw blocks and resolves every label to the block it heads.
fn partition(code: &Code) -> (Vec<RawBlock<'_>>, Vec<Option<usize>>) {
    let mut raw = vec![RawBlock::default()];
    let mut label_block = vec![None; code.label_count()];
    for (position, item) in code.items().iter().enumerate() {
        match item {
            Item::Mark(label) => {
                if !raw.last().is_some_and(|b| b.insns.is_empty()) {
                    raw.push(RawBlock::default());
                }
                label_block[label.0 as usize] = Some(raw.len() - 1);
            }
            Item::Insn(stream) => {
                let ends = stream.insn.is_control()
                    || (stream.insn.can_throw() && !stream.catches.is_empty());
                if let Some(current) = raw.last_mut() {
                    current.insns.push((position, stream));
                }
                if ends {
                    raw.push(RawBlock::default());
                }
            }
        }
    }
    let trailing_unused = raw.last().is_some_and(|b| b.insns.is_empty())
        && !label_block.contains(&Some(raw.len() - 1));
    if trailing_unused && raw.len() > 1 {
        raw.pop();
    }
    (raw, label_block)
}

impl Assembler<'_> {
    fn wire(
        &mut self,
        index: usize,
        raw: &RawBlock<'_>,
        raw_count: usize,
        label_block: &[Option<usize>],
    ) -> Result<()> {
        let next = (index + 1 < raw_count).then(|| NodeId::new(index + 1));
        let last_position = raw.insns.last().map_or(0, |(p, _)| *p);
        let mut insns: Vec<Insn> = raw.insns.iter().map(|(_, s)| s.insn.clone()).collect();
        let mut positions: Vec<usize> = raw.insns.iter().map(|(p, _)| *p).collect();
        let code = self.code;
        let resolve = |label: Label, position: usize| {
            label_block
                .get(label.0 as usize)
                .copied()
                .flatten()
                .map(NodeId::new)
                .ok_or_else(|| structural(code, position, format!("label {} never marked", label.0)))
        };

        let mut successors = Vec::new();
        let mut primary = None;
        let mut catches = Vec::new();

        let Some((_, last)) = raw.insns.last() else {
            self.fall_through(index, next, &mut insns, &mut positions, last_position);
            return Ok(());
        };

        if last.insn.can_throw() {
            for clause in last.catches.iter() {
                if catches.iter().any(|c: &CatchEdge| c.ty == clause.ty) {
                    continue;
                }
                let handler = resolve(clause.handler, last_position)?;
                catches.push(CatchEdge {
                    ty: clause.ty.clone(),
                    handler,
                });
            }
        }
        let throws = !catches.is_empty();

        match &last.insn.op {
            Op::Goto => {
                let target = resolve(last.target.ok_or_else(|| {
                    structural(code, last_position, "goto without target")
                })?, last_position)?;
                successors.push(target);
                primary = Some(target);
            }
            Op::If(_) | Op::IfZ(_) => {
                let target = resolve(last.target.ok_or_else(|| {
                    structural(code, last_position, "branch without target")
                })?, last_position)?;
                match next {
                    Some(next) => {
                        successors.push(next);
                        successors.push(target);
                        primary = Some(next);
                    }
                    None => self.falls_off[index] = Some(last_position),
                }
            }
            Op::Return => {}
            Op::Throw => {
                for catch in &catches {
                    push_unique(&mut successors, catch.handler);
                }
            }
            _ if throws => {
                let normal = match (last.insn.result, next) {
                    (_, None) => {
                        self.falls_off[index] = Some(last_position);
                        None
                    }
                    (Some(result), Some(next)) => {
                        if let Some(insn) = insns.last_mut() {
                            insn.result = None;
                        }
                        let pseudo = NodeId::new(self.blocks.len());
                        self.blocks.push(BasicBlock {
                            insns: vec![
                                Insn::new(Op::MoveResultPseudo, Some(result), Vec::new())
                                    .at_line(last.insn.line),
                                Insn::goto().at_line(last.insn.line),
                            ],
                            successors: vec![next],
                            primary: Some(next),
                            ..BasicBlock::default()
                        });
                        self.positions.push(vec![last_position, last_position]);
                        self.falls_off.push(None);
                        Some(pseudo)
                    }
                    (None, Some(next)) => Some(next),
                };
                if let Some(normal) = normal {
                    successors.push(normal);
                    primary = Some(normal);
                }
                for catch in &catches {
                    push_unique(&mut successors, catch.handler);
                }
            }
            _ => {
                self.fall_through(index, next, &mut insns, &mut positions, last_position);
                return Ok(());
            }
        }

        let block = &mut self.blocks[index];
        block.insns = insns;
        block.successors = successors;
        block.primary = primary;
        block.catches = catches;
        self.positions[index] = positions;
        Ok(())
    }

    fn fall_through(
        &mut self,
        index: usize,
        next: Option<NodeId>,
        insns: &mut Vec<Insn>,
        positions: &mut Vec<usize>,
        position: usize,
    ) {
        let line = insns.last().and_then(|i| i.line);
        insns.push(Insn::goto().at_line(line));
        positions.push(position);
        let block = &mut self.blocks[index];
        block.insns = std::mem::take(insns);
        match next {
            Some(next) => {
                block.successors = vec![next];
                block.primary = Some(next);
            }
            None => self.falls_off[index] = Some(position),
        }
        self.positions[index] = std::mem::take(positions);
    }
}

fn push_unique(list: &mut Vec<NodeId>, node: NodeId) {
    if !list.contains(&node) {
        list.push(node);
    }
}

/// Forward must-analysis over locals: a local is assigned at a point if every path from the
/// entry assigns it.
fn check_definite_assignment(
    method: &RopMethod,
    order: &[NodeId],
    positions: &[Vec<usize>],
    code: &Code,
) -> Result<()> {
    let locals = method.reg_count as usize;
    let count = method.blocks.len();
    let mut outs: Vec<Option<BitSet>> = vec![None; count];

    let block_in = |node: NodeId, outs: &[Option<BitSet>]| -> BitSet {
        if node == method.entry {
            return BitSet::new(locals);
        }
        let mut state = BitSet::full(locals);
        for pred in &method.blocks[node.index()].predecessors {
            if let Some(out) = &outs[pred.index()] {
                state.intersect_with(out);
            }
        }
        state
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &node in order {
            let mut state = block_in(node, &outs);
            for insn in &method.blocks[node.index()].insns {
                if let Some(result) = insn.result {
                    state.insert(result.reg as usize);
                }
            }
            if outs[node.index()].as_ref() != Some(&state) {
                outs[node.index()] = Some(state);
                changed = true;
            }
        }
    }

    for &node in order {
        let mut state = block_in(node, &outs);
        for (i, insn) in method.blocks[node.index()].insns.iter().enumerate() {
            for source in &insn.sources {
                if !state.contains(source.reg as usize) {
                    return Err(structural(
                        code,
                        positions[node.index()][i],
                        format!("local {} read before assignment", source.reg),
                    ));
                }
            }
            if let Some(result) = insn.result {
                state.insert(result.reg as usize);
            }
        }
    }
    Ok(())
}

fn structural(code: &Code, index: usize, message: impl Into<String>) -> Error {
    Error::Structural {
        method: code.method().to_string(),
        index,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{Cond, Constant},
        types::{MethodRef, TypeId},
    };

    fn code(params: Vec<TypeId>, ret: TypeId) -> Code {
        Code::new(MethodRef::new(TypeId::class("a/B"), "m", ret, params), true)
    }

    #[test]
    fn test_straight_line_single_block() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        c.return_value(x).unwrap();
        let method = build(&c).unwrap();
        assert_eq!(method.blocks.len(), 1);
        assert_eq!(method.blocks[0].insns.len(), 2);
        assert_eq!(method.exit_blocks(), vec![method.entry]);
    }

    #[test]
    fn test_if_successor_order() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        let skip = c.new_label();
        c.branch_zero(Cond::Eq, x, skip).unwrap();
        c.load_constant(x, Constant::Int(5)).unwrap();
        c.mark(skip).unwrap();
        c.return_value(x).unwrap();
        let method = build(&c).unwrap();
        let entry = &method.blocks[method.entry.index()];
        assert_eq!(entry.successors.len(), 2);
        let fallthrough = &method.blocks[entry.successors[0].index()];
        assert!(matches!(fallthrough.insns[0].op, Op::Const(_)));
        assert_eq!(entry.taken(), fallthrough.successors.first().copied());
    }

    #[test]
    fn test_unmarked_label_is_structural() {
        let mut c = code(vec![], TypeId::Void);
        let nowhere = c.new_label();
        c.jump(nowhere).unwrap();
        let err = build(&c).unwrap_err();
        assert!(matches!(err, Error::Structural { index: 0, .. }));
    }

    #[test]
    fn test_fall_off_end_is_structural() {
        let mut c = code(vec![TypeId::Int], TypeId::Void);
        let x = c.param(0).unwrap();
        c.move_value(x, x).unwrap();
        assert!(matches!(build(&c), Err(Error::Structural { .. })));
    }

    #[test]
    fn test_use_before_assignment() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let x = c.param(0).unwrap();
        let y = c.new_local(TypeId::Int).unwrap();
        let join = c.new_label();
        c.branch_zero(Cond::Eq, x, join).unwrap();
        c.load_constant(y, Constant::Int(1)).unwrap();
        c.mark(join).unwrap();
        c.return_value(y).unwrap();
        let err = build(&c).unwrap_err();
        assert!(matches!(err, Error::Structural { index: 4, .. }));
    }

    #[test]
    fn test_throwing_result_moves_to_pseudo_block() {
        let mut c = code(vec![], TypeId::Int);
        let callee = MethodRef::new(TypeId::class("a/C"), "f", TypeId::Int, vec![]);
        let r = c.new_local(TypeId::Int).unwrap();
        let handler = c.new_label();
        c.add_catch(None, handler).unwrap();
        c.invoke_static(&callee, Some(r), &[]).unwrap();
        c.remove_catch(None).unwrap();
        c.return_value(r).unwrap();
        c.mark(handler).unwrap();
        let e = c.new_local(TypeId::throwable()).unwrap();
        c.move_exception(e).unwrap();
        c.load_constant(r, Constant::Int(0)).unwrap();
        c.return_value(r).unwrap();

        let method = build(&c).unwrap();
        let entry = &method.blocks[method.entry.index()];
        let invoke = entry.insns.last().unwrap();
        assert!(matches!(invoke.op, Op::Invoke(..)));
        assert!(invoke.result.is_none());
        assert_eq!(entry.catches.len(), 1);
        let normal = &method.blocks[entry.primary.unwrap().index()];
        assert!(normal.starts_with_move_result());
        let handler = &method.blocks[entry.catches[0].handler.index()];
        assert!(handler.starts_with_move_exception());
    }

    #[test]
    fn test_loop_to_start_gets_fresh_entry() {
        let mut c = code(vec![], TypeId::Void);
        let top = c.new_label();
        c.mark(top).unwrap();
        c.jump(top).unwrap();
        let method = build(&c).unwrap();
        assert!(method.blocks[method.entry.index()].predecessors.is_empty());
        assert_eq!(method.blocks.len(), 2);
    }

    #[test]
    fn test_misplaced_move_exception() {
        let mut c = code(vec![], TypeId::Void);
        let e = c.new_local(TypeId::throwable()).unwrap();
        c.load_constant(e, Constant::Null).unwrap();
        c.move_exception(e).unwrap();
        c.return_void().unwrap();
        assert!(build(&c).is_err());
    }
}
