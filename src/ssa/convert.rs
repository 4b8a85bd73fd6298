use log::trace;

use crate::{
    ir::{BasicBlock, Insn, Op, RopMethod},
    ssa::{Definition, PhiNode, PhiOperand, SsaBlock, SsaInsn, SsaMethod, SsaValue, ValueId},
    types::Kind,
    utils::{
        bitset::BitSet,
        graph::{compute_dominance_frontiers, compute_dominators, postorder, DominatorTree, NodeId},
    },
    Result,
};

/// Converts a block-form method over locals into SSA form.
///
/// # Errors
/// Currently infallible for methods produced by [`crate::cfg::build`]; the signature leaves
/// room for rejecting inconsistent local kinds.
pub fn build(mut method: RopMethod) -> Result<SsaMethod> {
    split_edges(&mut method);
    let kinds = local_kinds(&method)?;
    let live_in = local_liveness(&method);
    let tree = compute_dominators(&method, method.entry);
    let frontiers = compute_dominance_frontiers(&method, &tree);
    let placement = place_phis(&method, &frontiers, &live_in);
    let ssa = Renamer::new(&method, &kinds).run(&method, &tree, placement);
    trace!(
        "{}: {} blocks, {} values in SSA form",
        ssa.name,
        ssa.blocks.len(),
        ssa.values.len()
    );
    Ok(ssa)
}

/// Splits the edges into join blocks so that the moves realizing phis can be placed in a
/// block whose only exit is a `goto`.
fn split_edges(method: &mut RopMethod) {
    method.compute_predecessors();
    let original = method.blocks.len();
    for index in 0..original {
        let target = NodeId::new(index);
        let preds = method.blocks[index].predecessors.clone();
        if preds.len() < 2 {
            continue;
        }
        if method.blocks[index].starts_with_move_exception() {
            let head = method.blocks[index].insns.remove(0);
            for pred in preds {
                let line = head.line;
                let split = push_goto_block(method, vec![head.clone(), Insn::goto().at_line(line)], target);
                method.blocks[pred.index()].replace_successor(target, split);
            }
        } else {
            for pred in preds {
                let ends_in_goto = method.blocks[pred.index()]
                    .last()
                    .is_some_and(|insn| insn.op == Op::Goto);
                if ends_in_goto {
                    continue;
                }
                let split = push_goto_block(method, vec![Insn::goto()], target);
                method.blocks[pred.index()].replace_successor(target, split);
            }
        }
    }
    method.compute_predecessors();
}

fn push_goto_block(method: &mut RopMethod, insns: Vec<Insn>, target: NodeId) -> NodeId {
    method.blocks.push(BasicBlock {
        insns,
        successors: vec![target],
        primary: Some(target),
        ..BasicBlock::default()
    });
    NodeId::new(method.blocks.len() - 1)
}

fn local_kinds(method: &RopMethod) -> Result<Vec<Kind>> {
    let mut kinds: Vec<Option<Kind>> = vec![None; method.reg_count as usize];
    for block in &method.blocks {
        for insn in &block.insns {
            for spec in insn.result.iter().chain(&insn.sources) {
                let slot = &mut kinds[spec.reg as usize];
                match slot {
                    Some(kind) if *kind != spec.kind => {
                        return Err(crate::Error::Structural {
                            method: method.name.clone(),
                            index: spec.reg as usize,
                            message: format!("local {} used as {} and {}", spec.reg, kind, spec.kind),
                        })
                    }
                    _ => *slot = Some(spec.kind),
                }
            }
        }
    }
    Ok(kinds.into_iter().map(|k| k.unwrap_or(Kind::Int)).collect())
}

/// Live-in sets over locals, used to prune phi placement.
fn local_liveness(method: &RopMethod) -> Vec<BitSet> {
    let locals = method.reg_count as usize;
    let count = method.blocks.len();
    let mut uses = vec![BitSet::new(locals); count];
    let mut defs = vec![BitSet::new(locals); count];
    for (idx, block) in method.blocks.iter().enumerate() {
        for insn in &block.insns {
            for source in &insn.sources {
                if !defs[idx].contains(source.reg as usize) {
                    uses[idx].insert(source.reg as usize);
                }
            }
            if let Some(result) = insn.result {
                defs[idx].insert(result.reg as usize);
            }
        }
    }

    let order = postorder(method, method.entry);
    let mut live_in = vec![BitSet::new(locals); count];
    let mut changed = true;
    while changed {
        changed = false;
        for &node in &order {
            let idx = node.index();
            let mut live = BitSet::new(locals);
            for succ in &method.blocks[idx].successors {
                live.union_with(&live_in[succ.index()]);
            }
            live.difference_with(&defs[idx]);
            live.union_with(&uses[idx]);
            if live != live_in[idx] {
                live_in[idx] = live;
                changed = true;
            }
        }
    }
    live_in
}

/// Locals needing a phi at each block: iterated dominance frontiers of their definitions,
/// pruned to blocks where the local is live on entry.
fn place_phis(method: &RopMethod, frontiers: &[Vec<NodeId>], live_in: &[BitSet]) -> Vec<Vec<u32>> {
    let locals = method.reg_count as usize;
    let mut def_sites: Vec<Vec<NodeId>> = vec![Vec::new(); locals];
    for (idx, block) in method.blocks.iter().enumerate() {
        for insn in &block.insns {
            if let Some(result) = insn.result {
                let sites = &mut def_sites[result.reg as usize];
                if sites.last() != Some(&NodeId::new(idx)) {
                    sites.push(NodeId::new(idx));
                }
            }
        }
    }

    let mut placement = vec![Vec::new(); method.blocks.len()];
    for (local, sites) in def_sites.into_iter().enumerate() {
        let mut has_phi = BitSet::new(method.blocks.len());
        let mut queued = BitSet::new(method.blocks.len());
        for site in &sites {
            queued.insert(site.index());
        }
        let mut worklist = sites;
        while let Some(node) = worklist.pop() {
            for &frontier in &frontiers[node.index()] {
                let y = frontier.index();
                if has_phi.contains(y) || !live_in[y].contains(local) {
                    continue;
                }
                has_phi.insert(y);
                placement[y].push(local as u32);
                if queued.insert(y) {
                    worklist.push(frontier);
                }
            }
        }
    }
    placement
}

enum Frame {
    Enter(NodeId),
    Exit(Vec<u32>),
}

struct Renamer<'a> {
    kinds: &'a [Kind],
    values: Vec<SsaValue>,
    versions: Vec<u32>,
    stacks: Vec<Vec<ValueId>>,
    undefined: Vec<Option<ValueId>>,
}

impl<'a> Renamer<'a> {
    fn new(method: &RopMethod, kinds: &'a [Kind]) -> Self {
        let locals = method.reg_count as usize;
        Renamer {
            kinds,
            values: Vec::new(),
            versions: vec![0; locals],
            stacks: vec![Vec::new(); locals],
            undefined: vec![None; locals],
        }
    }

    fn fresh(&mut self, local: u32, def: Definition) -> ValueId {
        let version = &mut self.versions[local as usize];
        *version += 1;
        self.values.push(SsaValue {
            kind: self.kinds[local as usize],
            local,
            version: *version,
            def,
        });
        ValueId::new(self.values.len() - 1)
    }

    fn current(&mut self, local: u32) -> ValueId {
        if let Some(&top) = self.stacks[local as usize].last() {
            return top;
        }
        if let Some(id) = self.undefined[local as usize] {
            return id;
        }
        self.values.push(SsaValue {
            kind: self.kinds[local as usize],
            local,
            version: 0,
            def: Definition::Undefined,
        });
        let id = ValueId::new(self.values.len() - 1);
        self.undefined[local as usize] = Some(id);
        id
    }

    fn run(mut self, method: &RopMethod, tree: &DominatorTree, placement: Vec<Vec<u32>>) -> SsaMethod {
        let mut blocks: Vec<SsaBlock> = method
            .blocks
            .iter()
            .map(|b| SsaBlock {
                phis: Vec::new(),
                insns: Vec::with_capacity(b.insns.len()),
                successors: b.successors.clone(),
                primary: b.primary,
                catches: b.catches.clone(),
                predecessors: b.predecessors.clone(),
            })
            .collect();
        for (idx, locals) in placement.into_iter().enumerate() {
            for local in locals {
                let result = self.fresh(local, Definition::Phi);
                blocks[idx].phis.push(PhiNode {
                    result,
                    local,
                    operands: Vec::new(),
                });
            }
        }

        let mut frames = vec![Frame::Enter(method.entry)];
        while let Some(frame) = frames.pop() {
            let node = match frame {
                Frame::Enter(node) => node,
                Frame::Exit(pushed) => {
                    for local in pushed {
                        self.stacks[local as usize].pop();
                    }
                    continue;
                }
            };
            let mut pushed = Vec::new();
            for phi in &blocks[node.index()].phis {
                self.stacks[phi.local as usize].push(phi.result);
                pushed.push(phi.local);
            }
            for insn in &method.blocks[node.index()].insns {
                let sources = insn.sources.iter().map(|s| self.current(s.reg)).collect();
                let result = insn.result.map(|r| {
                    let def = match insn.op {
                        Op::MoveParam { index } => Definition::Param(index),
                        _ => Definition::Insn,
                    };
                    let id = self.fresh(r.reg, def);
                    self.stacks[r.reg as usize].push(id);
                    pushed.push(r.reg);
                    id
                });
                blocks[node.index()].insns.push(SsaInsn {
                    op: insn.op.clone(),
                    result,
                    sources,
                    line: insn.line,
                });
            }
            let mut seen = Vec::new();
            for &succ in &method.blocks[node.index()].successors {
                if seen.contains(&succ) {
                    continue;
                }
                seen.push(succ);
                let locals: Vec<u32> = blocks[succ.index()].phis.iter().map(|p| p.local).collect();
                for (i, local) in locals.into_iter().enumerate() {
                    let value = self.current(local);
                    blocks[succ.index()].phis[i].operands.push(PhiOperand {
                        value,
                        predecessor: node,
                    });
                }
            }
            frames.push(Frame::Exit(pushed));
            for &child in tree.children(node).iter().rev() {
                frames.push(Frame::Enter(child));
            }
        }

        SsaMethod {
            name: method.name.clone(),
            blocks,
            entry: method.entry,
            values: self.values,
            param_words: method.param_words,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::Code,
        cfg,
        ir::{Cond, Constant},
        types::{MethodRef, TypeId},
    };

    fn code(params: Vec<TypeId>, ret: TypeId) -> Code {
        Code::new(MethodRef::new(TypeId::class("a/B"), "m", ret, params), true)
    }

    #[test]
    fn test_diamond_gets_one_phi() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
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

        let ssa = build(cfg::build(&c).unwrap()).unwrap();
        let phis: Vec<&PhiNode> = ssa.blocks.iter().flat_map(|b| &b.phis).collect();
        assert_eq!(phis.len(), 1);
        assert_eq!(phis[0].operands.len(), 2);
        assert_ne!(phis[0].operands[0].value, phis[0].operands[1].value);
        for operand in &phis[0].operands {
            let pred = &ssa.blocks[operand.predecessor.index()];
            assert_eq!(pred.last().unwrap().op, Op::Goto);
        }
    }

    #[test]
    fn test_dead_local_gets_no_phi() {
        let mut c = code(vec![TypeId::Int], TypeId::Void);
        let x = c.param(0).unwrap();
        let y = c.new_local(TypeId::Int).unwrap();
        let join = c.new_label();
        c.load_constant(y, Constant::Int(0)).unwrap();
        c.branch_zero(Cond::Eq, x, join).unwrap();
        c.load_constant(y, Constant::Int(1)).unwrap();
        c.mark(join).unwrap();
        c.return_void().unwrap();

        let ssa = build(cfg::build(&c).unwrap()).unwrap();
        assert!(ssa.blocks.iter().all(|b| b.phis.is_empty()));
    }

    #[test]
    fn test_loop_phi_and_param_definition() {
        let mut c = code(vec![TypeId::Int], TypeId::Int);
        let n = c.param(0).unwrap();
        let one = c.new_local(TypeId::Int).unwrap();
        let top = c.new_label();
        let done = c.new_label();
        c.load_constant(one, Constant::Int(1)).unwrap();
        c.mark(top).unwrap();
        c.branch_zero(Cond::Le, n, done).unwrap();
        c.binary(crate::ir::BinOp::Sub, n, n, one).unwrap();
        c.jump(top).unwrap();
        c.mark(done).unwrap();
        c.return_value(n).unwrap();

        let ssa = build(cfg::build(&c).unwrap()).unwrap();
        let params: Vec<&SsaValue> = ssa
            .values
            .iter()
            .filter(|v| v.def == Definition::Param(0))
            .collect();
        assert_eq!(params.len(), 1);
        let header_phis: usize = ssa.blocks.iter().map(|b| b.phis.len()).sum();
        assert_eq!(header_phis, 1);
    }

    #[test]
    fn test_handler_join_is_split_per_edge() {
        let mut c = code(vec![], TypeId::Void);
        let callee = MethodRef::new(TypeId::class("a/C"), "f", TypeId::Void, vec![]);
        let handler = c.new_label();
        let e = c.new_local(TypeId::throwable()).unwrap();
        c.add_catch(None, handler).unwrap();
        c.invoke_static(&callee, None, &[]).unwrap();
        c.invoke_static(&callee, None, &[]).unwrap();
        c.remove_catch(None).unwrap();
        c.return_void().unwrap();
        c.mark(handler).unwrap();
        c.move_exception(e).unwrap();
        c.throw_value(e).unwrap();

        let ssa = build(cfg::build(&c).unwrap()).unwrap();
        let heads = ssa
            .blocks
            .iter()
            .filter(|b| b.insns.first().is_some_and(|i| i.op == Op::MoveException))
            .count();
        assert_eq!(heads, 2);
        // The merged exception value reaches the throw through a phi.
        assert!(ssa.blocks.iter().any(|b| b.phis.len() == 1));
    }
}
