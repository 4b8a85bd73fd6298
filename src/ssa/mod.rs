//! Static single assignment form over builder locals.
//!
//! Every value of an [`SsaMethod`] is defined exactly once: by a parameter move, an
//! instruction result, or a [`PhiNode`] at the head of a join block. Values remember the local
//! they were renamed from and its kind, which the register allocator uses to size slots and to
//! prefer keeping related values together.
//!
//! # Construction
//!
//! [`build`] converts a block-form [`crate::ir::RopMethod`] in three steps:
//!
//! 1. **Edge splitting** - every edge into a join block that leaves a block not ending in a
//!    plain `goto` gets a fresh `goto` block, so phi moves always have a safe home; handler
//!    joins get one `move-exception` block per incoming edge instead
//! 2. **Phi placement** - pruned placement at iterated dominance frontiers, restricted to
//!    locals live into the join
//! 3. **Renaming** - a preorder walk of the dominator tree with one version stack per local
//!
//! The optimizer passes in [`optimize`] rewrite this form in place.
//!
//! # References
//!
//! - Cytron et al., "Efficiently Computing Static Single Assignment Form and the
//!   Control Dependence Graph", ACM TOPLAS 1991
//! - Wegman & Zadeck, "Constant Propagation with Conditional Branches", ACM TOPLAS 1991

mod convert;
pub mod optimize;

pub use convert::build;

use std::fmt;

use crate::{
    ir::{CatchEdge, Op},
    types::Kind,
    utils::graph::{GraphBase, NodeId, Predecessors, RootedGraph, Successors},
};

/// Identifier of an SSA value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    /// Creates an identifier from its index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        ValueId(index as u32)
    }

    /// Index of the value in [`SsaMethod::values`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// How a value is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Definition {
    /// Incoming argument starting at the given word.
    Param(u32),
    /// Result of an instruction.
    Insn,
    /// Result of a phi node.
    Phi,
    /// Stands in for a local that is unassigned along some path; never read at runtime.
    Undefined,
}

/// Metadata of an SSA value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SsaValue {
    /// Register class.
    pub kind: Kind,
    /// Local the value was renamed from.
    pub local: u32,
    /// Version of the local, starting at 1; 0 marks undefined values.
    pub version: u32,
    /// Definition site.
    pub def: Definition,
}

/// An operand of a phi: the value flowing in along the edge from `predecessor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhiOperand {
    /// Incoming value.
    pub value: ValueId,
    /// Predecessor block the value arrives from.
    pub predecessor: NodeId,
}

/// A phi node merging the versions of one local at a join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhiNode {
    /// Defined value.
    pub result: ValueId,
    /// Local being merged.
    pub local: u32,
    /// One operand per predecessor.
    pub operands: Vec<PhiOperand>,
}

impl PhiNode {
    /// The operand arriving from `pred`.
    #[must_use]
    pub fn operand_from(&self, pred: NodeId) -> Option<ValueId> {
        self.operands
            .iter()
            .find(|o| o.predecessor == pred)
            .map(|o| o.value)
    }
}

/// An instruction over SSA values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SsaInsn {
    /// Operation.
    pub op: Op,
    /// Defined value.
    pub result: Option<ValueId>,
    /// Used values.
    pub sources: Vec<ValueId>,
    /// Source line.
    pub line: Option<u32>,
}

/// A basic block in SSA form. Edges follow the conventions of [`crate::ir`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SsaBlock {
    /// Phi nodes, evaluated on entry.
    pub phis: Vec<PhiNode>,
    /// Instructions.
    pub insns: Vec<SsaInsn>,
    /// Successors.
    pub successors: Vec<NodeId>,
    /// Fall-through or normal-completion successor.
    pub primary: Option<NodeId>,
    /// Exception handlers of the last instruction.
    pub catches: Vec<CatchEdge>,
    /// Predecessors.
    pub predecessors: Vec<NodeId>,
}

impl SsaBlock {
    /// The last instruction.
    #[must_use]
    pub fn last(&self) -> Option<&SsaInsn> {
        self.insns.last()
    }
}

/// A method body in SSA form.
#[derive(Clone, Debug)]
pub struct SsaMethod {
    /// Method name, for diagnostics.
    pub name: String,
    /// Blocks, indexed by [`NodeId`].
    pub blocks: Vec<SsaBlock>,
    /// Entry block.
    pub entry: NodeId,
    /// Every value ever created, indexed by [`ValueId`]; removed definitions leave their
    /// entry behind.
    pub values: Vec<SsaValue>,
    /// Argument words passed by the caller.
    pub param_words: u32,
}

impl SsaMethod {
    /// Metadata of a value.
    #[must_use]
    pub fn value(&self, id: ValueId) -> &SsaValue {
        &self.values[id.index()]
    }

    /// Kind of a value.
    #[must_use]
    pub fn kind(&self, id: ValueId) -> Kind {
        self.values[id.index()].kind
    }

    /// Number of values.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the instruction may throw.
    #[must_use]
    pub fn can_throw(&self, insn: &SsaInsn) -> bool {
        insn.op.can_throw(insn.sources.first().map(|v| self.kind(*v)))
    }

    /// Returns `true` if the instruction has no effect besides its result.
    #[must_use]
    pub fn is_pure(&self, insn: &SsaInsn) -> bool {
        insn.op.is_pure(insn.sources.first().map(|v| self.kind(*v)))
    }

    /// Recomputes predecessor lists.
    pub fn compute_predecessors(&mut self) {
        let mut preds: Vec<Vec<NodeId>> = vec![Vec::new(); self.blocks.len()];
        for (idx, block) in self.blocks.iter().enumerate() {
            for &succ in &block.successors {
                if !preds[succ.index()].contains(&NodeId::new(idx)) {
                    preds[succ.index()].push(NodeId::new(idx));
                }
            }
        }
        for (block, preds) in self.blocks.iter_mut().zip(preds) {
            block.predecessors = preds;
        }
    }

    /// Replaces every use of `old` (instruction sources and phi operands) with `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) {
        for block in &mut self.blocks {
            for phi in &mut block.phis {
                for operand in &mut phi.operands {
                    if operand.value == old {
                        operand.value = new;
                    }
                }
            }
            for insn in &mut block.insns {
                for source in &mut insn.sources {
                    if *source == old {
                        *source = new;
                    }
                }
            }
        }
    }

    /// Removes the edge `from -> to`, dropping the matching phi operands in `to`.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        let block = &mut self.blocks[from.index()];
        block.successors.retain(|&s| s != to);
        if block.primary == Some(to) {
            block.primary = None;
        }
        block.catches.retain(|c| c.handler != to);
        let target = &mut self.blocks[to.index()];
        target.predecessors.retain(|&p| p != from);
        for phi in &mut target.phis {
            phi.operands.retain(|o| o.predecessor != from);
        }
    }

    /// Keeps the flagged blocks, renumbering edges and phi operands.
    pub fn retain_blocks(&mut self, keep: &[bool]) {
        let mut remap = vec![None; self.blocks.len()];
        let mut next = 0;
        for (idx, &k) in keep.iter().enumerate() {
            if k {
                remap[idx] = Some(NodeId::new(next));
                next += 1;
            }
        }
        let blocks = std::mem::take(&mut self.blocks);
        for (idx, mut block) in blocks.into_iter().enumerate() {
            if !keep[idx] {
                continue;
            }
            block.successors = block
                .successors
                .iter()
                .filter_map(|s| remap[s.index()])
                .collect();
            block.primary = block.primary.and_then(|p| remap[p.index()]);
            block.catches.retain_mut(|c| match remap[c.handler.index()] {
                Some(new) => {
                    c.handler = new;
                    true
                }
                None => false,
            });
            for phi in &mut block.phis {
                phi.operands.retain_mut(|o| match remap[o.predecessor.index()] {
                    Some(new) => {
                        o.predecessor = new;
                        true
                    }
                    None => false,
                });
            }
            self.blocks.push(block);
        }
        if let Some(entry) = remap[self.entry.index()] {
            self.entry = entry;
        }
        self.compute_predecessors();
    }
}

impl GraphBase for SsaMethod {
    fn node_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Successors for SsaMethod {
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()].successors.iter().copied()
    }
}

impl Predecessors for SsaMethod {
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()].predecessors.iter().copied()
    }
}

impl RootedGraph for SsaMethod {
    fn entry(&self) -> NodeId {
        self.entry
    }
}

impl fmt::Display for SsaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (ssa, entry={})", self.name, self.entry)?;
        for (idx, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  B{idx}:")?;
            for phi in &block.phis {
                write!(f, "    {} = phi", phi.result)?;
                for operand in &phi.operands {
                    write!(f, " [{} from {}]", operand.value, operand.predecessor)?;
                }
                writeln!(f)?;
            }
            for insn in &block.insns {
                f.write_str("    ")?;
                if let Some(result) = insn.result {
                    write!(f, "{result} = ")?;
                }
                write!(f, "{}", insn.op)?;
                for source in &insn.sources {
                    write!(f, " {source}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
