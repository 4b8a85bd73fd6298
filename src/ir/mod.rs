//! Register-based intermediate representation.
//!
//! The same block form is used twice in the pipeline: once over builder locals, as produced
//! by the [`crate::cfg`] assembler, and once over physical registers, after SSA values have
//! been allocated and phis eliminated. In both cases a [`RopMethod`] is a vector of
//! [`BasicBlock`]s indexed by [`NodeId`].
//!
//! # Block conventions
//!
//! Every block ends in exactly one control instruction:
//!
//! | Last instruction       | `successors`                      | `primary`        |
//! |------------------------|-----------------------------------|------------------|
//! | `goto`                 | `[target]`                        | `target`         |
//! | `if` / `if-z`          | `[fallthrough, taken]`            | `fallthrough`    |
//! | `return`               | `[]`                              | none             |
//! | `throw`                | handlers                          | none             |
//! | throwing, with catches | `[normal, handlers..]`            | `normal`         |
//!
//! A throwing instruction that has active catch handlers always ends its block. If it has a
//! result, the result is delivered by a [`Op::MoveResultPseudo`] at the head of the normal
//! successor, so the value is only defined on the non-exceptional edge.

mod display;

use strum::Display;

use crate::{
    types::{FieldRef, Kind, MethodRef, TypeId},
    utils::graph::{GraphBase, NodeId, Predecessors, RootedGraph, Successors},
};

/// A register (or builder local) together with the kind of value it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegSpec {
    /// Register number; wide values also occupy `reg + 1`.
    pub reg: u32,
    /// Kind of the value held.
    pub kind: Kind,
}

impl RegSpec {
    /// Creates a register spec.
    #[must_use]
    pub const fn new(reg: u32, kind: Kind) -> Self {
        RegSpec { reg, kind }
    }

    /// Registers occupied.
    #[must_use]
    pub const fn width(self) -> u32 {
        self.kind.width()
    }

    /// One past the last register occupied.
    #[must_use]
    pub const fn end(self) -> u32 {
        self.reg + self.kind.width()
    }

    /// Returns `true` if the two register ranges overlap.
    #[must_use]
    pub const fn overlaps(self, other: RegSpec) -> bool {
        self.reg < other.end() && other.reg < self.end()
    }
}

/// Literal operand of a constant load. Floating values are stored as raw bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    /// 32-bit integral literal.
    Int(i32),
    /// 64-bit integral literal.
    Long(i64),
    /// 32-bit float, as bits.
    Float(u32),
    /// 64-bit float, as bits.
    Double(u64),
    /// The null reference.
    Null,
}

impl Constant {
    /// Kind of register the constant is loaded into.
    #[must_use]
    pub const fn kind(self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Null => Kind::Object,
        }
    }

    /// The literal as raw bits, sign-extended for 32-bit values.
    #[must_use]
    pub const fn bits(self) -> i64 {
        match self {
            Constant::Int(v) => v as i64,
            Constant::Long(v) => v,
            Constant::Float(v) => v as i32 as i64,
            Constant::Double(v) => v as i64,
            Constant::Null => 0,
        }
    }

    /// Zero value of a kind: `0`, `0L`, `0.0f`, `0.0` or `null`.
    #[must_use]
    pub const fn zero(kind: Kind) -> Self {
        match kind {
            Kind::Int => Constant::Int(0),
            Kind::Long => Constant::Long(0),
            Kind::Float => Constant::Float(0),
            Kind::Double => Constant::Double(0),
            Kind::Object => Constant::Null,
        }
    }
}

/// Unary arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement (integral kinds only).
    Not,
}

/// Binary arithmetic. The operand kind is the kind of the result; shift distances are
/// always `int`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `&`
    And,
    /// `|`
    Or,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `>>>`
    Ushr,
}

impl BinOp {
    /// Returns `true` for the bitwise and shift operators, which only apply to integral kinds.
    #[must_use]
    pub const fn is_integral_only(self) -> bool {
        matches!(
            self,
            BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Shl | BinOp::Shr | BinOp::Ushr
        )
    }

    /// Returns `true` for shifts.
    #[must_use]
    pub const fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::Ushr)
    }

    /// Returns `true` if `a op b == b op a`.
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }
}

/// Branch condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Cond {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `>`
    Gt,
    /// `<=`
    Le,
}

impl Cond {
    /// The condition that holds exactly when `self` does not.
    #[must_use]
    pub const fn negate(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }

    /// Evaluates the condition on an ordering result.
    #[must_use]
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Cond::Eq => ordering == Equal,
            Cond::Ne => ordering != Equal,
            Cond::Lt => ordering == Less,
            Cond::Ge => ordering != Less,
            Cond::Gt => ordering == Greater,
            Cond::Le => ordering != Greater,
        }
    }
}

/// Three-way comparison producing `-1`, `0` or `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum CmpOp {
    /// `cmpl-float`: NaN compares as less.
    #[strum(serialize = "cmpl-float")]
    LFloat,
    /// `cmpg-float`: NaN compares as greater.
    #[strum(serialize = "cmpg-float")]
    GFloat,
    /// `cmpl-double`
    #[strum(serialize = "cmpl-double")]
    LDouble,
    /// `cmpg-double`
    #[strum(serialize = "cmpg-double")]
    GDouble,
    /// `cmp-long`
    #[strum(serialize = "cmp-long")]
    Long,
}

impl CmpOp {
    /// Kind of both operands.
    #[must_use]
    pub const fn operand_kind(self) -> Kind {
        match self {
            CmpOp::LFloat | CmpOp::GFloat => Kind::Float,
            CmpOp::LDouble | CmpOp::GDouble => Kind::Double,
            CmpOp::Long => Kind::Long,
        }
    }
}

/// Dispatch style of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum InvokeKind {
    /// Virtual dispatch on the receiver.
    Virtual,
    /// Superclass implementation.
    Super,
    /// Private methods and constructors.
    Direct,
    /// No receiver.
    Static,
    /// Interface dispatch on the receiver.
    Interface,
}

/// Operation performed by an instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// Defines a parameter value; `index` is its first word in the argument list.
    MoveParam {
        /// First argument word of the parameter.
        index: u32,
    },
    /// Copies the source.
    Move,
    /// Receives the result of the throwing instruction ending the predecessor block.
    MoveResultPseudo,
    /// Receives the caught exception; only valid as the first instruction of a handler.
    MoveException,
    /// Loads a literal.
    Const(Constant),
    /// Loads an interned string.
    ConstString(String),
    /// Loads a class object.
    ConstClass(TypeId),
    /// Unary arithmetic on the result kind.
    Unary(UnOp),
    /// Binary arithmetic on the result kind.
    Binary(BinOp),
    /// Primitive conversion between register kinds.
    Convert {
        /// Source kind.
        from: Kind,
        /// Result kind.
        to: Kind,
    },
    /// Truncates an int to `byte`, `char` or `short`.
    Narrow(TypeId),
    /// Three-way comparison.
    Cmp(CmpOp),
    /// Two-operand conditional branch.
    If(Cond),
    /// Conditional branch comparing against zero / null.
    IfZ(Cond),
    /// Unconditional branch.
    Goto,
    /// Returns the source, or nothing.
    Return,
    /// Throws the source.
    Throw,
    /// Checks that the source is an instance of the type; the result is the same reference.
    CheckCast(TypeId),
    /// `1` if the source is an instance of the type, else `0`.
    InstanceOf(TypeId),
    /// Allocates an uninitialized instance.
    NewInstance(TypeId),
    /// Allocates an array of the given array type; the source is the length.
    NewArray(TypeId),
    /// Length of the source array.
    ArrayLength,
    /// Loads an element; the type is the element type.
    AGet(TypeId),
    /// Stores an element; sources are value, array, index.
    APut(TypeId),
    /// Loads an instance field; the source is the instance.
    IGet(FieldRef),
    /// Stores an instance field; sources are value, instance.
    IPut(FieldRef),
    /// Loads a static field.
    SGet(FieldRef),
    /// Stores a static field; the source is the value.
    SPut(FieldRef),
    /// Calls a method; sources are the argument registers in order.
    Invoke(InvokeKind, MethodRef),
}

impl Op {
    /// Returns `true` if the operation transfers control (ends a block unconditionally).
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Op::Goto | Op::If(_) | Op::IfZ(_) | Op::Return | Op::Throw
        )
    }

    /// Returns `true` for the conditional branches.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(self, Op::If(_) | Op::IfZ(_))
    }

    /// Returns `true` if the operation may raise an exception; integer division depends on
    /// the kind of its first operand, which stays known after the result moves to a
    /// [`Op::MoveResultPseudo`].
    #[must_use]
    pub fn can_throw(&self, operand: Option<Kind>) -> bool {
        match self {
            Op::ConstString(_)
            | Op::ConstClass(_)
            | Op::Throw
            | Op::CheckCast(_)
            | Op::InstanceOf(_)
            | Op::NewInstance(_)
            | Op::NewArray(_)
            | Op::ArrayLength
            | Op::AGet(_)
            | Op::APut(_)
            | Op::IGet(_)
            | Op::IPut(_)
            | Op::SGet(_)
            | Op::SPut(_)
            | Op::Invoke(..) => true,
            Op::Binary(BinOp::Div | BinOp::Rem) => matches!(operand, Some(Kind::Int | Kind::Long)),
            _ => false,
        }
    }

    /// Returns `true` if the operation only computes its result from its sources.
    #[must_use]
    pub fn is_pure(&self, operand: Option<Kind>) -> bool {
        !self.can_throw(operand)
            && matches!(
                self,
                Op::Move
                    | Op::Const(_)
                    | Op::Unary(_)
                    | Op::Binary(_)
                    | Op::Convert { .. }
                    | Op::Narrow(_)
                    | Op::Cmp(_)
            )
    }
}

/// One instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Insn {
    /// Operation.
    pub op: Op,
    /// Destination, if the operation produces a value.
    pub result: Option<RegSpec>,
    /// Operands, in operation-specific order.
    pub sources: Vec<RegSpec>,
    /// Source line the instruction was emitted for.
    pub line: Option<u32>,
}

impl Insn {
    /// Creates an instruction.
    #[must_use]
    pub fn new(op: Op, result: Option<RegSpec>, sources: Vec<RegSpec>) -> Self {
        Insn {
            op,
            result,
            sources,
            line: None,
        }
    }

    /// Creates an unconditional branch.
    #[must_use]
    pub fn goto() -> Self {
        Insn::new(Op::Goto, None, Vec::new())
    }

    /// Attaches a source line.
    #[must_use]
    pub fn at_line(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }

    /// Returns `true` if executing the instruction may raise an exception.
    #[must_use]
    pub fn can_throw(&self) -> bool {
        self.op.can_throw(self.sources.first().map(|r| r.kind))
    }

    /// Returns `true` if removing the instruction when its result is unused cannot change
    /// behaviour.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        self.op.is_pure(self.sources.first().map(|r| r.kind))
    }

    /// Returns `true` if the instruction ends its block.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.op.is_control()
    }
}

/// An exception edge: the handler block and the caught type (`None` catches everything).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CatchEdge {
    /// Caught type, or `None` for a catch-all.
    pub ty: Option<TypeId>,
    /// Handler block.
    pub handler: NodeId,
}

/// A basic block. See the module documentation for successor conventions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicBlock {
    /// Instructions, ending in a control or throwing instruction.
    pub insns: Vec<Insn>,
    /// Successor blocks.
    pub successors: Vec<NodeId>,
    /// Fall-through (or normal-completion) successor.
    pub primary: Option<NodeId>,
    /// Exception handlers of the last instruction, in match order.
    pub catches: Vec<CatchEdge>,
    /// Predecessor blocks, deduplicated; maintained by [`RopMethod::compute_predecessors`].
    pub predecessors: Vec<NodeId>,
}

impl BasicBlock {
    /// The last instruction.
    #[must_use]
    pub fn last(&self) -> Option<&Insn> {
        self.insns.last()
    }

    /// The branch target of a block ending in a conditional branch.
    #[must_use]
    pub fn taken(&self) -> Option<NodeId> {
        match self.last() {
            Some(insn) if insn.op.is_conditional() => self.successors.get(1).copied(),
            _ => None,
        }
    }

    /// Returns `true` if the block holds nothing but an unconditional branch.
    #[must_use]
    pub fn is_goto_only(&self) -> bool {
        self.insns.len() == 1 && self.insns[0].op == Op::Goto
    }

    /// Returns `true` if the block starts with the pseudo move receiving a result.
    #[must_use]
    pub fn starts_with_move_result(&self) -> bool {
        self.insns
            .first()
            .is_some_and(|insn| insn.op == Op::MoveResultPseudo)
    }

    /// Returns `true` if the block starts by receiving an exception.
    #[must_use]
    pub fn starts_with_move_exception(&self) -> bool {
        self.insns
            .first()
            .is_some_and(|insn| insn.op == Op::MoveException)
    }

    /// Redirects every edge to `old` (successor list, primary, catch handlers) to `new`.
    pub fn replace_successor(&mut self, old: NodeId, new: NodeId) {
        for succ in &mut self.successors {
            if *succ == old {
                *succ = new;
            }
        }
        if self.primary == Some(old) {
            self.primary = Some(new);
        }
        for catch in &mut self.catches {
            if catch.handler == old {
                catch.handler = new;
            }
        }
    }
}

/// A method body as a control-flow graph of register instructions.
#[derive(Clone, Debug)]
pub struct RopMethod {
    /// Method name, for diagnostics.
    pub name: String,
    /// Blocks, indexed by [`NodeId`].
    pub blocks: Vec<BasicBlock>,
    /// Entry block; never a branch target.
    pub entry: NodeId,
    /// Registers in use (locals before allocation, the frame size after).
    pub reg_count: u32,
    /// Argument words passed by the caller.
    pub param_words: u32,
}

impl RopMethod {
    /// Recomputes every block's predecessor list from the successor lists.
    pub fn compute_predecessors(&mut self) {
        let mut preds: Vec<Vec<NodeId>> = vec![Vec::new(); self.blocks.len()];
        for (idx, block) in self.blocks.iter().enumerate() {
            for &succ in &block.successors {
                let list = &mut preds[succ.index()];
                if !list.contains(&NodeId::new(idx)) {
                    list.push(NodeId::new(idx));
                }
            }
        }
        for (block, preds) in self.blocks.iter_mut().zip(preds) {
            block.predecessors = preds;
        }
    }

    /// Blocks ending in `return` or `throw`.
    #[must_use]
    pub fn exit_blocks(&self) -> Vec<NodeId> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.last().map(|i| &i.op), Some(Op::Return | Op::Throw)))
            .map(|(i, _)| NodeId::new(i))
            .collect()
    }

    /// Drops blocks not reachable from the entry and renumbers the rest, keeping their
    /// relative order.
    pub fn remove_unreachable(&mut self) {
        let reachable = crate::utils::graph::postorder(self, self.entry);
        if reachable.len() == self.blocks.len() {
            self.compute_predecessors();
            return;
        }
        let mut keep = vec![false; self.blocks.len()];
        for node in reachable {
            keep[node.index()] = true;
        }
        self.retain_blocks(&keep);
    }

    /// Keeps the blocks flagged in `keep`, renumbering edges. Edges into dropped blocks are
    /// removed.
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
            self.blocks.push(block);
        }
        if let Some(entry) = remap[self.entry.index()] {
            self.entry = entry;
        }
        self.compute_predecessors();
    }
}

impl GraphBase for RopMethod {
    fn node_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Successors for RopMethod {
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()].successors.iter().copied()
    }
}

impl Predecessors for RopMethod {
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()].predecessors.iter().copied()
    }
}

impl RootedGraph for RopMethod {
    fn entry(&self) -> NodeId {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regspec_overlap() {
        let wide = RegSpec::new(2, Kind::Long);
        assert!(wide.overlaps(RegSpec::new(3, Kind::Int)));
        assert!(wide.overlaps(RegSpec::new(1, Kind::Double)));
        assert!(!wide.overlaps(RegSpec::new(4, Kind::Int)));
        assert!(!wide.overlaps(RegSpec::new(0, Kind::Long)));
    }

    #[test]
    fn test_can_throw_division() {
        let int_div = Insn::new(
            Op::Binary(BinOp::Div),
            Some(RegSpec::new(0, Kind::Int)),
            vec![RegSpec::new(1, Kind::Int), RegSpec::new(2, Kind::Int)],
        );
        let float_div = Insn::new(
            Op::Binary(BinOp::Div),
            Some(RegSpec::new(0, Kind::Float)),
            vec![RegSpec::new(1, Kind::Float), RegSpec::new(2, Kind::Float)],
        );
        assert!(int_div.can_throw());
        assert!(!int_div.is_pure());
        assert!(!float_div.can_throw());
        assert!(float_div.is_pure());

        // Inside a try region the result is delivered by a pseudo move.
        let detached = Insn { result: None, ..int_div };
        assert!(detached.can_throw());
        assert!(!detached.is_pure());
    }

    #[test]
    fn test_cond_negate_holds() {
        use std::cmp::Ordering;
        for cond in [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le] {
            for ord in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
                assert_ne!(cond.holds(ord), cond.negate().holds(ord));
            }
        }
    }

    #[test]
    fn test_retain_blocks_remaps_edges() {
        let goto = |target: usize| BasicBlock {
            insns: vec![Insn::goto()],
            successors: vec![NodeId::new(target)],
            primary: Some(NodeId::new(target)),
            ..BasicBlock::default()
        };
        let ret = BasicBlock {
            insns: vec![Insn::new(Op::Return, None, vec![])],
            ..BasicBlock::default()
        };
        let mut method = RopMethod {
            name: "m".into(),
            blocks: vec![goto(2), goto(2), ret],
            entry: NodeId::new(0),
            reg_count: 0,
            param_words: 0,
        };
        method.remove_unreachable();
        assert_eq!(method.blocks.len(), 2);
        assert_eq!(method.blocks[0].successors, vec![NodeId::new(1)]);
        assert_eq!(method.blocks[1].predecessors, vec![NodeId::new(0)]);
        assert_eq!(method.exit_blocks(), vec![NodeId::new(1)]);
    }
}
