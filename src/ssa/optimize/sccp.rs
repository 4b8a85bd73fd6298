//! Sparse conditional constant propagation.
//!
//! Values start at ⊤ (no information) and only move down the lattice
//! `⊤ → constant → ⊥`. Blocks become executable only when an executable edge reaches
//! them, and a conditional branch whose operands are known constants enables only the edge
//! it actually takes. When the worklists drain:
//!
//! - pure instructions whose result is a known constant become constant loads,
//! - phis whose result is a known constant become constant loads at the block head,
//! - conditional branches with a single executable edge become `goto`s,
//! - blocks that never became executable are removed.

use rustc_hash::FxHashSet;

use crate::{
    ir::{BinOp, CmpOp, Cond, Constant, Op, UnOp},
    ssa::{optimize::SsaPass, Definition, SsaInsn, SsaMethod, ValueId},
    types::{Kind, TypeId},
    utils::{bitset::BitSet, graph::NodeId},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lattice {
    Top,
    Const(Constant),
    Bottom,
}

impl Lattice {
    fn meet(self, other: Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Top, x) | (x, Lattice::Top) => x,
            (Lattice::Const(a), Lattice::Const(b)) if a == b => Lattice::Const(a),
            _ => Lattice::Bottom,
        }
    }
}

#[derive(Clone, Copy)]
enum Site {
    Phi(usize),
    Insn(usize),
}

/// Sparse conditional constant propagation with branch folding.
pub struct ConstantPropagationPass;

impl SsaPass for ConstantPropagationPass {
    fn name(&self) -> &'static str {
        "constant-propagation"
    }

    fn run_on_method(&self, method: &mut SsaMethod) -> Result<bool> {
        let mut solver = Solver::new(method);
        solver.solve(method);
        Ok(solver.rewrite(method))
    }
}

struct Solver {
    lattice: Vec<Lattice>,
    executable: BitSet,
    edges: FxHashSet<(NodeId, NodeId)>,
    /// Branch blocks with the edges their condition enables.
    uses: Vec<Vec<(NodeId, Site)>>,
    cfg_work: Vec<(Option<NodeId>, NodeId)>,
    ssa_work: Vec<ValueId>,
}

impl Solver {
    fn new(method: &SsaMethod) -> Self {
        let mut lattice = vec![Lattice::Top; method.value_count()];
        for (idx, value) in method.values.iter().enumerate() {
            if matches!(value.def, Definition::Param(_)) {
                lattice[idx] = Lattice::Bottom;
            }
        }
        let mut uses = vec![Vec::new(); method.value_count()];
        for (b, block) in method.blocks.iter().enumerate() {
            for (i, phi) in block.phis.iter().enumerate() {
                for operand in &phi.operands {
                    uses[operand.value.index()].push((NodeId::new(b), Site::Phi(i)));
                }
            }
            for (i, insn) in block.insns.iter().enumerate() {
                for source in &insn.sources {
                    uses[source.index()].push((NodeId::new(b), Site::Insn(i)));
                }
            }
        }
        Solver {
            lattice,
            executable: BitSet::new(method.blocks.len()),
            edges: FxHashSet::default(),
            uses,
            cfg_work: vec![(None, method.entry)],
            ssa_work: Vec::new(),
        }
    }

    fn solve(&mut self, method: &SsaMethod) {
        while !self.cfg_work.is_empty() || !self.ssa_work.is_empty() {
            while let Some((from, to)) = self.cfg_work.pop() {
                if let Some(from) = from {
                    if !self.edges.insert((from, to)) {
                        continue;
                    }
                }
                let first_visit = self.executable.insert(to.index());
                for i in 0..method.blocks[to.index()].phis.len() {
                    self.visit(method, to, Site::Phi(i));
                }
                if first_visit {
                    for i in 0..method.blocks[to.index()].insns.len() {
                        self.visit(method, to, Site::Insn(i));
                    }
                }
            }
            while let Some(value) = self.ssa_work.pop() {
                for k in 0..self.uses[value.index()].len() {
                    let (block, site) = self.uses[value.index()][k];
                    if self.executable.contains(block.index()) {
                        self.visit(method, block, site);
                    }
                }
            }
        }
    }

    fn set(&mut self, value: ValueId, new: Lattice) {
        let old = self.lattice[value.index()];
        // Only ever lower a value.
        let lowered = old.meet(new);
        if lowered != old {
            self.lattice[value.index()] = lowered;
            self.ssa_work.push(value);
        }
    }

    fn visit(&mut self, method: &SsaMethod, node: NodeId, site: Site) {
        let block = &method.blocks[node.index()];
        match site {
            Site::Phi(i) => {
                let phi = &block.phis[i];
                let mut value = Lattice::Top;
                for operand in &phi.operands {
                    if self.edges.contains(&(operand.predecessor, node)) {
                        value = value.meet(self.lattice[operand.value.index()]);
                    }
                }
                self.set(phi.result, value);
            }
            Site::Insn(i) => {
                let insn = &block.insns[i];
                if let Some(result) = insn.result {
                    let value = self.evaluate(method, insn, method.kind(result));
                    self.set(result, value);
                }
                if i + 1 == block.insns.len() {
                    self.visit_terminator(method, node, insn);
                }
            }
        }
    }

    fn visit_terminator(&mut self, method: &SsaMethod, node: NodeId, insn: &SsaInsn) {
        let block = &method.blocks[node.index()];
        if insn.op.is_conditional() {
            match self.branch_outcome(method, insn) {
                Some(true) => {
                    if let Some(&taken) = block.successors.get(1) {
                        self.cfg_work.push((Some(node), taken));
                    }
                }
                Some(false) => {
                    if let Some(&fallthrough) = block.successors.first() {
                        self.cfg_work.push((Some(node), fallthrough));
                    }
                }
                None => {
                    if self.any_operand(insn, Lattice::Bottom) {
                        for &succ in &block.successors {
                            self.cfg_work.push((Some(node), succ));
                        }
                    }
                }
            }
        } else {
            for &succ in &block.successors {
                self.cfg_work.push((Some(node), succ));
            }
        }
    }

    fn any_operand(&self, insn: &SsaInsn, state: Lattice) -> bool {
        insn.sources.iter().any(|s| self.lattice[s.index()] == state)
    }

    fn constants(&self, insn: &SsaInsn) -> Option<Vec<Constant>> {
        insn.sources
            .iter()
            .map(|s| match self.lattice[s.index()] {
                Lattice::Const(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn branch_outcome(&self, method: &SsaMethod, insn: &SsaInsn) -> Option<bool> {
        let operands = self.constants(insn)?;
        let kind = method.kind(*insn.sources.first()?);
        match (&insn.op, kind, operands.as_slice()) {
            (Op::If(cond), Kind::Int, [Constant::Int(a), Constant::Int(b)]) => {
                Some(cond.holds(a.cmp(b)))
            }
            (Op::If(cond), Kind::Object, [Constant::Null, Constant::Null]) => {
                Some(cond.holds(std::cmp::Ordering::Equal))
            }
            (Op::IfZ(cond), Kind::Int, [Constant::Int(a)]) => Some(cond.holds(a.cmp(&0))),
            (Op::IfZ(cond), Kind::Object, [Constant::Null]) => {
                Some(matches!(cond, Cond::Eq))
            }
            _ => None,
        }
    }

    fn evaluate(&self, method: &SsaMethod, insn: &SsaInsn, kind: Kind) -> Lattice {
        if let Op::Const(c) = insn.op {
            return Lattice::Const(c);
        }
        if !method.is_pure(insn) && !matches!(insn.op, Op::Binary(BinOp::Div | BinOp::Rem)) {
            return Lattice::Bottom;
        }
        if self.any_operand(insn, Lattice::Bottom) {
            return Lattice::Bottom;
        }
        let Some(operands) = self.constants(insn) else {
            return Lattice::Top;
        };
        fold(&insn.op, kind, &operands).map_or(Lattice::Bottom, Lattice::Const)
    }

    fn rewrite(&self, method: &mut SsaMethod) -> bool {
        let mut changed = false;

        for b in 0..method.blocks.len() {
            if !self.executable.contains(b) {
                changed = true;
                continue;
            }
            let node = NodeId::new(b);
            for phi in &mut method.blocks[b].phis {
                let before = phi.operands.len();
                phi.operands
                    .retain(|o| self.edges.contains(&(o.predecessor, node)));
                changed |= phi.operands.len() != before;
            }

            let block = &method.blocks[b];
            if block.last().is_some_and(|i| i.op.is_conditional()) {
                let live: Vec<NodeId> = block
                    .successors
                    .iter()
                    .copied()
                    .filter(|s| self.edges.contains(&(node, *s)))
                    .collect();
                if let [only] = live.as_slice() {
                    let only = *only;
                    let dead: Vec<NodeId> = block
                        .successors
                        .iter()
                        .copied()
                        .filter(|s| *s != only)
                        .collect();
                    let block = &mut method.blocks[b];
                    if let Some(last) = block.insns.last_mut() {
                        *last = SsaInsn {
                            op: Op::Goto,
                            result: None,
                            sources: Vec::new(),
                            line: last.line,
                        };
                    }
                    block.successors = vec![only];
                    block.primary = Some(only);
                    for target in dead {
                        method.remove_edge(node, target);
                    }
                    changed = true;
                }
            }

            for i in 0..method.blocks[b].insns.len() {
                let insn = &method.blocks[b].insns[i];
                let Some(result) = insn.result else { continue };
                let Lattice::Const(c) = self.lattice[result.index()] else {
                    continue;
                };
                if insn.op == Op::Const(c) || !method.is_pure(insn) {
                    continue;
                }
                let insn = &mut method.blocks[b].insns[i];
                insn.op = Op::Const(c);
                insn.sources.clear();
                changed = true;
            }

            let mut constants = Vec::new();
            method.blocks[b].phis.retain(|phi| match self.lattice[phi.result.index()] {
                Lattice::Const(c) => {
                    constants.push((phi.result, c));
                    false
                }
                _ => true,
            });
            if !constants.is_empty() {
                let block = &mut method.blocks[b];
                let head = block
                    .insns
                    .iter()
                    .take_while(|i| matches!(i.op, Op::MoveException | Op::MoveResultPseudo))
                    .count();
                for (offset, (result, c)) in constants.into_iter().enumerate() {
                    block.insns.insert(
                        head + offset,
                        SsaInsn {
                            op: Op::Const(c),
                            result: Some(result),
                            sources: Vec::new(),
                            line: None,
                        },
                    );
                    method.values[result.index()].def = Definition::Insn;
                }
                changed = true;
            }
        }

        if self.executable.count() != method.blocks.len() {
            let keep: Vec<bool> = (0..method.blocks.len())
                .map(|b| self.executable.contains(b))
                .collect();
            method.retain_blocks(&keep);
        }
        changed
    }
}

/// Evaluates a pure operation on constant operands. Returns `None` where the result is not
/// a compile-time constant, including integer division by zero.
fn fold(op: &Op, kind: Kind, operands: &[Constant]) -> Option<Constant> {
    use Constant::{Double, Float, Int, Long};
    match (op, operands) {
        (Op::Move, [value]) => Some(*value),
        (Op::Unary(op), [value]) => match (op, value) {
            (UnOp::Neg, Int(v)) => Some(Int(v.wrapping_neg())),
            (UnOp::Neg, Long(v)) => Some(Long(v.wrapping_neg())),
            (UnOp::Neg, Float(v)) => Some(Float((-f32::from_bits(*v)).to_bits())),
            (UnOp::Neg, Double(v)) => Some(Double((-f64::from_bits(*v)).to_bits())),
            (UnOp::Not, Int(v)) => Some(Int(!v)),
            (UnOp::Not, Long(v)) => Some(Long(!v)),
            _ => None,
        },
        (Op::Binary(op), [a, b]) => fold_binary(*op, kind, *a, *b),
        (Op::Convert { to, .. }, [value]) => convert(*value, *to),
        (Op::Narrow(ty), [Int(v)]) => Some(Int(match ty {
            TypeId::Byte => i32::from(*v as i8),
            TypeId::Short => i32::from(*v as i16),
            TypeId::Char => i32::from(*v as u16),
            _ => return None,
        })),
        (Op::Cmp(op), [a, b]) => Some(Int(compare(*op, *a, *b)?)),
        _ => None,
    }
}

fn fold_binary(op: BinOp, kind: Kind, a: Constant, b: Constant) -> Option<Constant> {
    use Constant::{Double, Float, Int, Long};
    match (kind, a, b) {
        (Kind::Int, Int(x), Int(y)) => Some(Int(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div if y != 0 => x.wrapping_div(y),
            BinOp::Rem if y != 0 => x.wrapping_rem(y),
            BinOp::Div | BinOp::Rem => return None,
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            BinOp::Shl => x.wrapping_shl(y as u32 & 31),
            BinOp::Shr => x.wrapping_shr(y as u32 & 31),
            BinOp::Ushr => ((x as u32) >> (y as u32 & 31)) as i32,
        })),
        (Kind::Long, Long(x), Int(y)) if op.is_shift() => Some(Long(match op {
            BinOp::Shl => x.wrapping_shl(y as u32 & 63),
            BinOp::Shr => x.wrapping_shr(y as u32 & 63),
            _ => ((x as u64) >> (y as u32 & 63)) as i64,
        })),
        (Kind::Long, Long(x), Long(y)) => Some(Long(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div if y != 0 => x.wrapping_div(y),
            BinOp::Rem if y != 0 => x.wrapping_rem(y),
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            _ => return None,
        })),
        (Kind::Float, Float(x), Float(y)) => {
            let (x, y) = (f32::from_bits(x), f32::from_bits(y));
            Some(Float(
                match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Rem => x % y,
                    _ => return None,
                }
                .to_bits(),
            ))
        }
        (Kind::Double, Double(x), Double(y)) => {
            let (x, y) = (f64::from_bits(x), f64::from_bits(y));
            Some(Double(
                match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Rem => x % y,
                    _ => return None,
                }
                .to_bits(),
            ))
        }
        _ => None,
    }
}

/// Primitive conversion with JVM semantics: float to integral conversions saturate and map
/// NaN to zero, which is what `as` does.
pub(crate) fn convert(value: Constant, to: Kind) -> Option<Constant> {
    use Constant::{Double, Float, Int, Long};
    let converted = match (value, to) {
        (Int(v), Kind::Long) => Long(i64::from(v)),
        (Int(v), Kind::Float) => Float((v as f32).to_bits()),
        (Int(v), Kind::Double) => Double(f64::from(v).to_bits()),
        (Long(v), Kind::Int) => Int(v as i32),
        (Long(v), Kind::Float) => Float((v as f32).to_bits()),
        (Long(v), Kind::Double) => Double((v as f64).to_bits()),
        (Float(v), Kind::Int) => Int(f32::from_bits(v) as i32),
        (Float(v), Kind::Long) => Long(f32::from_bits(v) as i64),
        (Float(v), Kind::Double) => Double(f64::from(f32::from_bits(v)).to_bits()),
        (Double(v), Kind::Int) => Int(f64::from_bits(v) as i32),
        (Double(v), Kind::Long) => Long(f64::from_bits(v) as i64),
        (Double(v), Kind::Float) => Float((f64::from_bits(v) as f32).to_bits()),
        _ => return None,
    };
    Some(converted)
}

/// Three-way comparison; the `l`/`g` bias decides the result for NaN operands.
pub(crate) fn compare(op: CmpOp, a: Constant, b: Constant) -> Option<i32> {
    let ordering = match (op, a, b) {
        (CmpOp::Long, Constant::Long(x), Constant::Long(y)) => Some(x.cmp(&y)),
        (CmpOp::LFloat | CmpOp::GFloat, Constant::Float(x), Constant::Float(y)) => {
            f32::from_bits(x).partial_cmp(&f32::from_bits(y))
        }
        (CmpOp::LDouble | CmpOp::GDouble, Constant::Double(x), Constant::Double(y)) => {
            f64::from_bits(x).partial_cmp(&f64::from_bits(y))
        }
        _ => return None,
    };
    Some(match ordering {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None if matches!(op, CmpOp::GFloat | CmpOp::GDouble) => 1,
        None => -1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ssa::optimize::testing::{code, to_ssa},
        types::TypeId,
    };

    #[test]
    fn test_folds_arithmetic_chain() {
        let mut c = code(vec![], TypeId::Int);
        let a = c.new_local(TypeId::Int).unwrap();
        let b = c.new_local(TypeId::Int).unwrap();
        c.load_constant(a, Constant::Int(6)).unwrap();
        c.load_constant(b, Constant::Int(7)).unwrap();
        c.binary(BinOp::Mul, a, a, b).unwrap();
        c.return_value(a).unwrap();
        let mut ssa = to_ssa(&c);
        assert!(ConstantPropagationPass.run_on_method(&mut ssa).unwrap());
        let block = &ssa.blocks[ssa.entry.index()];
        assert!(block
            .insns
            .iter()
            .any(|i| i.op == Op::Const(Constant::Int(42))));
    }

    #[test]
    fn test_never_folds_division_by_zero() {
        let mut c = code(vec![], TypeId::Int);
        let a = c.new_local(TypeId::Int).unwrap();
        let z = c.new_local(TypeId::Int).unwrap();
        c.load_constant(a, Constant::Int(1)).unwrap();
        c.load_constant(z, Constant::Int(0)).unwrap();
        c.binary(BinOp::Div, a, a, z).unwrap();
        c.return_value(a).unwrap();
        let mut ssa = to_ssa(&c);
        ConstantPropagationPass.run_on_method(&mut ssa).unwrap();
        assert!(ssa.blocks[ssa.entry.index()]
            .insns
            .iter()
            .any(|i| i.op == Op::Binary(BinOp::Div)));
    }

    #[test]
    fn test_folds_constant_branch_and_removes_dead_block() {
        let mut c = code(vec![], TypeId::Int);
        let flag = c.new_local(TypeId::Int).unwrap();
        let r = c.new_local(TypeId::Int).unwrap();
        let other = c.new_label();
        c.load_constant(flag, Constant::Int(0)).unwrap();
        c.branch_zero(Cond::Eq, flag, other).unwrap();
        c.load_constant(r, Constant::Int(1)).unwrap();
        c.return_value(r).unwrap();
        c.mark(other).unwrap();
        c.load_constant(r, Constant::Int(2)).unwrap();
        c.return_value(r).unwrap();
        let mut ssa = to_ssa(&c);
        let before = ssa.blocks.len();
        assert!(ConstantPropagationPass.run_on_method(&mut ssa).unwrap());
        assert_eq!(ssa.blocks.len(), before - 1);
        let entry = &ssa.blocks[ssa.entry.index()];
        assert_eq!(entry.last().unwrap().op, Op::Goto);
        assert!(ssa
            .blocks
            .iter()
            .flat_map(|b| &b.insns)
            .all(|i| i.op != Op::Const(Constant::Int(1))));
    }

    #[test]
    fn test_java_conversion_semantics() {
        assert_eq!(
            convert(Constant::Float(f32::NAN.to_bits()), Kind::Int),
            Some(Constant::Int(0))
        );
        assert_eq!(
            convert(Constant::Double(1e20f64.to_bits()), Kind::Int),
            Some(Constant::Int(i32::MAX))
        );
        assert_eq!(
            fold_binary(BinOp::Div, Kind::Int, Constant::Int(i32::MIN), Constant::Int(-1)),
            Some(Constant::Int(i32::MIN))
        );
        assert_eq!(
            fold_binary(BinOp::Shl, Kind::Int, Constant::Int(1), Constant::Int(33)),
            Some(Constant::Int(2))
        );
    }

    #[test]
    fn test_compare_nan_bias() {
        let nan = Constant::Float(f32::NAN.to_bits());
        let one = Constant::Float(1.0f32.to_bits());
        assert_eq!(compare(CmpOp::LFloat, nan, one), Some(-1));
        assert_eq!(compare(CmpOp::GFloat, nan, one), Some(1));
        assert_eq!(
            compare(CmpOp::Long, Constant::Long(3), Constant::Long(2)),
            Some(1)
        );
    }
}
