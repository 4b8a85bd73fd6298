//! Register assignment.
//!
//! Values are first grouped into slots: a slot holds values of one kind that pairwise never
//! interfere, so they can share a register range. Phi-related values are absorbed first,
//! then values related by `move`, which lets phi elimination and move lowering disappear
//! for the common cases. Finally each slot, in order of its first definition, absorbs every
//! later value of its kind it does not interfere with. Each slot carries the union of its
//! members' interference sets, so absorbing a value is a single bitset intersection.
//!
//! Slots are then placed:
//!
//! - a slot holding a parameter sits at that parameter's argument word, so the incoming
//!   arguments never move;
//! - every other slot takes the lowest register at or above the argument words whose range
//!   avoids every already placed slot it interferes with.
//!
//! The result is verified before it is returned: overlapping registers for two interfering
//! values are reported as [`Error::AllocationInvariant`].

use log::trace;

use crate::{
    ir::Op,
    regalloc::interference::InterferenceGraph,
    ssa::{Definition, SsaMethod, ValueId},
    types::Kind,
    utils::bitset::BitSet,
    Error, Result,
};

/// Register of every value that needs one.
#[derive(Debug, Clone)]
pub struct Allocation {
    registers: Vec<Option<u32>>,
    kinds: Vec<Kind>,
    /// Registers used, argument words included.
    pub reg_count: u32,
    /// Argument words; parameters occupy `0..param_words`.
    pub param_words: u32,
}

impl Allocation {
    /// First register of `value`, or `None` for values that never reach the output.
    #[must_use]
    pub fn register(&self, value: ValueId) -> Option<u32> {
        self.registers.get(value.index()).copied().flatten()
    }

    /// Kind of `value`.
    #[must_use]
    pub fn kind(&self, value: ValueId) -> Kind {
        self.kinds[value.index()]
    }
}

struct Slot {
    members: BitSet,
    interference: BitSet,
    kind: Kind,
    pinned: Option<u32>,
    register: Option<u32>,
}

/// Assigns registers to the values of `method`.
///
/// # Errors
/// Returns [`Error::AllocationInvariant`] if the assignment would place two interfering
/// values in overlapping registers.
pub fn allocate(method: &SsaMethod, graph: &InterferenceGraph) -> Result<Allocation> {
    let values = method.value_count();
    let present = defined_values(method);

    let mut slot_of: Vec<Option<usize>> = vec![None; values];
    let mut slots: Vec<Slot> = Vec::new();
    for value in present.iter() {
        let id = ValueId::new(value);
        let meta = method.value(id);
        let mut members = BitSet::new(values);
        members.insert(value);
        slot_of[value] = Some(slots.len());
        slots.push(Slot {
            members,
            interference: graph.neighbors(id).clone(),
            kind: meta.kind,
            pinned: match meta.def {
                Definition::Param(word) => Some(word),
                _ => None,
            },
            register: None,
        });
    }

    for (a, b) in affinities(method) {
        let (Some(sa), Some(sb)) = (slot_of[a.index()], slot_of[b.index()]) else {
            continue;
        };
        if sa == sb || !can_merge(&slots[sa], &slots[sb]) {
            continue;
        }
        merge(&mut slots, &mut slot_of, sa, sb);
    }

    // Each slot, in definition order, takes every later compatible slot.
    let mut by_first: Vec<usize> = (0..slots.len())
        .filter(|&s| !slots[s].members.is_empty())
        .collect();
    by_first.sort_by_key(|&s| slots[s].members.iter().next());
    for (i, &keep) in by_first.iter().enumerate() {
        if slots[keep].members.is_empty() {
            continue;
        }
        for &later in &by_first[i + 1..] {
            if !slots[later].members.is_empty() && can_merge(&slots[keep], &slots[later]) {
                merge(&mut slots, &mut slot_of, keep, later);
            }
        }
    }

    let param_words = method.param_words;
    let mut order: Vec<usize> = (0..slots.len())
        .filter(|&s| !slots[s].members.is_empty())
        .collect();
    // Pinned slots first, then by first member for a deterministic layout.
    order.sort_by_key(|&s| (slots[s].pinned.is_none(), slots[s].members.iter().next()));

    let mut placed: Vec<usize> = Vec::with_capacity(order.len());
    for s in order {
        let width = slots[s].kind.width();
        let register = match slots[s].pinned {
            Some(word) => word,
            None => {
                let mut busy: Vec<(u32, u32)> = placed
                    .iter()
                    .filter(|&&other| slots[s].interference.intersects(&slots[other].members))
                    .filter_map(|&other| {
                        slots[other]
                            .register
                            .map(|r| (r, r + slots[other].kind.width()))
                    })
                    .collect();
                busy.sort_unstable();
                first_fit(&busy, param_words, width)
            }
        };
        slots[s].register = Some(register);
        placed.push(s);
    }

    let mut registers = vec![None; values];
    let mut reg_count = param_words;
    for slot in &slots {
        let Some(register) = slot.register else { continue };
        reg_count = reg_count.max(register + slot.kind.width());
        for member in slot.members.iter() {
            registers[member] = Some(register);
        }
    }

    let allocation = Allocation {
        registers,
        kinds: method.values.iter().map(|v| v.kind).collect(),
        reg_count,
        param_words,
    };
    verify(method, graph, &allocation, &present)?;
    trace!(
        "{}: {} values in {} registers ({} argument words)",
        method.name,
        present.count(),
        reg_count,
        param_words
    );
    Ok(allocation)
}

/// Values defined somewhere in the method; undefined placeholders and values whose
/// definition was optimized away get no register.
fn defined_values(method: &SsaMethod) -> BitSet {
    let mut present = BitSet::new(method.value_count());
    for block in &method.blocks {
        for phi in &block.phis {
            present.insert(phi.result.index());
        }
        for insn in &block.insns {
            if let Some(result) = insn.result {
                present.insert(result.index());
            }
        }
    }
    present
}

/// Pairs of values worth sharing a register: phi results with their operands, then move
/// results with their sources.
fn affinities(method: &SsaMethod) -> Vec<(ValueId, ValueId)> {
    let mut pairs = Vec::new();
    for block in &method.blocks {
        for phi in &block.phis {
            for operand in &phi.operands {
                pairs.push((phi.result, operand.value));
            }
        }
    }
    for block in &method.blocks {
        for insn in &block.insns {
            if let (Op::Move, Some(result), [source]) =
                (&insn.op, insn.result, insn.sources.as_slice())
            {
                pairs.push((result, *source));
            }
        }
    }
    pairs
}

/// Moves the members of `from` into `into`, keeping the pin of either.
fn merge(slots: &mut [Slot], slot_of: &mut [Option<usize>], into: usize, from: usize) {
    let members = std::mem::replace(&mut slots[from].members, BitSet::new(0));
    let interference = std::mem::replace(&mut slots[from].interference, BitSet::new(0));
    for member in members.iter() {
        slot_of[member] = Some(into);
    }
    slots[into].members.union_with(&members);
    slots[into].interference.union_with(&interference);
    slots[into].pinned = slots[into].pinned.or(slots[from].pinned.take());
}

fn can_merge(a: &Slot, b: &Slot) -> bool {
    a.kind == b.kind
        && !(a.pinned.is_some() && b.pinned.is_some())
        && !a.interference.intersects(&b.members)
        && !b.interference.intersects(&a.members)
}

/// Lowest start `>= floor` whose `width` registers avoid every busy range.
fn first_fit(busy: &[(u32, u32)], floor: u32, width: u32) -> u32 {
    let mut candidate = floor;
    loop {
        let clash = busy
            .iter()
            .find(|&&(start, end)| candidate < end && start < candidate + width);
        match clash {
            Some(&(_, end)) => candidate = end,
            None => return candidate,
        }
    }
}

fn verify(
    method: &SsaMethod,
    graph: &InterferenceGraph,
    allocation: &Allocation,
    present: &BitSet,
) -> Result<()> {
    for a in present.iter() {
        let a_id = ValueId::new(a);
        let Some(ra) = allocation.register(a_id) else {
            return Err(Error::AllocationInvariant {
                method: method.name.clone(),
                message: format!("{a_id} has no register"),
            });
        };
        let ea = ra + method.kind(a_id).width();
        for b in graph.neighbors(a_id).iter() {
            let b_id = ValueId::new(b);
            if b <= a || !present.contains(b) {
                continue;
            }
            let Some(rb) = allocation.register(b_id) else {
                continue;
            };
            let eb = rb + method.kind(b_id).width();
            if ra < eb && rb < ea {
                return Err(Error::AllocationInvariant {
                    method: method.name.clone(),
                    message: format!("{a_id} (v{ra}) and {b_id} (v{rb}) interfere"),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::Code,
        cfg,
        ir::{BinOp, Cond, Constant},
        regalloc::{interference, liveness},
        ssa,
        types::{MethodRef, TypeId},
    };

    fn allocate_code(code: &Code) -> (SsaMethod, InterferenceGraph, Allocation) {
        let method = ssa::build(cfg::build(code).unwrap()).unwrap();
        let live = liveness::compute(&method);
        let graph = interference::build(&method, &live);
        let allocation = allocate(&method, &graph).unwrap();
        (method, graph, allocation)
    }

    #[test]
    fn test_first_fit_skips_busy_ranges() {
        assert_eq!(first_fit(&[], 2, 2), 2);
        assert_eq!(first_fit(&[(2, 4)], 2, 1), 4);
        assert_eq!(first_fit(&[(2, 3), (4, 6)], 2, 2), 6);
        assert_eq!(first_fit(&[(3, 4)], 2, 1), 2);
    }

    #[test]
    fn test_params_stay_in_argument_words() {
        let mut c = Code::new(
            MethodRef::new(
                TypeId::class("a/B"),
                "m",
                TypeId::Long,
                vec![TypeId::Int, TypeId::Long],
            ),
            true,
        );
        let a = c.param(0).unwrap();
        let b = c.param(1).unwrap();
        let wide = c.new_local(TypeId::Long).unwrap();
        c.convert(wide, a).unwrap();
        c.binary(BinOp::Add, wide, wide, b).unwrap();
        c.return_value(wide).unwrap();
        let (method, graph, allocation) = allocate_code(&c);
        assert_eq!(allocation.param_words, 3);
        let params: Vec<(u32, u32)> = method
            .values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v.def {
                Definition::Param(word) => allocation.register(ValueId::new(i)).map(|r| (word, r)),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![(0, 0), (1, 1)]);
        assert!(allocation.reg_count >= 5);
        verify(&method, &graph, &allocation, &defined_values(&method)).unwrap();
    }

    #[test]
    fn test_phi_operands_coalesce_with_result() {
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
        let (method, _, allocation) = allocate_code(&c);
        let phi = method.blocks.iter().flat_map(|b| &b.phis).next().unwrap();
        let target = allocation.register(phi.result);
        for operand in &phi.operands {
            assert_eq!(allocation.register(operand.value), target);
        }
    }

    #[test]
    fn test_disjoint_values_share_a_register() {
        let mut c = Code::new(
            MethodRef::new(TypeId::class("a/B"), "m", TypeId::Int, vec![TypeId::Int]),
            true,
        );
        let x = c.param(0).unwrap();
        let first = c.new_local(TypeId::Int).unwrap();
        let sum = c.new_local(TypeId::Int).unwrap();
        let second = c.new_local(TypeId::Int).unwrap();
        c.load_constant(first, Constant::Int(7)).unwrap();
        c.binary(BinOp::Add, sum, first, x).unwrap();
        c.load_constant(second, Constant::Int(9)).unwrap();
        c.binary(BinOp::Mul, sum, sum, second).unwrap();
        c.return_value(sum).unwrap();
        let (method, graph, allocation) = allocate_code(&c);

        let constants: Vec<ValueId> = method
            .blocks
            .iter()
            .flat_map(|b| &b.insns)
            .filter(|i| matches!(i.op, Op::Const(_)))
            .filter_map(|i| i.result)
            .collect();
        assert_eq!(constants.len(), 2);
        assert!(!graph.interferes(constants[0], constants[1]));
        assert_eq!(
            allocation.register(constants[0]),
            allocation.register(constants[1])
        );
        assert_eq!(allocation.reg_count, 2);
        verify(&method, &graph, &allocation, &defined_values(&method)).unwrap();
    }

    #[test]
    fn test_verify_rejects_overlap() {
        let mut c = Code::new(
            MethodRef::new(TypeId::class("a/B"), "m", TypeId::Int, vec![TypeId::Int, TypeId::Int]),
            true,
        );
        let a = c.param(0).unwrap();
        let b = c.param(1).unwrap();
        c.binary(BinOp::Add, a, a, b).unwrap();
        c.return_value(a).unwrap();
        let (method, graph, mut allocation) = allocate_code(&c);
        for register in allocation.registers.iter_mut().flatten() {
            *register = 0;
        }
        let err = verify(&method, &graph, &allocation, &defined_values(&method)).unwrap_err();
        assert!(matches!(err, Error::AllocationInvariant { .. }));
    }
}
