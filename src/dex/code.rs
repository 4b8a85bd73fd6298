//! Lowering of one register-form method to a code item.
//!
//! [`assemble`] runs after phi elimination and cleanup, when every value lives in a physical
//! register and the parameters sit at the top of the frame. It works in four steps:
//!
//! 1. **Layout** - blocks are chained into traces that follow the primary successor, so most
//!    `goto`s and `if` fallthroughs disappear. A block receiving a call result is always
//!    placed directly after the call.
//! 2. **Selection** - each instruction gets the smallest opcode that can hold its operands.
//!    Operands that still do not fit are routed through scratch registers reserved at the
//!    bottom of the frame; the frame is shifted up by the scratch count, which is iterated to
//!    a fixed point.
//! 3. **Relaxation** - every `goto` starts in its one-unit form and is widened until every
//!    offset fits.
//! 4. **Tables** - try ranges are built from runs of throwing instructions with the same
//!    handlers, and a position is recorded at every line change.

use log::trace;

use crate::{
    dex::{
        debug::DebugInfo,
        insn::{DalvInsn, Operand},
        opcode::Opcode,
        pool::Pool,
        CatchHandler, CodeItem, TryItem,
    },
    ir::{BasicBlock, BinOp, CatchEdge, CmpOp, Cond, Constant, Insn, Op, RegSpec, RopMethod, UnOp},
    types::{Kind, Prototype, TypeId},
    Result,
};

/// An instruction whose branch target is still a block.
#[derive(Debug)]
struct Pending {
    insn: DalvInsn,
    target: Option<usize>,
    line: Option<u32>,
    throws: bool,
    /// Block whose catch edges cover this instruction.
    handlers: Option<usize>,
}

/// Encodes `method` into a code item.
///
/// `proto` is the method's declared prototype; it sizes the debug info.
///
/// # Errors
/// Returns [`crate::Error::Encoding`] if the frame, an index, a branch or a try range does not
/// fit the container, or if a call result cannot be placed after its call.
pub fn assemble(method: &RopMethod, proto: &Prototype, pool: &Pool) -> Result<CodeItem> {
    let order = layout(method)?;

    let mut scratch = 0;
    let selected = loop {
        let selector = Selector::new(method, pool, scratch).run(&order)?;
        if selector.needed <= scratch {
            break selector;
        }
        scratch = selector.needed;
    };

    let registers = method.reg_count + scratch;
    let registers = u16::try_from(registers)
        .map_err(|_| encoding_error!("{} needs {} registers", method.name, registers))?;
    let outs = u16::try_from(selected.outs)
        .map_err(|_| encoding_error!("{} passes {} argument words", method.name, selected.outs))?;
    let ins = u16::try_from(method.param_words)
        .map_err(|_| encoding_error!("{} takes {} argument words", method.name, method.param_words))?;

    let Selector {
        out: mut pending,
        starts,
        ..
    } = selected;
    let addresses = relax(&mut pending, &starts);
    let block_address = |block: usize| addresses[starts[block]];

    let mut insns = Vec::with_capacity(addresses.last().copied().unwrap_or(0) as usize);
    for (i, p) in pending.iter_mut().enumerate() {
        if let Some(target) = p.target {
            let offset = i64::from(block_address(target)) - i64::from(addresses[i]);
            p.insn.operand = Operand::Branch(offset as i32);
        }
        p.insn.encode(&mut insns).map_err(|e| {
            encoding_error!("{} at {:#x}: {}", method.name, addresses[i], e)
        })?;
    }

    let (tries, handlers) = try_ranges(method, pool, &pending, &addresses, &block_address)?;

    let mut positions = Vec::new();
    let mut last_line = None;
    for (i, p) in pending.iter().enumerate() {
        if p.line.is_some() && p.line != last_line {
            positions.extend(p.line.map(|line| (addresses[i], line)));
            last_line = p.line;
        }
    }

    trace!(
        "{}: {} units, {} registers ({} scratch), {} tries",
        method.name,
        insns.len(),
        registers,
        scratch,
        tries.len()
    );
    Ok(CodeItem {
        registers,
        ins,
        outs,
        insns,
        tries,
        handlers,
        debug: DebugInfo::from_positions(proto.params.len() as u32, positions),
    })
}

/// Orders blocks into fallthrough traces, entry first.
fn layout(method: &RopMethod) -> Result<Vec<usize>> {
    let count = method.blocks.len();
    let entry = method.entry.index();
    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);
    for head in std::iter::once(entry).chain(0..count) {
        if placed[head] || (head != entry && method.blocks[head].starts_with_move_result()) {
            continue;
        }
        let mut current = head;
        loop {
            placed[current] = true;
            order.push(current);
            match method.blocks[current].primary {
                Some(next) if !placed[next.index()] => current = next.index(),
                _ => break,
            }
        }
    }
    if let Some(stray) = placed.iter().position(|p| !p) {
        return Err(encoding_error!(
            "{}: block {} receives a result but follows no call",
            method.name,
            stray
        ));
    }
    Ok(order)
}

/// Widens `goto`s until every offset fits and returns the instruction addresses, with one
/// extra entry for the end of the code.
fn relax(pending: &mut [Pending], starts: &[usize]) -> Vec<u32> {
    loop {
        let mut addresses = Vec::with_capacity(pending.len() + 1);
        let mut address = 0u32;
        for p in pending.iter() {
            addresses.push(address);
            address += p.insn.units();
        }
        addresses.push(address);

        let mut widened = false;
        for (i, p) in pending.iter_mut().enumerate() {
            let Some(target) = p.target else {
                continue;
            };
            if !p.insn.opcode.is_goto() {
                continue;
            }
            let offset = i64::from(addresses[starts[target]]) - i64::from(addresses[i]);
            let needed = if offset == 0 || i16::try_from(offset).is_err() {
                Opcode::Goto32
            } else if i8::try_from(offset).is_ok() {
                Opcode::Goto
            } else {
                Opcode::Goto16
            };
            if needed.format().units() > p.insn.opcode.format().units() {
                p.insn.opcode = needed;
                widened = true;
            }
        }
        if !widened {
            return addresses;
        }
    }
}

fn try_ranges(
    method: &RopMethod,
    pool: &Pool,
    pending: &[Pending],
    addresses: &[u32],
    block_address: &dyn Fn(usize) -> u32,
) -> Result<(Vec<TryItem>, Vec<CatchHandler>)> {
    let mut tries = Vec::new();
    let mut handlers: Vec<CatchHandler> = Vec::new();
    let mut open: Option<(u32, u32, &[CatchEdge])> = None;

    let mut close = |range: Option<(u32, u32, &[CatchEdge])>| -> Result<()> {
        let Some((start, end, edges)) = range else {
            return Ok(());
        };
        let mut handler = CatchHandler::default();
        for edge in edges {
            let address = block_address(edge.handler.index());
            match &edge.ty {
                Some(ty) => handler.catches.push((pool.type_id(ty)?, address)),
                None => {
                    handler.catch_all = Some(address);
                    break;
                }
            }
        }
        let index = match handlers.iter().position(|h| *h == handler) {
            Some(index) => index,
            None => {
                handlers.push(handler);
                handlers.len() - 1
            }
        };
        let count = u16::try_from(end - start).map_err(|_| {
            encoding_error!("{}: try range at {:#x} spans {} units", method.name, start, end - start)
        })?;
        tries.push(TryItem {
            start,
            count,
            handler: index,
        });
        Ok(())
    };

    for (i, p) in pending.iter().enumerate() {
        if !p.throws {
            continue;
        }
        let edges = p
            .handlers
            .map(|b| method.blocks[b].catches.as_slice())
            .unwrap_or_default();
        if edges.is_empty() {
            close(open.take())?;
            continue;
        }
        match &mut open {
            Some((_, end, current)) if *current == edges => *end = addresses[i + 1],
            range => {
                close(range.take())?;
                *range = Some((addresses[i], addresses[i + 1], edges));
            }
        }
    }
    close(open.take())?;
    Ok((tries, handlers))
}

/// Instruction selection over one block order at a fixed scratch count.
struct Selector<'a> {
    method: &'a RopMethod,
    pool: &'a Pool,
    scratch: u32,
    /// Scratch registers this pass actually needed.
    needed: u32,
    outs: u32,
    out: Vec<Pending>,
    /// Index of the first pending instruction of each block.
    starts: Vec<usize>,
}

impl<'a> Selector<'a> {
    fn new(method: &'a RopMethod, pool: &'a Pool, scratch: u32) -> Self {
        Selector {
            method,
            pool,
            scratch,
            needed: 0,
            outs: 0,
            out: Vec::new(),
            starts: vec![0; method.blocks.len()],
        }
    }

    fn run(mut self, order: &[usize]) -> Result<Self> {
        let method = self.method;
        for (pos, &b) in order.iter().enumerate() {
            let block = &method.blocks[b];
            let next = order.get(pos + 1).copied();
            self.starts[b] = self.out.len();
            let last = block.insns.len().saturating_sub(1);
            for (i, insn) in block.insns.iter().enumerate() {
                let handlers = (i == last && !block.catches.is_empty()).then_some(b);
                self.select(block, insn, next, handlers)?;
            }
            let falls_through = block.last().map_or(true, |insn| !insn.is_control());
            if let (true, Some(primary)) = (falls_through, block.primary) {
                if Some(primary.index()) != next {
                    if method.blocks[primary.index()].starts_with_move_result() {
                        return Err(encoding_error!(
                            "{}: call result block {} is not adjacent",
                            method.name,
                            primary
                        ));
                    }
                    let line = block.last().and_then(|insn| insn.line);
                    self.goto(primary.index(), line);
                }
            }
        }
        Ok(self)
    }

    fn push(&mut self, opcode: Opcode, regs: Vec<u32>, operand: Operand, line: Option<u32>) -> usize {
        self.out.push(Pending {
            insn: DalvInsn::new(opcode, regs, operand),
            target: None,
            line,
            throws: false,
            handlers: None,
        });
        self.out.len() - 1
    }

    fn goto(&mut self, target: usize, line: Option<u32>) {
        let at = self.push(Opcode::Goto, Vec::new(), Operand::Branch(0), line);
        self.out[at].target = Some(target);
    }

    /// Register copy, with the narrowest form that holds both registers.
    fn copy(&mut self, kind: Kind, dst: u32, src: u32, line: Option<u32>) {
        if dst == src {
            return;
        }
        let family = match kind {
            Kind::Long | Kind::Double => [Opcode::MoveWide, Opcode::MoveWideFrom16, Opcode::MoveWide16],
            Kind::Object => [Opcode::MoveObject, Opcode::MoveObjectFrom16, Opcode::MoveObject16],
            Kind::Int | Kind::Float => [Opcode::Move, Opcode::MoveFrom16, Opcode::Move16],
        };
        let opcode = if dst <= 0xf && src <= 0xf {
            family[0]
        } else if dst <= 0xff {
            family[1]
        } else {
            family[2]
        };
        self.push(opcode, vec![dst, src], Operand::None, line);
    }

    /// Emits `opcode` with `result` and `sources` in format order, routing operands that do
    /// not fit through scratch registers. Returns the index of the instruction itself.
    fn fitted(
        &mut self,
        opcode: Opcode,
        result: Option<RegSpec>,
        sources: &[RegSpec],
        operand: Operand,
        line: Option<u32>,
    ) -> Result<usize> {
        let limits = opcode.format().register_limits();
        let arity = usize::from(result.is_some()) + sources.len();
        if limits.len() != arity {
            return Err(encoding_error!(
                "{}: {} takes {} registers, got {}",
                self.method.name,
                opcode,
                limits.len(),
                arity
            ));
        }

        let mut regs = Vec::with_capacity(arity);
        let mut copy_out = None;
        if let Some(dst) = result {
            let reg = dst.reg + self.scratch;
            if reg > limits[0] {
                copy_out = Some((dst.kind, reg));
                self.needed = self.needed.max(dst.width());
                regs.push(0);
            } else {
                regs.push(reg);
            }
        }
        let mut next_scratch = 0;
        let offset = usize::from(result.is_some());
        for (i, src) in sources.iter().enumerate() {
            let reg = src.reg + self.scratch;
            if reg > limits[offset + i] {
                self.copy(src.kind, next_scratch, reg, line);
                regs.push(next_scratch);
                next_scratch += src.width();
            } else {
                regs.push(reg);
            }
        }
        self.needed = self.needed.max(next_scratch);

        let at = self.push(opcode, regs, operand, line);
        if let Some((kind, reg)) = copy_out {
            self.copy(kind, reg, 0, line);
        }
        Ok(at)
    }

    fn select(
        &mut self,
        block: &BasicBlock,
        insn: &Insn,
        next: Option<usize>,
        handlers: Option<usize>,
    ) -> Result<()> {
        let line = insn.line;
        let method: &'a RopMethod = self.method;
        let name = &method.name;
        let result = || {
            insn.result
                .ok_or_else(|| encoding_error!("{}: {} has no result", name, insn.op))
        };
        let source = |i: usize| {
            insn.sources
                .get(i)
                .copied()
                .ok_or_else(|| encoding_error!("{}: {} lacks operand {}", name, insn.op, i))
        };
        let first = self.out.len();

        match &insn.op {
            Op::MoveParam { .. } => {}
            Op::Goto => {
                let target = block
                    .primary
                    .ok_or_else(|| encoding_error!("{}: goto without target", name))?;
                if Some(target.index()) != next {
                    self.goto(target.index(), line);
                }
            }
            Op::If(cond) | Op::IfZ(cond) => {
                let (Some(fall), Some(taken)) = (block.successors.first(), block.successors.get(1))
                else {
                    return Err(encoding_error!("{}: branch without two successors", name));
                };
                let (fall, taken) = (fall.index(), taken.index());
                let zero = matches!(insn.op, Op::IfZ(_));
                if Some(fall) == next {
                    self.branch(*cond, zero, &insn.sources, taken, line)?;
                } else if Some(taken) == next {
                    self.branch(cond.negate(), zero, &insn.sources, fall, line)?;
                } else {
                    self.branch(*cond, zero, &insn.sources, taken, line)?;
                    self.goto(fall, line);
                }
            }
            Op::Move => {
                let (dst, src) = (result()?, source(0)?);
                self.copy(dst.kind, dst.reg + self.scratch, src.reg + self.scratch, line);
            }
            Op::MoveResultPseudo => {
                let after_call = self.out.last().is_some_and(|p| p.insn.opcode.is_invoke());
                if !after_call {
                    return Err(encoding_error!("{}: move-result does not follow a call", name));
                }
                self.move_result(result()?, line)?;
            }
            Op::MoveException => {
                self.fitted(Opcode::MoveException, Some(result()?), &[], Operand::None, line)?;
            }
            Op::Const(value) => self.constant(result()?, *value, line)?,
            Op::ConstString(value) => {
                let index = self.pool.string(value)?;
                let opcode = if index > 0xffff {
                    Opcode::ConstStringJumbo
                } else {
                    Opcode::ConstString
                };
                self.fitted(opcode, Some(result()?), &[], Operand::Index(index), line)?;
            }
            Op::ConstClass(ty) => {
                let index = self.pool.type_id(ty)?;
                self.fitted(Opcode::ConstClass, Some(result()?), &[], Operand::Index(index), line)?;
            }
            Op::Unary(op) => {
                let dst = result()?;
                let opcode = match (op, dst.kind) {
                    (UnOp::Neg, Kind::Int) => Opcode::NegInt,
                    (UnOp::Not, Kind::Int) => Opcode::NotInt,
                    (UnOp::Neg, Kind::Long) => Opcode::NegLong,
                    (UnOp::Not, Kind::Long) => Opcode::NotLong,
                    (UnOp::Neg, Kind::Float) => Opcode::NegFloat,
                    (UnOp::Neg, Kind::Double) => Opcode::NegDouble,
                    (op, kind) => return Err(encoding_error!("{}: no {} for {}", name, op, kind)),
                };
                self.fitted(opcode, Some(dst), &[source(0)?], Operand::None, line)?;
            }
            Op::Binary(op) => {
                let dst = result()?;
                let opcode = binary_opcode(*op, dst.kind)
                    .ok_or_else(|| encoding_error!("{}: no {} for {}", name, op, dst.kind))?;
                self.fitted(opcode, Some(dst), &[source(0)?, source(1)?], Operand::None, line)?;
            }
            Op::Convert { from, to } => {
                let opcode = convert_opcode(*from, *to)
                    .ok_or_else(|| encoding_error!("{}: no conversion {} to {}", name, from, to))?;
                self.fitted(opcode, Some(result()?), &[source(0)?], Operand::None, line)?;
            }
            Op::Narrow(ty) => {
                let opcode = match ty {
                    TypeId::Byte => Opcode::IntToByte,
                    TypeId::Char => Opcode::IntToChar,
                    TypeId::Short => Opcode::IntToShort,
                    other => return Err(encoding_error!("{}: cannot narrow to {}", name, other)),
                };
                self.fitted(opcode, Some(result()?), &[source(0)?], Operand::None, line)?;
            }
            Op::Cmp(op) => {
                let opcode = match op {
                    CmpOp::LFloat => Opcode::CmplFloat,
                    CmpOp::GFloat => Opcode::CmpgFloat,
                    CmpOp::LDouble => Opcode::CmplDouble,
                    CmpOp::GDouble => Opcode::CmpgDouble,
                    CmpOp::Long => Opcode::CmpLong,
                };
                self.fitted(opcode, Some(result()?), &[source(0)?, source(1)?], Operand::None, line)?;
            }
            Op::Return => {
                match insn.sources.first() {
                    None => {
                        self.push(Opcode::ReturnVoid, Vec::new(), Operand::None, line);
                    }
                    Some(value) => {
                        let opcode = match value.kind {
                            Kind::Long | Kind::Double => Opcode::ReturnWide,
                            Kind::Object => Opcode::ReturnObject,
                            Kind::Int | Kind::Float => Opcode::Return,
                        };
                        self.fitted(opcode, None, &[*value], Operand::None, line)?;
                    }
                }
            }
            Op::Throw => {
                self.fitted(Opcode::Throw, None, &[source(0)?], Operand::None, line)?;
            }
            Op::CheckCast(ty) => {
                let index = self.pool.type_id(ty)?;
                let src = source(0)?;
                self.fitted(Opcode::CheckCast, None, &[src], Operand::Index(index), line)?;
                if let Some(dst) = insn.result {
                    self.copy(dst.kind, dst.reg + self.scratch, src.reg + self.scratch, line);
                }
            }
            Op::InstanceOf(ty) => {
                let index = self.pool.type_id(ty)?;
                self.fitted(Opcode::InstanceOf, Some(result()?), &[source(0)?], Operand::Index(index), line)?;
            }
            Op::NewInstance(ty) => {
                let index = self.pool.type_id(ty)?;
                self.fitted(Opcode::NewInstance, Some(result()?), &[], Operand::Index(index), line)?;
            }
            Op::NewArray(ty) => {
                let index = self.pool.type_id(ty)?;
                self.fitted(Opcode::NewArray, Some(result()?), &[source(0)?], Operand::Index(index), line)?;
            }
            Op::ArrayLength => {
                self.fitted(Opcode::ArrayLength, Some(result()?), &[source(0)?], Operand::None, line)?;
            }
            Op::AGet(ty) => {
                let opcode = typed_variant(Opcode::Aget, ty, name)?;
                self.fitted(opcode, Some(result()?), &[source(0)?, source(1)?], Operand::None, line)?;
            }
            Op::APut(ty) => {
                let opcode = typed_variant(Opcode::Aput, ty, name)?;
                let sources = [source(0)?, source(1)?, source(2)?];
                self.fitted(opcode, None, &sources, Operand::None, line)?;
            }
            Op::IGet(field) => {
                let opcode = typed_variant(Opcode::Iget, &field.ty, name)?;
                let index = self.pool.field(field)?;
                self.fitted(opcode, Some(result()?), &[source(0)?], Operand::Index(index), line)?;
            }
            Op::IPut(field) => {
                let opcode = typed_variant(Opcode::Iput, &field.ty, name)?;
                let index = self.pool.field(field)?;
                self.fitted(opcode, None, &[source(0)?, source(1)?], Operand::Index(index), line)?;
            }
            Op::SGet(field) => {
                let opcode = typed_variant(Opcode::Sget, &field.ty, name)?;
                let index = self.pool.field(field)?;
                self.fitted(opcode, Some(result()?), &[], Operand::Index(index), line)?;
            }
            Op::SPut(field) => {
                let opcode = typed_variant(Opcode::Sput, &field.ty, name)?;
                let index = self.pool.field(field)?;
                self.fitted(opcode, None, &[source(0)?], Operand::Index(index), line)?;
            }
            Op::Invoke(kind, target) => {
                let index = self.pool.method(target)?;
                let at = self.invoke(*kind as u8, index, &insn.sources, line)?;
                self.out[at].throws = true;
                self.out[at].handlers = handlers;
                if let Some(dst) = insn.result {
                    self.move_result(dst, line)?;
                }
                return Ok(());
            }
        }

        if insn.can_throw() {
            // The throwing instruction is the last one pushed that is not a scratch copy-out.
            if let Some(p) = self.out[first..]
                .iter_mut()
                .rev()
                .find(|p| !is_plain_move(p.insn.opcode))
            {
                p.throws = true;
                p.handlers = handlers;
            }
        }
        Ok(())
    }

    fn branch(
        &mut self,
        cond: Cond,
        zero: bool,
        sources: &[RegSpec],
        target: usize,
        line: Option<u32>,
    ) -> Result<()> {
        let base = if zero { Opcode::IfEqz } else { Opcode::IfEq };
        let opcode = Opcode::from_repr(base as u8 + cond_index(cond))
            .ok_or_else(|| encoding_error!("no branch opcode for {}", cond))?;
        let at = self.fitted(opcode, None, sources, Operand::Branch(0), line)?;
        self.out[at].target = Some(target);
        Ok(())
    }

    fn constant(&mut self, dst: RegSpec, value: Constant, line: Option<u32>) -> Result<()> {
        let reg = dst.reg + self.scratch;
        let bits = value.bits();
        let fits16 = i16::try_from(bits).is_ok();
        let opcode = if dst.kind.is_wide() {
            if fits16 {
                Opcode::ConstWide16
            } else if i32::try_from(bits).is_ok() {
                Opcode::ConstWide32
            } else if bits & 0xffff_ffff_ffff == 0 {
                Opcode::ConstWideHigh16
            } else {
                Opcode::ConstWide
            }
        } else if reg <= 0xf && (-8..=7).contains(&bits) {
            Opcode::Const4
        } else if fits16 {
            Opcode::Const16
        } else if bits & 0xffff == 0 {
            Opcode::ConstHigh16
        } else {
            Opcode::Const
        };
        self.fitted(opcode, Some(dst), &[], Operand::Literal(bits), line)?;
        Ok(())
    }

    fn move_result(&mut self, dst: RegSpec, line: Option<u32>) -> Result<()> {
        let opcode = match dst.kind {
            Kind::Long | Kind::Double => Opcode::MoveResultWide,
            Kind::Object => Opcode::MoveResultObject,
            Kind::Int | Kind::Float => Opcode::MoveResult,
        };
        self.fitted(opcode, Some(dst), &[], Operand::None, line)?;
        Ok(())
    }

    /// Emits a call; `kind` is the position of the dispatch kind in the opcode table.
    fn invoke(&mut self, kind: u8, index: u32, sources: &[RegSpec], line: Option<u32>) -> Result<usize> {
        let mut words = Vec::with_capacity(sources.len() * 2);
        for src in sources {
            let reg = src.reg + self.scratch;
            words.push(reg);
            if src.kind.is_wide() {
                words.push(reg + 1);
            }
        }
        if words.len() > 0xff {
            return Err(encoding_error!("{}: call with {} argument words", self.method.name, words.len()));
        }
        self.outs = self.outs.max(words.len() as u32);

        let simple = Opcode::from_repr(Opcode::InvokeVirtual as u8 + kind);
        let range = Opcode::from_repr(Opcode::InvokeVirtualRange as u8 + kind);
        let (Some(simple), Some(range)) = (simple, range) else {
            return Err(encoding_error!("no call opcode for kind {}", kind));
        };
        let contiguous = words.windows(2).all(|w| w[1] == w[0] + 1);
        let at = if words.len() <= 5 && words.iter().all(|&r| r <= 0xf) {
            self.push(simple, words, Operand::Index(index), line)
        } else if contiguous && words.first().map_or(true, |&r| r <= 0xffff) {
            self.push(range, words, Operand::Index(index), line)
        } else {
            let mut next = 0;
            for src in sources {
                self.copy(src.kind, next, src.reg + self.scratch, line);
                next += src.width();
            }
            self.needed = self.needed.max(next);
            self.push(range, (0..next).collect(), Operand::Index(index), line)
        };
        Ok(at)
    }
}

fn is_plain_move(opcode: Opcode) -> bool {
    (Opcode::Move as u8..=Opcode::MoveObject16 as u8).contains(&(opcode as u8))
}

fn cond_index(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0,
        Cond::Ne => 1,
        Cond::Lt => 2,
        Cond::Ge => 3,
        Cond::Gt => 4,
        Cond::Le => 5,
    }
}

fn binary_opcode(op: BinOp, kind: Kind) -> Option<Opcode> {
    let index = match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::Mul => 2,
        BinOp::Div => 3,
        BinOp::Rem => 4,
        BinOp::And => 5,
        BinOp::Or => 6,
        BinOp::Xor => 7,
        BinOp::Shl => 8,
        BinOp::Shr => 9,
        BinOp::Ushr => 10,
    };
    let base = match kind {
        Kind::Int => Opcode::AddInt,
        Kind::Long => Opcode::AddLong,
        Kind::Float if index <= 4 => Opcode::AddFloat,
        Kind::Double if index <= 4 => Opcode::AddDouble,
        _ => return None,
    };
    Opcode::from_repr(base as u8 + index)
}

fn convert_opcode(from: Kind, to: Kind) -> Option<Opcode> {
    use Kind::{Double, Float, Int, Long};
    Some(match (from, to) {
        (Int, Long) => Opcode::IntToLong,
        (Int, Float) => Opcode::IntToFloat,
        (Int, Double) => Opcode::IntToDouble,
        (Long, Int) => Opcode::LongToInt,
        (Long, Float) => Opcode::LongToFloat,
        (Long, Double) => Opcode::LongToDouble,
        (Float, Int) => Opcode::FloatToInt,
        (Float, Long) => Opcode::FloatToLong,
        (Float, Double) => Opcode::FloatToDouble,
        (Double, Int) => Opcode::DoubleToInt,
        (Double, Long) => Opcode::DoubleToLong,
        (Double, Float) => Opcode::DoubleToFloat,
        _ => return None,
    })
}

/// Picks the `-wide`, `-object`, `-boolean`, `-byte`, `-char` or `-short` form of an array
/// or field access by the accessed type.
fn typed_variant(base: Opcode, ty: &TypeId, method: &str) -> Result<Opcode> {
    let offset = match ty {
        TypeId::Int | TypeId::Float => 0,
        TypeId::Long | TypeId::Double => 1,
        TypeId::Reference(_) => 2,
        TypeId::Boolean => 3,
        TypeId::Byte => 4,
        TypeId::Char => 5,
        TypeId::Short => 6,
        TypeId::Void => return Err(encoding_error!("{}: {} of void", method, base)),
    };
    Opcode::from_repr(base as u8 + offset)
        .ok_or_else(|| encoding_error!("{}: no {} variant for {}", method, base, ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend,
        builder::Code,
        cfg,
        dex::{insn::decode_all, pool::PoolBuilder},
        regalloc, ssa,
        types::MethodRef,
    };

    fn compile(code: &Code) -> (CodeItem, Vec<DalvInsn>) {
        let method = ssa::build(cfg::build(code).unwrap()).unwrap();
        let allocation = regalloc::allocate(&method).unwrap();
        let rop = backend::lower(&method, &allocation).unwrap();
        let mut pool = PoolBuilder::new();
        pool.add_body(&rop);
        let pool = pool.finish();
        let item = assemble(&rop, &code.method().proto, &pool).unwrap();
        let decoded = decode_all(&item.insns)
            .unwrap()
            .into_iter()
            .map(|(_, insn)| insn)
            .collect();
        (item, decoded)
    }

    fn opcodes(insns: &[DalvInsn]) -> Vec<Opcode> {
        insns.iter().map(|i| i.opcode).collect()
    }

    fn owner() -> TypeId {
        TypeId::class("a/Gen")
    }

    #[test]
    fn test_straight_line_add() {
        let mut c = Code::new(
            MethodRef::new(owner(), "add", TypeId::Int, vec![TypeId::Int, TypeId::Int]),
            true,
        );
        let (a, b) = (c.param(0).unwrap(), c.param(1).unwrap());
        let sum = c.new_local(TypeId::Int).unwrap();
        c.binary(BinOp::Add, sum, a, b).unwrap();
        c.return_value(sum).unwrap();

        let (item, insns) = compile(&c);
        assert_eq!(opcodes(&insns), vec![Opcode::AddInt, Opcode::Return]);
        assert_eq!(item.ins, 2);
        assert_eq!(item.outs, 0);
        assert!(item.tries.is_empty());
        // Arguments occupy the last two registers.
        let top = u32::from(item.registers);
        let mut args = insns[0].regs[1..].to_vec();
        args.sort_unstable();
        assert_eq!(args, vec![top - 2, top - 1]);
        assert_eq!(insns[1].regs[0], insns[0].regs[0]);
    }

    #[test]
    fn test_long_loop_relaxes_back_edge() {
        let mut c = Code::new(
            MethodRef::new(owner(), "spin", TypeId::Int, vec![TypeId::Int]),
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
        for _ in 0..80 {
            c.binary(BinOp::Xor, acc, acc, n).unwrap();
        }
        c.binary(BinOp::Sub, n, n, one).unwrap();
        c.jump(top).unwrap();
        c.mark(done).unwrap();
        c.return_value(acc).unwrap();

        let (item, insns) = compile(&c);
        assert!(opcodes(&insns).contains(&Opcode::Goto16));
        // Every branch lands on an instruction boundary.
        let addressed = decode_all(&item.insns).unwrap();
        let starts: Vec<i64> = addressed.iter().map(|(a, _)| i64::from(*a)).collect();
        for (address, insn) in &addressed {
            if let Operand::Branch(offset) = insn.operand {
                assert!(starts.contains(&(i64::from(*address) + i64::from(offset))));
            }
        }
    }

    #[test]
    fn test_scattered_call_arguments_use_scratch() {
        let params = vec![TypeId::Int; 20];
        let mut c = Code::new(MethodRef::new(owner(), "wide", TypeId::Void, params), true);
        let callee = MethodRef::new(owner(), "pair", TypeId::Void, vec![TypeId::Int, TypeId::Int]);
        let (last, first) = (c.param(19).unwrap(), c.param(0).unwrap());
        c.invoke_static(&callee, None, &[last, first]).unwrap();
        c.return_void().unwrap();

        let (item, insns) = compile(&c);
        let ops = opcodes(&insns);
        assert!(ops.contains(&Opcode::InvokeStaticRange));
        assert!(ops.iter().any(|op| matches!(op, Opcode::MoveFrom16 | Opcode::Move)));
        assert_eq!(item.ins, 20);
        assert_eq!(item.outs, 2);
        assert!(u32::from(item.registers) >= 22);
    }

    #[test]
    fn test_catch_all_try_range() {
        let mut c = Code::new(MethodRef::new(owner(), "guarded", TypeId::Int, vec![]), true);
        let callee = MethodRef::new(owner(), "risky", TypeId::Int, vec![]);
        let value = c.new_local(TypeId::Int).unwrap();
        let caught = c.new_local(TypeId::throwable()).unwrap();
        let handler = c.new_label();
        c.add_catch(None, handler).unwrap();
        c.set_line(Some(7));
        c.invoke_static(&callee, Some(value), &[]).unwrap();
        c.remove_catch(None).unwrap();
        c.set_line(Some(8));
        c.return_value(value).unwrap();
        c.mark(handler).unwrap();
        c.move_exception(caught).unwrap();
        c.load_constant(value, Constant::Int(-1)).unwrap();
        c.return_value(value).unwrap();

        let (item, insns) = compile(&c);
        assert_eq!(item.tries.len(), 1);
        assert_eq!(item.handlers.len(), 1);
        let handler = &item.handlers[0];
        assert!(handler.catches.is_empty());
        let handler_address = handler.catch_all.unwrap();
        let addressed = decode_all(&item.insns).unwrap();
        let at_handler = addressed
            .iter()
            .find(|(address, _)| *address == handler_address)
            .map(|(_, insn)| insn.opcode);
        assert!(matches!(at_handler, Some(Opcode::MoveException | Opcode::Const4)));
        assert_eq!(insns[0].opcode, Opcode::InvokeStatic);
        assert_eq!(insns[1].opcode, Opcode::MoveResult);
        let debug = item.debug.unwrap();
        assert_eq!(debug.line_start, 7);
        assert_eq!(debug.positions[0], (0, 7));
    }

    #[test]
    fn test_typed_variants() {
        assert_eq!(typed_variant(Opcode::Iget, &TypeId::Boolean, "m").unwrap(), Opcode::IgetBoolean);
        assert_eq!(typed_variant(Opcode::Sput, &TypeId::Double, "m").unwrap(), Opcode::SputWide);
        assert_eq!(typed_variant(Opcode::Aget, &TypeId::string(), "m").unwrap(), Opcode::AgetObject);
        assert!(typed_variant(Opcode::Aput, &TypeId::Void, "m").is_err());
        assert_eq!(binary_opcode(BinOp::Ushr, Kind::Long), Some(Opcode::UshrLong));
        assert_eq!(binary_opcode(BinOp::Rem, Kind::Double), Some(Opcode::RemDouble));
        assert_eq!(binary_opcode(BinOp::Xor, Kind::Float), None);
    }
}
