//! Encoded Dalvik instructions.
//!
//! A [`DalvInsn`] is one instruction with concrete registers and a resolved operand; branch
//! operands are relative offsets in code units. [`DalvInsn::encode`] writes the code units
//! and [`decode`] reads them back, so the writer and the reference reader share one
//! definition of every format.

use std::fmt;

use crate::{
    dex::opcode::{Format, Opcode},
    Result,
};

/// The non-register operand of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    /// No extra operand.
    None,
    /// Literal value; for the `high16` forms the full value, low bits zero.
    Literal(i64),
    /// Index into the string, type, field or method table.
    Index(u32),
    /// Branch offset relative to the instruction, in code units.
    Branch(i32),
}

/// A Dalvik instruction with concrete operands.
///
/// For calls, `regs` lists every argument word; the range form requires them to be
/// consecutive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DalvInsn {
    /// Opcode.
    pub opcode: Opcode,
    /// Register operands in format order.
    pub regs: Vec<u32>,
    /// Extra operand.
    pub operand: Operand,
}

impl DalvInsn {
    /// Creates an instruction.
    #[must_use]
    pub fn new(opcode: Opcode, regs: Vec<u32>, operand: Operand) -> Self {
        DalvInsn {
            opcode,
            regs,
            operand,
        }
    }

    /// Size in code units.
    #[must_use]
    pub fn units(&self) -> u32 {
        self.opcode.format().units()
    }

    /// Returns `true` if every register fits the format's operand width.
    #[must_use]
    pub fn registers_fit(&self) -> bool {
        let format = self.opcode.format();
        match format {
            Format::F35c => self.regs.len() <= 5 && self.regs.iter().all(|&r| r <= 0xf),
            Format::F3rc => {
                self.regs.len() <= 0xff
                    && self.regs.first().is_none_or(|&first| {
                        first <= 0xffff
                            && self.regs.iter().enumerate().all(|(i, &r)| r == first + i as u32)
                    })
            }
            _ => {
                let limits = format.register_limits();
                self.regs.len() == limits.len()
                    && self.regs.iter().zip(limits).all(|(&r, &limit)| r <= limit)
            }
        }
    }

    /// Appends the code units of the instruction to `out`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if a register, literal, index or branch offset does
    /// not fit the format.
    pub fn encode(&self, out: &mut Vec<u16>) -> Result<()> {
        if !self.registers_fit() {
            return Err(encoding_error!(
                "registers {:?} do not fit {} ({})",
                self.regs,
                self.opcode,
                self.opcode.format()
            ));
        }
        let op = self.opcode as u16;
        let r = |i: usize| self.regs.get(i).copied().unwrap_or(0);
        match self.opcode.format() {
            Format::F10x => out.push(op),
            Format::F12x => out.push(op | (r(0) as u16) << 8 | (r(1) as u16) << 12),
            Format::F11n => {
                let lit = self.literal_in(-8, 7)?;
                out.push(op | (r(0) as u16) << 8 | ((lit as u16) & 0xf) << 12);
            }
            Format::F11x => out.push(op | (r(0) as u16) << 8),
            Format::F10t => {
                let offset = self.branch_in(i64::from(i8::MIN), i64::from(i8::MAX), false)?;
                out.push(op | ((offset as u8) as u16) << 8);
            }
            Format::F20t => {
                let offset = self.branch_in(i64::from(i16::MIN), i64::from(i16::MAX), false)?;
                out.extend([op, offset as u16]);
            }
            Format::F30t => {
                let offset = self.branch_in(i64::from(i32::MIN), i64::from(i32::MAX), true)?;
                out.extend([op, offset as u16, (offset as u32 >> 16) as u16]);
            }
            Format::F22x => out.extend([op | (r(0) as u16) << 8, r(1) as u16]),
            Format::F21t => {
                let offset = self.branch_in(i64::from(i16::MIN), i64::from(i16::MAX), false)?;
                out.extend([op | (r(0) as u16) << 8, offset as u16]);
            }
            Format::F21s => {
                let lit = self.literal_in(i64::from(i16::MIN), i64::from(i16::MAX))?;
                out.extend([op | (r(0) as u16) << 8, lit as u16]);
            }
            Format::F21h => {
                let shift = if self.opcode == Opcode::ConstWideHigh16 { 48 } else { 16 };
                let Operand::Literal(lit) = self.operand else {
                    return Err(encoding_error!("{} needs a literal", self.opcode));
                };
                if lit & ((1i64 << shift) - 1) != 0
                    || (shift == 16 && i64::from(lit as i32) != lit)
                {
                    return Err(encoding_error!("{lit:#x} does not fit {}", self.opcode));
                }
                out.extend([op | (r(0) as u16) << 8, (lit >> shift) as u16]);
            }
            Format::F21c => {
                let index = self.index_in(0xffff)?;
                out.extend([op | (r(0) as u16) << 8, index as u16]);
            }
            Format::F23x => out.extend([
                op | (r(0) as u16) << 8,
                r(1) as u16 | (r(2) as u16) << 8,
            ]),
            Format::F22t => {
                let offset = self.branch_in(i64::from(i16::MIN), i64::from(i16::MAX), false)?;
                out.extend([op | (r(0) as u16) << 8 | (r(1) as u16) << 12, offset as u16]);
            }
            Format::F22c => {
                let index = self.index_in(0xffff)?;
                out.extend([op | (r(0) as u16) << 8 | (r(1) as u16) << 12, index as u16]);
            }
            Format::F32x => out.extend([op, r(0) as u16, r(1) as u16]),
            Format::F31i => {
                let lit = self.literal_in(i64::from(i32::MIN), i64::from(i32::MAX))?;
                out.extend([op | (r(0) as u16) << 8, lit as u16, (lit as u32 >> 16) as u16]);
            }
            Format::F31c => {
                let index = self.index_in(u32::MAX)?;
                out.extend([op | (r(0) as u16) << 8, index as u16, (index >> 16) as u16]);
            }
            Format::F35c => {
                let index = self.index_in(0xffff)?;
                let count = self.regs.len() as u16;
                out.extend([
                    op | (r(4) as u16) << 8 | count << 12,
                    index as u16,
                    r(0) as u16 | (r(1) as u16) << 4 | (r(2) as u16) << 8 | (r(3) as u16) << 12,
                ]);
            }
            Format::F3rc => {
                let index = self.index_in(0xffff)?;
                let count = self.regs.len() as u16;
                out.extend([op | count << 8, index as u16, r(0) as u16]);
            }
            Format::F51l => {
                let Operand::Literal(lit) = self.operand else {
                    return Err(encoding_error!("{} needs a literal", self.opcode));
                };
                let bits = lit as u64;
                out.push(op | (r(0) as u16) << 8);
                for shift in [0, 16, 32, 48] {
                    out.push((bits >> shift) as u16);
                }
            }
        }
        Ok(())
    }

    fn literal_in(&self, min: i64, max: i64) -> Result<i64> {
        match self.operand {
            Operand::Literal(lit) if (min..=max).contains(&lit) => Ok(lit),
            other => Err(encoding_error!("{other:?} does not fit {}", self.opcode)),
        }
    }

    fn index_in(&self, max: u32) -> Result<u32> {
        match self.operand {
            Operand::Index(index) if index <= max => Ok(index),
            other => Err(encoding_error!("{other:?} does not fit {}", self.opcode)),
        }
    }

    fn branch_in(&self, min: i64, max: i64, zero_ok: bool) -> Result<i32> {
        match self.operand {
            Operand::Branch(offset)
                if (min..=max).contains(&i64::from(offset)) && (zero_ok || offset != 0) =>
            {
                Ok(offset)
            }
            other => Err(encoding_error!("{other:?} does not fit {}", self.opcode)),
        }
    }
}

impl fmt::Display for DalvInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        let mut sep = " ";
        if self.opcode.is_invoke() {
            f.write_str(" {")?;
            for (i, reg) in self.regs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "v{reg}")?;
            }
            f.write_str("}")?;
            sep = ", ";
        } else {
            for reg in &self.regs {
                write!(f, "{sep}v{reg}")?;
                sep = ", ";
            }
        }
        match self.operand {
            Operand::None => Ok(()),
            Operand::Literal(lit) => write!(f, "{sep}#{lit}"),
            Operand::Index(index) => match self.opcode.index_kind() {
                Some(kind) => write!(f, "{sep}{kind}@{index}"),
                None => write!(f, "{sep}@{index}"),
            },
            Operand::Branch(offset) => write!(f, "{sep}{offset:+}"),
        }
    }
}

/// Decodes the instruction starting at `units[pos]`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for unknown opcodes or truncated instructions.
pub fn decode(units: &[u16], pos: usize) -> Result<DalvInsn> {
    let Some(&first) = units.get(pos) else {
        return Err(malformed_error!("instruction at {} past end of code", pos));
    };
    let Some(opcode) = Opcode::from_repr((first & 0xff) as u8) else {
        return Err(malformed_error!("unknown opcode {:#04x} at {}", first & 0xff, pos));
    };
    let format = opcode.format();
    let size = format.units() as usize;
    if pos + size > units.len() {
        return Err(malformed_error!("truncated {} at {}", opcode, pos));
    }
    let u = &units[pos..pos + size];
    let a = u32::from(first >> 8);
    let a4 = u32::from((first >> 8) & 0xf);
    let b4 = u32::from(first >> 12);
    let wide32 = |lo: u16, hi: u16| u32::from(lo) | (u32::from(hi) << 16);

    let insn = match format {
        Format::F10x => DalvInsn::new(opcode, vec![], Operand::None),
        Format::F12x => DalvInsn::new(opcode, vec![a4, b4], Operand::None),
        Format::F11n => {
            let lit = i64::from(((first >> 12) as i8) << 4 >> 4);
            DalvInsn::new(opcode, vec![a4], Operand::Literal(lit))
        }
        Format::F11x => DalvInsn::new(opcode, vec![a], Operand::None),
        Format::F10t => DalvInsn::new(opcode, vec![], Operand::Branch(i32::from(a as u8 as i8))),
        Format::F20t => DalvInsn::new(opcode, vec![], Operand::Branch(i32::from(u[1] as i16))),
        Format::F30t => DalvInsn::new(
            opcode,
            vec![],
            Operand::Branch(wide32(u[1], u[2]) as i32),
        ),
        Format::F22x => DalvInsn::new(opcode, vec![a, u32::from(u[1])], Operand::None),
        Format::F21t => DalvInsn::new(opcode, vec![a], Operand::Branch(i32::from(u[1] as i16))),
        Format::F21s => DalvInsn::new(opcode, vec![a], Operand::Literal(i64::from(u[1] as i16))),
        Format::F21h => {
            let lit = if opcode == Opcode::ConstWideHigh16 {
                i64::from(u[1] as i16) << 48
            } else {
                i64::from(i32::from(u[1] as i16) << 16)
            };
            DalvInsn::new(opcode, vec![a], Operand::Literal(lit))
        }
        Format::F21c => DalvInsn::new(opcode, vec![a], Operand::Index(u32::from(u[1]))),
        Format::F23x => DalvInsn::new(
            opcode,
            vec![a, u32::from(u[1] & 0xff), u32::from(u[1] >> 8)],
            Operand::None,
        ),
        Format::F22t => DalvInsn::new(
            opcode,
            vec![a4, b4],
            Operand::Branch(i32::from(u[1] as i16)),
        ),
        Format::F22c => DalvInsn::new(opcode, vec![a4, b4], Operand::Index(u32::from(u[1]))),
        Format::F32x => DalvInsn::new(
            opcode,
            vec![u32::from(u[1]), u32::from(u[2])],
            Operand::None,
        ),
        Format::F31i => DalvInsn::new(
            opcode,
            vec![a],
            Operand::Literal(i64::from(wide32(u[1], u[2]) as i32)),
        ),
        Format::F31c => DalvInsn::new(opcode, vec![a], Operand::Index(wide32(u[1], u[2]))),
        Format::F35c => {
            let count = (first >> 12) as usize;
            if count > 5 {
                return Err(malformed_error!("{} with {} arguments at {}", opcode, count, pos));
            }
            let nibbles = [
                u32::from(u[2] & 0xf),
                u32::from((u[2] >> 4) & 0xf),
                u32::from((u[2] >> 8) & 0xf),
                u32::from(u[2] >> 12),
                a4,
            ];
            DalvInsn::new(
                opcode,
                nibbles[..count].to_vec(),
                Operand::Index(u32::from(u[1])),
            )
        }
        Format::F3rc => {
            let first_reg = u32::from(u[2]);
            DalvInsn::new(
                opcode,
                (first_reg..first_reg + a).collect(),
                Operand::Index(u32::from(u[1])),
            )
        }
        Format::F51l => {
            let bits = (0..4).fold(0u64, |acc, i| acc | u64::from(u[1 + i]) << (16 * i));
            DalvInsn::new(opcode, vec![a], Operand::Literal(bits as i64))
        }
    };
    Ok(insn)
}

/// Decodes a whole instruction array into `(address, instruction)` pairs.
///
/// # Errors
/// Same as [`decode`].
pub fn decode_all(units: &[u16]) -> Result<Vec<(u32, DalvInsn)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < units.len() {
        let insn = decode(units, pos)?;
        let size = insn.units() as usize;
        out.push((pos as u32, insn));
        pos += size;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(insn: &DalvInsn) -> Vec<u16> {
        let mut out = Vec::new();
        insn.encode(&mut out).unwrap();
        out
    }

    #[test]
    fn test_known_encodings() {
        // const/4 v1, #-1  -> 0xf112
        let c4 = DalvInsn::new(Opcode::Const4, vec![1], Operand::Literal(-1));
        assert_eq!(encoded(&c4), vec![0xf112]);
        // add-int v0, v1, v2 -> 0x0090 0x0201
        let add = DalvInsn::new(Opcode::AddInt, vec![0, 1, 2], Operand::None);
        assert_eq!(encoded(&add), vec![0x0090, 0x0201]);
        // invoke-static {v1, v2}, method@3 -> 0x2071 0x0003 0x0021
        let call = DalvInsn::new(Opcode::InvokeStatic, vec![1, 2], Operand::Index(3));
        assert_eq!(encoded(&call), vec![0x2071, 0x0003, 0x0021]);
        // goto -2 -> 0xfe28
        let back = DalvInsn::new(Opcode::Goto, vec![], Operand::Branch(-2));
        assert_eq!(encoded(&back), vec![0xfe28]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let samples = [
            DalvInsn::new(Opcode::ConstHigh16, vec![3], Operand::Literal(0x4120_0000)),
            DalvInsn::new(Opcode::ConstWideHigh16, vec![4], Operand::Literal(0x4024 << 48)),
            DalvInsn::new(Opcode::ConstWide, vec![0], Operand::Literal(-0x1234_5678_9abc)),
            DalvInsn::new(Opcode::IfLe, vec![2, 3], Operand::Branch(-40)),
            DalvInsn::new(Opcode::InvokeVirtualRange, vec![20, 21, 22], Operand::Index(9)),
            DalvInsn::new(Opcode::MoveWide16, vec![300, 4], Operand::None),
            DalvInsn::new(Opcode::IputObject, vec![1, 15], Operand::Index(2)),
            DalvInsn::new(Opcode::Goto32, vec![], Operand::Branch(0)),
        ];
        let mut units = Vec::new();
        for insn in &samples {
            insn.encode(&mut units).unwrap();
        }
        let decoded: Vec<DalvInsn> = decode_all(&units).unwrap().into_iter().map(|(_, i)| i).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_rejects_unfit_operands() {
        let wide_reg = DalvInsn::new(Opcode::Move, vec![16, 0], Operand::None);
        assert!(wide_reg.encode(&mut Vec::new()).is_err());
        let zero_goto = DalvInsn::new(Opcode::Goto, vec![], Operand::Branch(0));
        assert!(zero_goto.encode(&mut Vec::new()).is_err());
        let gap = DalvInsn::new(Opcode::InvokeStaticRange, vec![1, 3], Operand::Index(0));
        assert!(!gap.registers_fit());
        let big = DalvInsn::new(Opcode::Const16, vec![0], Operand::Literal(40_000));
        assert!(big.encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_display() {
        let call = DalvInsn::new(Opcode::InvokeDirect, vec![0, 1], Operand::Index(4));
        assert_eq!(call.to_string(), "invoke-direct {v0, v1}, method@4");
        let branch = DalvInsn::new(Opcode::IfEqz, vec![2], Operand::Branch(6));
        assert_eq!(branch.to_string(), "if-eqz v2, +6");
    }
}
