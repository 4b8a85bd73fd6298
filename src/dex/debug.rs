//! Debug info items: the line number table of a code item.
//!
//! Only positions are recorded. Parameter names are written as absent and no local variable
//! ranges are emitted; the reader skips them if present.

use crate::{
    file::{ByteSink, Parser},
    Result,
};

const DBG_END_SEQUENCE: u8 = 0x00;
const DBG_ADVANCE_PC: u8 = 0x01;
const DBG_ADVANCE_LINE: u8 = 0x02;
const DBG_START_LOCAL: u8 = 0x03;
const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
const DBG_END_LOCAL: u8 = 0x05;
const DBG_RESTART_LOCAL: u8 = 0x06;
const DBG_SET_PROLOGUE_END: u8 = 0x07;
const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
const DBG_SET_FILE: u8 = 0x09;
const DBG_FIRST_SPECIAL: u8 = 0x0a;
const DBG_LINE_BASE: i64 = -4;
const DBG_LINE_RANGE: i64 = 15;

/// Line number table of one method.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DebugInfo {
    /// Initial value of the line register.
    pub line_start: u32,
    /// Number of parameter name entries (all absent).
    pub param_count: u32,
    /// `(address, line)` pairs in address order.
    pub positions: Vec<(u32, u32)>,
}

impl DebugInfo {
    /// Builds the table for a list of positions; `None` if there are none.
    #[must_use]
    pub fn from_positions(param_count: u32, positions: Vec<(u32, u32)>) -> Option<Self> {
        let line_start = positions.first()?.1;
        Some(DebugInfo {
            line_start,
            param_count,
            positions,
        })
    }

    /// Appends the encoded item to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_uleb128(self.line_start);
        out.write_uleb128(self.param_count);
        for _ in 0..self.param_count {
            out.write_uleb128p1(None);
        }

        let (mut address, mut line) = (0u32, i64::from(self.line_start));
        for &(addr, next_line) in &self.positions {
            let mut addr_diff = i64::from(addr.saturating_sub(address));
            let mut line_diff = i64::from(next_line) - line;
            if !(DBG_LINE_BASE..DBG_LINE_BASE + DBG_LINE_RANGE).contains(&line_diff) {
                out.push(DBG_ADVANCE_LINE);
                out.write_sleb128(line_diff as i32);
                line_diff = 0;
            }
            let special = |addr_diff: i64| {
                (line_diff - DBG_LINE_BASE) + DBG_LINE_RANGE * addr_diff
                    + i64::from(DBG_FIRST_SPECIAL)
            };
            if special(addr_diff) > 0xff {
                out.push(DBG_ADVANCE_PC);
                out.write_uleb128(addr_diff as u32);
                addr_diff = 0;
            }
            out.push(special(addr_diff) as u8);
            address = addr;
            line = i64::from(next_line);
        }
        out.push(DBG_END_SEQUENCE);
    }

    /// Decodes an item starting at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] for damaged input.
    pub fn decode(parser: &mut Parser<'_>) -> Result<Self> {
        let line_start = parser.read_uleb128()?;
        let param_count = parser.read_uleb128()?;
        for _ in 0..param_count {
            parser.read_uleb128p1()?;
        }

        let mut positions = Vec::new();
        let (mut address, mut line) = (0u32, i64::from(line_start));
        loop {
            let opcode = parser.read_le::<u8>()?;
            match opcode {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => address += parser.read_uleb128()?,
                DBG_ADVANCE_LINE => line += i64::from(parser.read_sleb128()?),
                DBG_START_LOCAL => {
                    parser.read_uleb128()?;
                    parser.read_uleb128p1()?;
                    parser.read_uleb128p1()?;
                }
                DBG_START_LOCAL_EXTENDED => {
                    parser.read_uleb128()?;
                    parser.read_uleb128p1()?;
                    parser.read_uleb128p1()?;
                    parser.read_uleb128p1()?;
                }
                DBG_END_LOCAL | DBG_RESTART_LOCAL => {
                    parser.read_uleb128()?;
                }
                DBG_SET_PROLOGUE_END | DBG_SET_EPILOGUE_BEGIN => {}
                DBG_SET_FILE => {
                    parser.read_uleb128p1()?;
                }
                special => {
                    let adjusted = i64::from(special - DBG_FIRST_SPECIAL);
                    line += DBG_LINE_BASE + adjusted % DBG_LINE_RANGE;
                    address += (adjusted / DBG_LINE_RANGE) as u32;
                    let line = u32::try_from(line)
                        .map_err(|_| malformed_error!("negative line {} in debug info", line))?;
                    positions.push((address, line));
                }
            }
        }
        Ok(DebugInfo {
            line_start,
            param_count,
            positions,
        })
    }
}
