//! Cursor-based reader over a binary unit.
//!
//! The [`Parser`] keeps a position within a borrowed byte slice and offers the primitive
//! reads the container decoder needs: fixed-width little-endian integers, the three LEB128
//! flavours, and NUL-terminated MUTF-8 strings. Every read is bounds-checked and reports
//! [`crate::Error::OutOfBounds`] rather than panicking.

use crate::{
    file::{io::read_le_at, mutf8, DexIO},
    Error::OutOfBounds,
    Result,
};

/// A position within a byte slice.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Creates a parser positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Creates a parser positioned at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` is past the end of `data`.
    pub fn at(data: &'a [u8], offset: usize) -> Result<Self> {
        let mut parser = Parser::new(data);
        parser.seek(offset)?;
        Ok(parser)
    }

    /// Length of the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Moves to an absolute position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }
        self.position = pos;
        Ok(())
    }

    /// Advances to the next multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the padding runs past the end.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.seek(self.position + padding)
    }

    /// Reads a fixed-width little-endian value.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value runs past the end.
    pub fn read_le<T: DexIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the bytes run past the end.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(len).ok_or(OutOfBounds)?;
        if end > self.data.len() {
            return Err(OutOfBounds);
        }
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Reads an unsigned LEB128 value of at most five bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation or [`crate::Error::Malformed`] if
    /// the encoding is longer than five bytes.
    pub fn read_uleb128(&mut self) -> Result<u32> {
        let mut result = 0u32;
        for i in 0..5 {
            let byte = self.read_le::<u8>()?;
            result |= u32::from(byte & 0x7f) << (i * 7);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(malformed_error!("uleb128 longer than 5 bytes at {}", self.position))
    }

    /// Reads a signed LEB128 value of at most five bytes.
    ///
    /// # Errors
    /// Same as [`Parser::read_uleb128`].
    pub fn read_sleb128(&mut self) -> Result<i32> {
        let mut result = 0i32;
        let mut shift = 0;
        for _ in 0..5 {
            let byte = self.read_le::<u8>()?;
            result |= i32::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && byte & 0x40 != 0 {
                    result |= -1i32 << shift;
                }
                return Ok(result);
            }
        }
        Err(malformed_error!("sleb128 longer than 5 bytes at {}", self.position))
    }

    /// Reads an unsigned LEB128 value biased by one; `0` decodes to `None`.
    ///
    /// # Errors
    /// Same as [`Parser::read_uleb128`].
    pub fn read_uleb128p1(&mut self) -> Result<Option<u32>> {
        Ok(self.read_uleb128()?.checked_sub(1))
    }

    /// Reads a NUL-terminated MUTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no terminator is found, or
    /// [`crate::Error::Malformed`] for invalid MUTF-8.
    pub fn read_mutf8(&mut self) -> Result<String> {
        let rest = &self.data[self.position..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(OutOfBounds);
        };
        let value = mutf8::decode(&rest[..nul])?;
        self.position += nul + 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_leb128() {
        let data = [0x80, 0x01, 0x7f, 0x80, 0x7f, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_uleb128().unwrap(), 128);
        assert_eq!(parser.read_sleb128().unwrap(), -1);
        assert_eq!(parser.read_sleb128().unwrap(), -128);
        assert_eq!(parser.read_uleb128p1().unwrap(), None);
        assert!(parser.read_uleb128().is_err());
    }

    #[test]
    fn test_parser_overlong_uleb128() {
        let data = [0xff; 6];
        let mut parser = Parser::new(&data);
        assert!(matches!(
            parser.read_uleb128(),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_parser_mutf8_and_align() {
        let data = [b'h', b'i', 0x00, 0xff, 0x01, 0x00, 0x00, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_mutf8().unwrap(), "hi");
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        assert_eq!(parser.read_le::<u32>().unwrap(), 1);
    }
}
