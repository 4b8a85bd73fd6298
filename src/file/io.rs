//! Little-endian primitives and LEB128 variable-length integers.
//!
//! The container format stores every fixed-width field little-endian and every
//! variable-length count or offset as (signed or unsigned) LEB128. Reading goes through
//! [`read_le_at`] and the [`crate::file::Parser`]; writing goes through the [`ByteSink`]
//! extension trait implemented for `Vec<u8>`.

use crate::{Error::OutOfBounds, Result};

/// Fixed-width integer types that can be read from and written to the container.
pub trait DexIO: Sized + Copy {
    /// Byte array representation of the type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]> + AsRef<[u8]>;

    /// Decode from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Encode to little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_dex_io {
    ($($ty:ty => $n:expr),* $(,)?) => {
        $(
            impl DexIO for $ty {
                type Bytes = [u8; $n];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_dex_io!(u8 => 1, i8 => 1, u16 => 2, i16 => 2, u32 => 4, i32 => 4, u64 => 8, i64 => 8);

/// Reads a `T` at `*offset` and advances the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: DexIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let len = std::mem::size_of::<T>();
    let end = offset.checked_add(len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }
    let Ok(bytes) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(OutOfBounds);
    };
    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Overwrites a `T` at `offset` inside an already sized buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: DexIO>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }
    data[offset..end].copy_from_slice(bytes);
    Ok(())
}

/// Number of bytes `value` occupies as unsigned LEB128.
#[must_use]
pub fn uleb128_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append-only little-endian output.
pub trait ByteSink {
    /// Appends a fixed-width little-endian value.
    fn write_le<T: DexIO>(&mut self, value: T);
    /// Appends an unsigned LEB128 value.
    fn write_uleb128(&mut self, value: u32);
    /// Appends a signed LEB128 value.
    fn write_sleb128(&mut self, value: i32);
    /// Appends `value + 1` as unsigned LEB128, so that `None` encodes as `0`.
    fn write_uleb128p1(&mut self, value: Option<u32>);
    /// Pads with zero bytes up to a multiple of `alignment`.
    fn align_to(&mut self, alignment: usize);
}

impl ByteSink for Vec<u8> {
    fn write_le<T: DexIO>(&mut self, value: T) {
        self.extend_from_slice(value.to_le_bytes().as_ref());
    }

    fn write_uleb128(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.push(byte);
                return;
            }
            self.push(byte | 0x80);
        }
    }

    fn write_sleb128(&mut self, mut value: i32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.push(byte);
                return;
            }
            self.push(byte | 0x80);
        }
    }

    fn write_uleb128p1(&mut self, value: Option<u32>) {
        self.write_uleb128(value.map_or(0, |v| v.wrapping_add(1)));
    }

    fn align_to(&mut self, alignment: usize) {
        while self.len() % alignment != 0 {
            self.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uleb128_encoding() {
        let mut out = Vec::new();
        out.write_uleb128(0);
        out.write_uleb128(127);
        out.write_uleb128(128);
        out.write_uleb128(0x3fff);
        assert_eq!(out, vec![0x00, 0x7f, 0x80, 0x01, 0xff, 0x7f]);
        assert_eq!(uleb128_len(128), 2);
        assert_eq!(uleb128_len(u32::MAX), 5);
    }

    #[test]
    fn test_sleb128_encoding() {
        let mut out = Vec::new();
        out.write_sleb128(0);
        out.write_sleb128(-1);
        out.write_sleb128(63);
        out.write_sleb128(64);
        out.write_sleb128(-128);
        assert_eq!(out, vec![0x00, 0x7f, 0x3f, 0xc0, 0x00, 0x80, 0x7f]);
    }

    #[test]
    fn test_write_le_at_bounds() {
        let mut buf = [0u8; 4];
        write_le_at(&mut buf, 0, 0x1234_5678u32).unwrap();
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        assert!(write_le_at(&mut buf, 2, 0u32).is_err());

        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&buf, &mut offset).unwrap(), 0x5678);
        assert_eq!(offset, 2);
    }
}
