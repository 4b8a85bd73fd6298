//! Modified UTF-8 as used by the string data section.
//!
//! Strings are encoded per UTF-16 code unit: `U+0000` takes two bytes (`C0 80`) so that the
//! encoded form never contains a NUL, and supplementary characters are written as two
//! separately encoded surrogates (three bytes each) instead of one four-byte sequence.

use crate::Result;

/// Encodes `value` as MUTF-8, without the trailing NUL.
#[must_use]
pub fn encode(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push((0xc0 | ((unit >> 6) & 0x1f)) as u8);
                out.push((0x80 | (unit & 0x3f)) as u8);
            }
            _ => {
                out.push((0xe0 | ((unit >> 12) & 0x0f)) as u8);
                out.push((0x80 | ((unit >> 6) & 0x3f)) as u8);
                out.push((0x80 | (unit & 0x3f)) as u8);
            }
        }
    }
    out
}

/// Number of UTF-16 code units in `value`; this is the length prefix of a string data item.
#[must_use]
pub fn utf16_len(value: &str) -> usize {
    value.encode_utf16().count()
}

/// Decodes MUTF-8 bytes (without the trailing NUL).
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for truncated sequences, invalid lead bytes or
/// unpaired surrogates.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = u16::from(bytes[i]);
        let unit = if b0 & 0x80 == 0 {
            i += 1;
            b0
        } else if b0 & 0xe0 == 0xc0 {
            let b1 = continuation(bytes, i + 1)?;
            i += 2;
            ((b0 & 0x1f) << 6) | b1
        } else if b0 & 0xf0 == 0xe0 {
            let b1 = continuation(bytes, i + 1)?;
            let b2 = continuation(bytes, i + 2)?;
            i += 3;
            ((b0 & 0x0f) << 12) | (b1 << 6) | b2
        } else {
            return Err(malformed_error!("Invalid MUTF-8 lead byte {:#x} at {}", b0, i));
        };
        units.push(unit);
    }
    String::from_utf16(&units).map_err(|e| malformed_error!("Invalid UTF-16 in string: {}", e))
}

fn continuation(bytes: &[u8], index: usize) -> Result<u16> {
    match bytes.get(index) {
        Some(&b) if b & 0xc0 == 0x80 => Ok(u16::from(b & 0x3f)),
        _ => Err(malformed_error!("Truncated MUTF-8 sequence at {}", index)),
    }
}

/// Orders two strings by their UTF-16 code units, which is the order the string table must
/// be sorted in.
#[must_use]
pub fn cmp_utf16(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutf8_nul_and_supplementary() {
        let s = "a\u{0}\u{e9}\u{1F600}";
        let encoded = encode(s);
        assert_eq!(&encoded[..3], &[b'a', 0xc0, 0x80]);
        assert!(!encoded.contains(&0));
        // Surrogate pair takes 2 x 3 bytes.
        assert_eq!(encoded.len(), 1 + 2 + 2 + 6);
        assert_eq!(decode(&encoded).unwrap(), s);
        assert_eq!(utf16_len(s), 5);
    }

    #[test]
    fn test_mutf8_rejects_truncation() {
        assert!(decode(&[0xe0, 0x80]).is_err());
        assert!(decode(&[0xf8]).is_err());
    }

    #[test]
    fn test_utf16_ordering_differs_from_utf8() {
        // Surrogates (D800..DFFF) sort below U+FFFD as UTF-16 units.
        let bmp = "\u{FFFD}";
        let astral = "\u{10000}";
        assert_eq!(bmp.cmp(astral), std::cmp::Ordering::Less);
        assert_eq!(cmp_utf16(bmp, astral), std::cmp::Ordering::Greater);
    }
}
