//! Shared data structures and algorithms used across the compiler pipeline.

pub mod bitset;
pub mod graph;

pub use bitset::BitSet;

use sha1::{Digest, Sha1};

/// Lower-case hexadecimal SHA-1 of `data`.
///
/// Used to derive stable names for generated classes and cache files from a member's
/// canonical signature.
#[must_use]
pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Adler-32 checksum as used by the container header.
#[must_use]
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // Largest n such that 255n(n+1)/2 + (n+1)(MOD-1) fits in u32.
    const NMAX: usize = 5552;

    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
