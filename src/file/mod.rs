//! Byte-level input and output for binary units.
//!
//! - [`io`] - fixed-width little-endian values, LEB128, and the [`io::ByteSink`] writer
//! - [`parser`] - bounds-checked cursor used by the unit decoder
//! - [`mutf8`] - the modified UTF-8 string encoding
//! - [`physical`] - memory-mapped files for cached units

pub mod io;
pub mod mutf8;
pub mod parser;
pub mod physical;

pub use io::{ByteSink, DexIO};
pub use parser::Parser;
pub use physical::Physical;
