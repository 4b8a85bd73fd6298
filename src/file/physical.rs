//! Memory-mapped access to binary units persisted on disk.

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{Error::FileError, Result};

/// A read-only memory map of a file.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Maps the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;
        // SAFETY: unit files are written once via rename and never truncated in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FileError)?;
        Ok(Physical { data: mmap })
    }

    /// The mapped bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copies the mapped bytes into an owned buffer.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data.to_vec()
    }
}
