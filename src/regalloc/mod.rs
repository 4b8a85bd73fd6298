//! Register allocation over SSA values.
//!
//! Allocation runs in three steps, each in its own module:
//!
//! 1. [`liveness`] computes live-in and live-out sets per block, with phi operands treated
//!    as live out of their predecessor;
//! 2. [`interference`] builds the symmetric interference relation from those sets;
//! 3. [`allocator`] groups non-interfering values and assigns register ranges, pinning
//!    parameters to their argument words.
//!
//! Parameters are allocated at the bottom of the frame (`0..param_words`). The calling
//! convention wants them at the top; [`crate::backend`] renumbers the frame once phis are
//! gone, so interference is always reasoned about in the numbering used here.
//!
//! # Examples
//!
//! ```rust,ignore
//! use dexhook::{cfg, regalloc, ssa};
//!
//! let method = ssa::build(cfg::build(&code)?)?;
//! let allocation = regalloc::allocate(&method)?;
//! println!("{} registers", allocation.reg_count);
//! ```

pub mod allocator;
pub mod interference;
pub mod liveness;

pub use allocator::Allocation;
pub use interference::InterferenceGraph;
pub use liveness::Liveness;

use crate::{ssa::SsaMethod, Result};

/// Computes liveness and interference for `method` and assigns registers.
///
/// # Errors
/// Returns [`crate::Error::AllocationInvariant`] if the assignment is inconsistent with the
/// interference graph.
pub fn allocate(method: &SsaMethod) -> Result<Allocation> {
    let live = liveness::compute(method);
    let graph = interference::build(method, &live);
    allocator::allocate(method, &graph)
}
