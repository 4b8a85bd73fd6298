//! Back-conversion from SSA to register form.
//!
//! [`lower`] turns an allocated [`SsaMethod`] into a [`RopMethod`] over physical registers:
//! phis are replaced by ordered moves on their incoming edges ([`phi`], [`moves`]), then the
//! block graph is tidied and the parameters are moved to the top of the frame ([`cleanup`]).
//! The result is what [`crate::dex::code`] lays out and encodes.

pub mod cleanup;
pub mod moves;
pub mod phi;

use crate::{ir::RopMethod, regalloc::Allocation, ssa::SsaMethod, Result};

/// Eliminates phis and cleans up the block graph of an allocated method.
///
/// # Errors
/// Returns [`crate::Error::AllocationInvariant`] if the allocation does not cover the method.
pub fn lower(method: &SsaMethod, allocation: &Allocation) -> Result<RopMethod> {
    let mut rop = phi::eliminate(method, allocation)?;
    cleanup::run(&mut rop);
    Ok(rop)
}
