//! Optimization passes over SSA form.
//!
//! Each pass implements [`SsaPass`] and reports whether it changed the method. [`optimize`]
//! runs the passes enabled in an [`OptimizerConfig`] in a fixed order and repeats the round
//! until nothing changes:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ SCCP + fold  │──►│ copy propagation │──►│ dead code     │──┐
//! └──────────────┘   └──────────────────┘   └───────────────┘  │
//!        ▲                                                      │
//!        └──────────────────── until stable ────────────────────┘
//! ```
//!
//! Every pass preserves the observable behaviour of the method, including which instructions
//! may throw: an integer division by a constant zero is never folded, and instructions that
//! may throw are never removed even when their result is unused.

mod copy;
mod dce;
mod sccp;

pub use copy::CopyPropagationPass;
pub use dce::DeadCodeEliminationPass;
pub use sccp::ConstantPropagationPass;

use log::debug;

use crate::{ssa::SsaMethod, Result};

/// Upper bound on optimizer rounds; each round strictly shrinks or simplifies the method, so
/// this is only reached on pathological input.
const MAX_ROUNDS: usize = 16;

/// Interface of an SSA optimization pass.
pub trait SsaPass: Send + Sync {
    /// Unique name for logging.
    fn name(&self) -> &'static str;

    /// Runs the pass on one method.
    ///
    /// Returns `true` if any change was made.
    ///
    /// # Errors
    /// Returns an error if the method is left in an inconsistent state.
    fn run_on_method(&self, method: &mut SsaMethod) -> Result<bool>;
}

/// Which optimizer passes run.
///
/// Turning every pass off yields a direct, unoptimized translation; the generated code then
/// behaves identically, only larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Sparse conditional constant propagation, with branch folding and unreachable block
    /// removal.
    pub constant_propagation: bool,
    /// Replace uses of copies and trivial phis by their sources.
    pub copy_propagation: bool,
    /// Remove unused side-effect-free instructions and phis.
    pub dead_code_elimination: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            constant_propagation: true,
            copy_propagation: true,
            dead_code_elimination: true,
        }
    }
}

impl OptimizerConfig {
    /// Configuration with every pass disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            constant_propagation: false,
            copy_propagation: false,
            dead_code_elimination: false,
        }
    }

    /// Returns `true` if at least one pass is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.constant_propagation || self.copy_propagation || self.dead_code_elimination
    }

    fn passes(&self) -> Vec<Box<dyn SsaPass>> {
        let mut passes: Vec<Box<dyn SsaPass>> = Vec::new();
        if self.constant_propagation {
            passes.push(Box::new(ConstantPropagationPass));
        }
        if self.copy_propagation {
            passes.push(Box::new(CopyPropagationPass));
        }
        if self.dead_code_elimination {
            passes.push(Box::new(DeadCodeEliminationPass));
        }
        passes
    }
}

/// Runs the enabled passes on `method` until it stops changing.
///
/// # Errors
/// Propagates pass failures.
pub fn optimize(method: &mut SsaMethod, config: &OptimizerConfig) -> Result<()> {
    let passes = config.passes();
    if passes.is_empty() {
        return Ok(());
    }
    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        for pass in &passes {
            if pass.run_on_method(method)? {
                debug!("{}: {} changed the method (round {})", method.name, pass.name(), round);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(())
}
