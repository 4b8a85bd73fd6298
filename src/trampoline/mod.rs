//! Trampoline synthesis: the public entry points of the crate.
//!
//! A [`TrampolineCompiler`] turns a [`MemberDescriptor`] into a [`BinaryUnit`] holding one
//! generated class (see [`generator`] for its shape). Units are cached by the content hash of
//! the member's canonical signature, in memory and optionally on disk, and each member is
//! synthesized at most once at a time.
//!
//! The unit does not depend on the callbacks: the generated `hook` body reads a snapshot of the
//! callback set from the hook record on every call, so callbacks may be added and removed after
//! synthesis without regenerating anything.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dexhook::{dispatch::CallbackChain, prelude::*};
//!
//! let compiler = TrampolineCompiler::new(
//!     TrampolineConfig::default().with_cache_dir("/data/local/tmp/hooks"),
//! )?;
//! let member = MemberDescriptor::parse("Landroid/app/Activity;->onResume()V")?;
//! let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
//! let unit = compiler.synthesize(&member, &chain)?;
//! assert!(unit.class_name().starts_with("LDexHooker_"));
//! # Ok::<(), dexhook::Error>(())
//! ```

pub mod bindings;
pub mod boxing;
pub mod cache;
pub mod compiler;
pub mod generator;
pub mod redirect;
pub mod scope;

pub use bindings::HostBindings;
pub use cache::UnitCache;
pub use compiler::TrampolineCompiler;
pub use generator::Layout;
pub use redirect::{CallRedirector, HookEntry};
pub use scope::{AllowAll, ScopeList, ScopePolicy};

pub use crate::ssa::optimize::OptimizerConfig;

use std::{fmt, path::PathBuf, sync::Arc};

use crate::types::MemberDescriptor;

/// Default name prefix of generated classes.
pub const DEFAULT_CLASS_PREFIX: &str = "DexHooker";

/// Settings of a [`TrampolineCompiler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrampolineConfig {
    /// Binary name prefix of generated classes; the class is `<prefix>_<hash>`.
    pub class_prefix: String,
    /// Directory persisting generated units; `None` keeps them in memory only.
    pub cache_dir: Option<PathBuf>,
    /// SSA passes applied to every generated method.
    pub optimizer: OptimizerConfig,
    /// Emit the `backup` body that retries the original reflectively instead of the
    /// reporting placeholder.
    pub retry_backup: bool,
    /// Emit a host trace call at `hook` entry.
    pub trace_invocations: bool,
    /// The host bridge classes the generated code calls into.
    pub bindings: HostBindings,
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        TrampolineConfig {
            class_prefix: DEFAULT_CLASS_PREFIX.to_string(),
            cache_dir: None,
            optimizer: OptimizerConfig::default(),
            retry_backup: false,
            trace_invocations: false,
            bindings: HostBindings::default(),
        }
    }
}

impl TrampolineConfig {
    /// Sets the class name prefix.
    #[must_use]
    pub fn with_class_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.class_prefix = prefix.into();
        self
    }

    /// Persists units below `dir`.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the optimizer passes.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Selects the retrying `backup` body.
    #[must_use]
    pub fn with_retry_backup(mut self, enabled: bool) -> Self {
        self.retry_backup = enabled;
        self
    }

    /// Enables the trace call at `hook` entry.
    #[must_use]
    pub fn with_trace_invocations(mut self, enabled: bool) -> Self {
        self.trace_invocations = enabled;
        self
    }

    /// Replaces the host bindings.
    #[must_use]
    pub fn with_bindings(mut self, bindings: HostBindings) -> Self {
        self.bindings = bindings;
        self
    }
}

/// A synthesized trampoline: one encoded DEX file holding the generated class.
#[derive(Clone, PartialEq, Eq)]
pub struct BinaryUnit {
    member: MemberDescriptor,
    class_name: String,
    bytes: Arc<[u8]>,
    from_cache: bool,
}

impl fmt::Debug for BinaryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryUnit")
            .field("member", &self.member.canonical())
            .field("class_name", &self.class_name)
            .field("len", &self.bytes.len())
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

impl BinaryUnit {
    pub(crate) fn new(
        member: MemberDescriptor,
        class_name: String,
        bytes: impl Into<Arc<[u8]>>,
        from_cache: bool,
    ) -> Self {
        BinaryUnit {
            member,
            class_name,
            bytes: bytes.into(),
            from_cache,
        }
    }

    /// The hooked member.
    #[must_use]
    pub fn member(&self) -> &MemberDescriptor {
        &self.member
    }

    /// Descriptor of the generated class, e.g. `LDexHooker_3f2a…;`.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The encoded DEX file.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns `true` if the unit was served from the cache instead of being compiled.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub(crate) fn cached(&self) -> Self {
        BinaryUnit {
            from_cache: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = TrampolineConfig::default()
            .with_class_prefix("Hk")
            .with_cache_dir("/tmp/units")
            .with_optimizer(OptimizerConfig::disabled())
            .with_retry_backup(true)
            .with_trace_invocations(true);
        assert_eq!(config.class_prefix, "Hk");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/units")));
        assert!(!config.optimizer.any_enabled());
        assert!(config.retry_backup && config.trace_invocations);
        assert_eq!(config.bindings, HostBindings::default());
    }
}
