//! The synthesis entry points.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{debug, info};

use crate::{
    codegen,
    dispatch::CallbackChain,
    trampoline::{
        generator::{self, Layout},
        BinaryUnit, CallRedirector, HookEntry, ScopePolicy, TrampolineConfig, UnitCache,
    },
    types::MemberDescriptor,
    Error, Result,
};

/// Compiles, caches and installs trampolines.
///
/// `TrampolineCompiler` is `Sync`; share it between threads behind an `Arc`. Requests for the
/// same member serialize on a per-member lock and the second one is served from the cache;
/// requests for different members never wait on each other.
#[derive(Debug)]
pub struct TrampolineCompiler {
    config: TrampolineConfig,
    cache: UnitCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TrampolineCompiler {
    /// Creates a compiler.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] if the class prefix is not a valid simple class name.
    pub fn new(config: TrampolineConfig) -> Result<Self> {
        let prefix = &config.class_prefix;
        if prefix.is_empty() || prefix.contains(['/', ';', '[', '.', '(', ')', '<', '>']) {
            return Err(Error::Declaration {
                member: prefix.clone(),
                reason: "class prefix must be a simple class name".to_string(),
            });
        }
        Ok(TrampolineCompiler {
            cache: UnitCache::new(config.cache_dir.clone()),
            config,
            locks: DashMap::new(),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &TrampolineConfig {
        &self.config
    }

    /// The unit cache.
    #[must_use]
    pub fn cache(&self) -> &UnitCache {
        &self.cache
    }

    /// Layout of the trampoline class for `member`.
    #[must_use]
    pub fn layout(&self, member: &MemberDescriptor) -> Layout {
        Layout::new(member, &self.config.class_prefix, &self.config.bindings)
    }

    /// Produces the trampoline unit for `member`.
    ///
    /// The unit is taken from the cache when possible. Otherwise the class is generated,
    /// compiled and encoded while holding the member's lock, then cached. The callback chain
    /// is only read for diagnostics; the generated code snapshots the live callback set on
    /// every call.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] for members that cannot be hooked, [`Error::LockError`]
    /// if a previous synthesis of the member panicked, and any compiler error.
    pub fn synthesize<V, E>(
        &self,
        member: &MemberDescriptor,
        chain: &CallbackChain<V, E>,
    ) -> Result<BinaryUnit> {
        member.validate()?;
        let layout = self.layout(member);
        if let Some(unit) = self.cache.get(member, &layout.class) {
            debug!("cache hit for {member}");
            return Ok(unit);
        }

        let key = member.content_hash();
        let lock = Arc::clone(
            self.locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock
            .lock()
            .map_err(|_| Error::LockError(format!("synthesis lock of {member} poisoned")))?;

        if let Some(unit) = self.cache.get(member, &layout.class) {
            debug!("cache hit for {member} after waiting");
            return Ok(unit);
        }

        let unit = generator::generate(member, &self.config)?;
        let bytes = codegen::encode(unit, &self.config.optimizer)?;
        debug!(
            "synthesized {} for {member} ({} bytes, {} callbacks registered)",
            layout.class,
            bytes.len(),
            chain.len()
        );
        let unit = BinaryUnit::new(
            member.clone(),
            layout.class.descriptor().to_string(),
            bytes,
            false,
        );
        self.cache.insert(&unit);
        Ok(unit)
    }

    /// Forgets the unit of `member` in memory and on disk. Returns `true` if one was cached.
    ///
    /// The member's lock is dropped only when no synthesis holds it, so a request arriving
    /// during an in-flight synthesis still waits on the same lock.
    pub fn invalidate(&self, member: &MemberDescriptor) -> bool {
        let removed = self.cache.remove(member);
        self.locks
            .remove_if(&member.content_hash(), |_, lock| Arc::strong_count(lock) == 1);
        if removed {
            debug!("invalidated {member}");
        }
        removed
    }

    /// Hands `unit` to `redirector` for installation.
    ///
    /// # Errors
    /// Propagates the redirector's error.
    pub fn install(&self, unit: &BinaryUnit, redirector: &dyn CallRedirector) -> Result<()> {
        let entry = HookEntry::from(&self.layout(unit.member()));
        redirector.redirect(unit.member(), &entry, unit)?;
        info!("installed {} for {}", entry.class, unit.member());
        Ok(())
    }

    /// Synthesizes and installs the trampoline of `member` if `scope` allows it for `caller`.
    /// Returns the installed unit, or `None` if the member is out of scope.
    ///
    /// # Errors
    /// See [`TrampolineCompiler::synthesize`] and [`TrampolineCompiler::install`].
    pub fn hook<V, E>(
        &self,
        member: &MemberDescriptor,
        chain: &CallbackChain<V, E>,
        caller: &str,
        scope: &dyn ScopePolicy,
        redirector: &dyn CallRedirector,
    ) -> Result<Option<BinaryUnit>> {
        if !scope.should_hook(member, caller) {
            debug!("{member} is out of scope for {caller}");
            return Ok(None);
        }
        let unit = self.synthesize(member, chain)?;
        self.install(&unit, redirector)?;
        Ok(Some(unit))
    }
}
