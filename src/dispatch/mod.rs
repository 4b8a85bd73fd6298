//! Callback chains and the before/after dispatch protocol.
//!
//! A hooked call runs through a fixed sequence of phases:
//!
//! ```text
//! DISABLED ─► RUN_BEFORE ─► MAYBE_SKIP_ORIGINAL ─► RUN_ORIGINAL_OR_SKIP ─► RUN_AFTER ─► RETURN_OR_THROW
//! ```
//!
//! [`invoke`] implements this sequence over plain Rust values. The `hook` method of a
//! generated trampoline implements the same sequence in bytecode against the host bridge
//! classes, and the two are tested against each other through the [`crate::vm`] interpreter.
//!
//! # Key Components
//!
//! - [`Outcome`] - the result of a call: a value or a thrown error
//! - [`Callback`] - user interception logic with `before` and `after` entry points
//! - [`CallbackChain`] - an ordered, concurrently editable set of callbacks
//! - [`BeforeContext`] / [`AfterContext`] - what a callback may see and change
//! - [`KillSwitch`] - the process-wide switch that bypasses every callback
//!
//! # Semantics
//!
//! - Before-callbacks run in registration order. The first callback that returns early
//!   (with a value or an error) stops the remaining before-callbacks.
//! - A before-callback that fails is logged. The pending result becomes the default value
//!   and the original call is skipped, but the remaining before-callbacks still run.
//! - After-callbacks of every callback in the snapshot run in reverse registration order,
//!   whether or not the original was called.
//! - A failing after-callback is logged and the outcome it saw is restored.
//!
//! Every invocation works on one snapshot of the chain taken at entry, so concurrent
//! registration or removal never affects a call in flight.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dexhook::dispatch::{invoke, Call, Callback, CallbackChain, BeforeContext, KillSwitch, Outcome};
//! use dexhook::MemberDescriptor;
//! use std::sync::Arc;
//!
//! struct Fixed;
//!
//! impl Callback<i64, String> for Fixed {
//!     fn before(&self, call: &mut BeforeContext<'_, i64, String>) -> Result<(), String> {
//!         call.return_early(42);
//!         Ok(())
//!     }
//! }
//!
//! let member = MemberDescriptor::parse("static La/B;->f()J")?;
//! let chain = CallbackChain::new();
//! chain.add(Arc::new(Fixed));
//! let outcome = invoke(&chain, &KillSwitch::new(), Call::new(&member, None, vec![]), |_, _| {
//!     Outcome::Value(0)
//! });
//! assert_eq!(outcome, Outcome::Value(42));
//! # Ok::<(), dexhook::Error>(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use log::warn;

use crate::types::MemberDescriptor;

/// The result of a call: a returned value or a thrown error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<V, E> {
    /// Normal completion.
    Value(V),
    /// Exceptional completion.
    Thrown(E),
}

impl<V, E> Outcome<V, E> {
    /// Returns `true` for [`Outcome::Thrown`].
    #[must_use]
    pub fn is_thrown(&self) -> bool {
        matches!(self, Outcome::Thrown(_))
    }

    /// The returned value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Thrown(_) => None,
        }
    }

    /// The thrown error, if any.
    #[must_use]
    pub fn thrown(&self) -> Option<&E> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Thrown(error) => Some(error),
        }
    }

    /// Converts into a standard `Result`.
    ///
    /// # Errors
    /// Returns the thrown error.
    pub fn into_result(self) -> std::result::Result<V, E> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Thrown(error) => Err(error),
        }
    }
}

impl<V, E> From<std::result::Result<V, E>> for Outcome<V, E> {
    fn from(result: std::result::Result<V, E>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(error) => Outcome::Thrown(error),
        }
    }
}

/// The mutable state of one hooked invocation.
#[derive(Clone, Debug)]
pub(crate) struct Record<V, E> {
    pub receiver: Option<V>,
    pub args: Vec<V>,
    pub outcome: Outcome<V, E>,
    pub return_early: bool,
}

/// What a before-callback may see and change.
pub struct BeforeContext<'r, V, E> {
    member: &'r MemberDescriptor,
    record: &'r mut Record<V, E>,
}

impl<'r, V, E> BeforeContext<'r, V, E> {
    pub(crate) fn new(member: &'r MemberDescriptor, record: &'r mut Record<V, E>) -> Self {
        BeforeContext { member, record }
    }

    /// The hooked member.
    #[must_use]
    pub fn member(&self) -> &MemberDescriptor {
        self.member
    }

    /// The receiver of an instance call.
    #[must_use]
    pub fn receiver(&self) -> Option<&V> {
        self.record.receiver.as_ref()
    }

    /// The arguments the original will be called with.
    #[must_use]
    pub fn args(&self) -> &[V] {
        &self.record.args
    }

    /// Replaces arguments before the original is called.
    pub fn args_mut(&mut self) -> &mut [V] {
        &mut self.record.args
    }

    /// The pending outcome.
    #[must_use]
    pub fn outcome(&self) -> &Outcome<V, E> {
        &self.record.outcome
    }

    /// Skips the original and the remaining before-callbacks, returning `value`.
    pub fn return_early(&mut self, value: V) {
        self.record.outcome = Outcome::Value(value);
        self.record.return_early = true;
    }

    /// Skips the original and the remaining before-callbacks, throwing `error`.
    pub fn throw_early(&mut self, error: E) {
        self.record.outcome = Outcome::Thrown(error);
        self.record.return_early = true;
    }
}

/// What an after-callback may see and change.
pub struct AfterContext<'r, V, E> {
    member: &'r MemberDescriptor,
    record: &'r mut Record<V, E>,
}

impl<'r, V, E> AfterContext<'r, V, E> {
    pub(crate) fn new(member: &'r MemberDescriptor, record: &'r mut Record<V, E>) -> Self {
        AfterContext { member, record }
    }

    /// The hooked member.
    #[must_use]
    pub fn member(&self) -> &MemberDescriptor {
        self.member
    }

    /// The receiver of an instance call.
    #[must_use]
    pub fn receiver(&self) -> Option<&V> {
        self.record.receiver.as_ref()
    }

    /// The arguments as the original saw them.
    #[must_use]
    pub fn args(&self) -> &[V] {
        &self.record.args
    }

    /// The current outcome.
    #[must_use]
    pub fn outcome(&self) -> &Outcome<V, E> {
        &self.record.outcome
    }

    /// Replaces the outcome with a returned value.
    pub fn set_result(&mut self, value: V) {
        self.record.outcome = Outcome::Value(value);
    }

    /// Replaces the outcome with a thrown error.
    pub fn set_thrown(&mut self, error: E) {
        self.record.outcome = Outcome::Thrown(error);
    }
}

/// Interception logic attached to a hooked member.
///
/// Both entry points default to doing nothing. An `Err` from either is logged and contained;
/// it never reaches the caller of the hooked member.
pub trait Callback<V, E>: Send + Sync {
    /// Runs before the original.
    ///
    /// # Errors
    /// A failure is logged; the call then proceeds as if the callback had returned early
    /// with the default value, except that later before-callbacks still run.
    fn before(&self, _call: &mut BeforeContext<'_, V, E>) -> std::result::Result<(), E> {
        Ok(())
    }

    /// Runs after the original, or after it was skipped.
    ///
    /// # Errors
    /// A failure is logged and the outcome is restored to what this callback saw.
    fn after(&self, _call: &mut AfterContext<'_, V, E>) -> std::result::Result<(), E> {
        Ok(())
    }
}

/// Handle identifying one registration in a [`CallbackChain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// A registered callback.
pub struct Registration<V, E> {
    id: CallbackId,
    callback: Arc<dyn Callback<V, E>>,
}

impl<V, E> Registration<V, E> {
    /// Identity of the registration.
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// The callback.
    #[must_use]
    pub fn callback(&self) -> &Arc<dyn Callback<V, E>> {
        &self.callback
    }
}

impl<V, E> Clone for Registration<V, E> {
    fn clone(&self) -> Self {
        Registration {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// A point-in-time view of a chain, in registration order.
pub type Snapshot<V, E> = Arc<[Registration<V, E>]>;

struct ChainInner<V, E> {
    current: RwLock<Snapshot<V, E>>,
    next_id: AtomicU64,
}

/// Ordered callbacks of one hooked member.
///
/// Edits replace the whole list under a short write lock; readers clone the current
/// [`Snapshot`] and never observe a half-applied edit. Clones share the same list.
pub struct CallbackChain<V, E> {
    inner: Arc<ChainInner<V, E>>,
}

impl<V, E> Clone for CallbackChain<V, E> {
    fn clone(&self) -> Self {
        CallbackChain {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Default for CallbackChain<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> fmt::Debug for CallbackChain<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain")
            .field("len", &self.len())
            .finish()
    }
}

impl<V, E> CallbackChain<V, E> {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        CallbackChain {
            inner: Arc::new(ChainInner {
                current: RwLock::new(Arc::from(Vec::new())),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<V, E> {
        // The guarded value is swapped whole, so a poisoned lock still holds a valid list.
        let guard = self
            .inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn edit(&self, f: impl FnOnce(&mut Vec<Registration<V, E>>)) {
        let mut guard = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut list = guard.to_vec();
        f(&mut list);
        *guard = Arc::from(list);
    }

    /// Appends `callback`; its `before` runs after every earlier registration's and its
    /// `after` before theirs.
    pub fn add(&self, callback: Arc<dyn Callback<V, E>>) -> CallbackId {
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.edit(|list| list.push(Registration { id, callback }));
        id
    }

    /// Removes a registration. Returns `false` if it was not present.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut removed = false;
        self.edit(|list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed = list.len() != before;
        });
        removed
    }

    /// Removes every registration.
    pub fn clear(&self) {
        self.edit(Vec::clear);
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide switch that makes every hooked call go straight to the original.
#[derive(Debug, Default)]
pub struct KillSwitch(AtomicBool);

impl KillSwitch {
    /// Creates an enabled switch (hooks active).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bypasses all callbacks from now on.
    pub fn disable_hooks(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Re-activates callbacks.
    pub fn enable_hooks(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while callbacks are bypassed.
    #[must_use]
    pub fn hooks_disabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The inputs of one hooked call.
#[derive(Clone, Debug)]
pub struct Call<'a, V> {
    /// The hooked member.
    pub member: &'a MemberDescriptor,
    /// Receiver of an instance call.
    pub receiver: Option<V>,
    /// Declared arguments.
    pub args: Vec<V>,
}

impl<'a, V> Call<'a, V> {
    /// Bundles the inputs of a call.
    #[must_use]
    pub fn new(member: &'a MemberDescriptor, receiver: Option<V>, args: Vec<V>) -> Self {
        Call {
            member,
            receiver,
            args,
        }
    }
}

/// Runs one before-callback against `record`, containing its failure.
///
/// Returns `false` if the callback failed.
pub(crate) fn run_before<V, E>(
    callback: &dyn Callback<V, E>,
    member: &MemberDescriptor,
    record: &mut Record<V, E>,
) -> bool
where
    V: Clone + Default,
    E: Clone + fmt::Debug,
{
    let mut scratch = record.clone();
    let result = callback.before(&mut BeforeContext::new(member, &mut scratch));
    match result {
        Ok(()) => {
            record.args = scratch.args;
            record.outcome = scratch.outcome;
            record.return_early = scratch.return_early;
            true
        }
        Err(error) => {
            warn!("before-callback of {member} failed: {error:?}");
            record.args = scratch.args;
            record.outcome = Outcome::Value(V::default());
            record.return_early = false;
            false
        }
    }
}

/// Runs one after-callback against `record`, restoring the outcome if it fails.
pub(crate) fn run_after<V, E>(
    callback: &dyn Callback<V, E>,
    member: &MemberDescriptor,
    record: &mut Record<V, E>,
)
where
    V: Clone,
    E: Clone + fmt::Debug,
{
    let mut scratch = record.clone();
    let result = callback.after(&mut AfterContext::new(member, &mut scratch));
    match result {
        Ok(()) => record.outcome = scratch.outcome,
        Err(error) => {
            warn!("after-callback of {member} failed: {error:?}");
        }
    }
}

/// Dispatches one call to a hooked member.
///
/// `original` receives the receiver and the (possibly replaced) arguments and performs the
/// un-hooked call. It is not called when a before-callback returned early or failed.
pub fn invoke<V, E, F>(
    chain: &CallbackChain<V, E>,
    switch: &KillSwitch,
    call: Call<'_, V>,
    original: F,
) -> Outcome<V, E>
where
    V: Clone + Default,
    E: Clone + fmt::Debug,
    F: FnOnce(Option<&V>, &[V]) -> Outcome<V, E>,
{
    let snapshot = chain.snapshot();
    if switch.hooks_disabled() || snapshot.is_empty() {
        return original(call.receiver.as_ref(), &call.args);
    }

    let member = call.member;
    let mut record = Record {
        receiver: call.receiver,
        args: call.args,
        outcome: Outcome::Value(V::default()),
        return_early: false,
    };

    let mut skip_original = false;
    for registration in snapshot.iter() {
        if !run_before(registration.callback.as_ref(), member, &mut record) {
            skip_original = true;
            continue;
        }
        if record.return_early {
            break;
        }
    }

    if !(record.return_early || skip_original) {
        record.outcome = original(record.receiver.as_ref(), &record.args);
    }

    for registration in snapshot.iter().rev() {
        run_after(registration.callback.as_ref(), member, &mut record);
    }
    record.outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct Probe {
        name: &'static str,
        log: Log,
        early: Option<i32>,
        fail_before: bool,
        fail_after: bool,
        replace_after: Option<i32>,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Probe {
                name,
                log: Arc::clone(log),
                ..Probe::default()
            }
        }
    }

    impl Callback<i32, String> for Probe {
        fn before(&self, call: &mut BeforeContext<'_, i32, String>) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("before {}", self.name));
            if self.fail_before {
                return Err(format!("{} failed", self.name));
            }
            if let Some(value) = self.early {
                call.return_early(value);
            }
            Ok(())
        }

        fn after(&self, call: &mut AfterContext<'_, i32, String>) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("after {}", self.name));
            if let Some(value) = self.replace_after {
                call.set_result(value);
            }
            if self.fail_after {
                return Err(format!("{} failed", self.name));
            }
            Ok(())
        }
    }

    fn member() -> MemberDescriptor {
        MemberDescriptor::parse("static Lt/T;->f(I)I").unwrap()
    }

    fn run(chain: &CallbackChain<i32, String>, calls: &Mutex<u32>) -> Outcome<i32, String> {
        let member = member();
        invoke(chain, &KillSwitch::new(), Call::new(&member, None, vec![20]), |_, args| {
            *calls.lock().unwrap() += 1;
            Outcome::Value(args[0] + 1)
        })
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_callback_ordering() {
        let log = Log::default();
        let chain = CallbackChain::new();
        for name in ["A", "B", "C"] {
            chain.add(Arc::new(Probe::new(name, &log)));
        }
        let calls = Mutex::new(0);
        assert_eq!(run(&chain, &calls), Outcome::Value(21));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(
            entries(&log),
            ["before A", "before B", "before C", "after C", "after B", "after A"]
        );
    }

    #[test]
    fn test_early_return_skips_later_befores_and_original() {
        let log = Log::default();
        let chain = CallbackChain::new();
        chain.add(Arc::new(Probe::new("A", &log)));
        chain.add(Arc::new(Probe {
            early: Some(7),
            ..Probe::new("B", &log)
        }));
        chain.add(Arc::new(Probe::new("C", &log)));
        let calls = Mutex::new(0);
        assert_eq!(run(&chain, &calls), Outcome::Value(7));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(
            entries(&log),
            ["before A", "before B", "after C", "after B", "after A"]
        );
    }

    #[test]
    fn test_failing_before_is_contained() {
        let log = Log::default();
        let chain = CallbackChain::new();
        chain.add(Arc::new(Probe {
            fail_before: true,
            ..Probe::new("A", &log)
        }));
        chain.add(Arc::new(Probe::new("B", &log)));
        chain.add(Arc::new(Probe::new("C", &log)));
        let calls = Mutex::new(0);
        assert_eq!(run(&chain, &calls), Outcome::Value(0));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(
            entries(&log),
            ["before A", "before B", "before C", "after C", "after B", "after A"]
        );
    }

    #[test]
    fn test_failing_after_restores_outcome() {
        let log = Log::default();
        let chain = CallbackChain::new();
        chain.add(Arc::new(Probe::new("A", &log)));
        chain.add(Arc::new(Probe {
            replace_after: Some(99),
            fail_after: true,
            ..Probe::new("B", &log)
        }));
        let calls = Mutex::new(0);
        assert_eq!(run(&chain, &calls), Outcome::Value(21));
    }

    #[test]
    fn test_original_exception_passes_through() {
        let log = Log::default();
        let chain = CallbackChain::new();
        chain.add(Arc::new(Probe::new("A", &log)));
        let member = member();
        let outcome = invoke(&chain, &KillSwitch::new(), Call::new(&member, None, vec![1]), |_, _| {
            Outcome::Thrown("IllegalStateException: boom".to_string())
        });
        assert_eq!(
            outcome,
            Outcome::Thrown("IllegalStateException: boom".to_string())
        );
    }

    #[test]
    fn test_argument_replacement_reaches_original() {
        struct Double;
        impl Callback<i32, String> for Double {
            fn before(&self, call: &mut BeforeContext<'_, i32, String>) -> Result<(), String> {
                call.args_mut()[0] *= 2;
                Ok(())
            }
        }
        let chain = CallbackChain::new();
        chain.add(Arc::new(Double));
        let calls = Mutex::new(0);
        assert_eq!(run(&chain, &calls), Outcome::Value(41));
    }

    #[test]
    fn test_disabled_and_empty_bypass_callbacks() {
        let log = Log::default();
        let chain = CallbackChain::new();
        let member = member();
        let switch = KillSwitch::new();
        let call = || Call::new(&member, None, vec![1]);
        assert_eq!(
            invoke(&chain, &switch, call(), |_, a| Outcome::<i32, String>::Value(a[0])),
            Outcome::Value(1)
        );

        let id = chain.add(Arc::new(Probe {
            early: Some(5),
            ..Probe::new("A", &log)
        }));
        switch.disable_hooks();
        assert_eq!(
            invoke(&chain, &switch, call(), |_, a| Outcome::Value(a[0])),
            Outcome::Value(1)
        );
        assert!(entries(&log).is_empty());

        switch.enable_hooks();
        assert_eq!(
            invoke(&chain, &switch, call(), |_, a| Outcome::Value(a[0])),
            Outcome::Value(5)
        );
        assert!(chain.remove(id));
        assert!(!chain.remove(id));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable_under_edits() {
        let log = Log::default();
        let chain = CallbackChain::new();
        chain.add(Arc::new(Probe::new("A", &log)));
        let snapshot = chain.snapshot();
        chain.add(Arc::new(Probe::new("B", &log)));
        chain.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(chain.is_empty());
    }
}
