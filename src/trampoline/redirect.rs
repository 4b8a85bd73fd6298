//! The native call-redirection collaborator.
//!
//! Installing a trampoline is outside this crate: a runtime service loads the unit, patches
//! `backup` to become the original entry and routes calls of the member to `hook`. The
//! compiler hands it a [`HookEntry`] naming everything it needs.

use crate::{
    trampoline::{BinaryUnit, Layout},
    types::{MemberDescriptor, MethodRef, TypeId},
    Result,
};

/// Entry points of an installed trampoline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookEntry {
    /// The generated class.
    pub class: TypeId,
    /// Receives redirected calls.
    pub hook: MethodRef,
    /// Becomes the original implementation.
    pub backup: MethodRef,
    /// Binds the reflection handles and the hook record.
    pub setup: MethodRef,
}

impl From<&Layout> for HookEntry {
    fn from(layout: &Layout) -> Self {
        HookEntry {
            class: layout.class.clone(),
            hook: layout.hook.clone(),
            backup: layout.backup.clone(),
            setup: layout.setup.clone(),
        }
    }
}

/// Makes the host runtime dispatch calls of a member to a trampoline.
pub trait CallRedirector: Send + Sync {
    /// Loads `unit` and redirects `member` to `entry.hook`.
    ///
    /// # Errors
    /// Implementation-defined; the compiler propagates it unchanged.
    fn redirect(&self, member: &MemberDescriptor, entry: &HookEntry, unit: &BinaryUnit) -> Result<()>;
}
