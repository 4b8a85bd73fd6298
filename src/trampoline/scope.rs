//! Which callers get a member hooked.

use std::{fs, path::Path};

use rustc_hash::FxHashSet;

use crate::{types::MemberDescriptor, Result};

/// Decides whether `member` should be hooked in the process identified by `caller`.
pub trait ScopePolicy: Send + Sync {
    /// Returns `true` to hook.
    fn should_hook(&self, member: &MemberDescriptor, caller: &str) -> bool;
}

/// Hooks everything everywhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl ScopePolicy for AllowAll {
    fn should_hook(&self, _member: &MemberDescriptor, _caller: &str) -> bool {
        true
    }
}

/// An allow-list of callers, typically package names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeList {
    callers: FxHashSet<String>,
}

impl ScopeList {
    /// Creates a list from caller names.
    pub fn from_callers<I, S>(callers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScopeList {
            callers: callers.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses one caller per line; blank lines and lines starting with `#` are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self::from_callers(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Reads a scope file.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Number of listed callers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    /// Returns `true` if nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

impl ScopePolicy for ScopeList {
    fn should_hook(&self, _member: &MemberDescriptor, caller: &str) -> bool {
        self.callers.contains(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.list");
        fs::write(&path, "# hooked apps\ncom.example.app\n\n  org.sample  \n").unwrap();

        let scope = ScopeList::load(&path).unwrap();
        let member = MemberDescriptor::parse("La/B;->c()V").unwrap();
        assert_eq!(scope.len(), 2);
        assert!(scope.should_hook(&member, "com.example.app"));
        assert!(scope.should_hook(&member, "org.sample"));
        assert!(!scope.should_hook(&member, "# hooked apps"));
        assert!(AllowAll.should_hook(&member, "anything"));
        assert!(ScopeList::load(dir.path().join("missing")).is_err());
    }
}
