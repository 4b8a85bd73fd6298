//! Content-addressed store of generated units.
//!
//! Units are keyed by [`MemberDescriptor::content_hash`]. The in-memory map is always used; a
//! cache directory adds one `<hash>.dex` file per member, written to a temporary file and
//! renamed into place so readers never observe a partial unit. Files are readable and writable
//! by the owner only.
//!
//! A unit loaded from disk is decoded and checked to define the expected class before it is
//! served; anything else is rejected, deleted and regenerated. Failing to write the directory
//! is not an error: the cache logs it and stays memory-only from then on.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::{debug, warn};

use crate::{
    dex::DexFile,
    file::Physical,
    trampoline::BinaryUnit,
    types::{MemberDescriptor, TypeId},
    Error, Result,
};

/// File extension of persisted units.
pub const UNIT_EXTENSION: &str = "dex";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// In-memory and on-disk cache of [`BinaryUnit`]s.
#[derive(Debug)]
pub struct UnitCache {
    memory: DashMap<String, BinaryUnit>,
    dir: Option<PathBuf>,
    persist: AtomicBool,
}

impl UnitCache {
    /// Creates a cache, persisting below `dir` if given. The directory is created on demand.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        let persist = AtomicBool::new(dir.is_some());
        UnitCache {
            memory: DashMap::new(),
            dir,
            persist,
        }
    }

    /// Returns `true` while units are written to disk.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persist.load(Ordering::Acquire)
    }

    /// Path of the persisted unit for `member`, if a directory is configured.
    #[must_use]
    pub fn path_for(&self, member: &MemberDescriptor) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{UNIT_EXTENSION}", member.content_hash())))
    }

    /// Number of units held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Returns `true` if no unit is held in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Looks up the unit for `member`, whose generated class must be `class`.
    ///
    /// Memory is consulted first, then the cache directory. A persisted unit that fails
    /// validation is removed and `None` is returned.
    pub fn get(&self, member: &MemberDescriptor, class: &TypeId) -> Option<BinaryUnit> {
        let key = member.content_hash();
        if let Some(unit) = self.memory.get(&key) {
            if unit.member() == member {
                return Some(unit.cached());
            }
        }

        let path = self.path_for(member)?;
        if !path.is_file() {
            return None;
        }
        match load(&path, member, class) {
            Ok(unit) => {
                debug!("loaded {} from {}", member, path.display());
                self.memory.insert(key, unit.clone());
                Some(unit.cached())
            }
            Err(error) => {
                warn!("discarding cached unit {}: {error}", path.display());
                if let Err(error) = fs::remove_file(&path) {
                    warn!("cannot remove {}: {error}", path.display());
                }
                None
            }
        }
    }

    /// Stores `unit`, persisting it when the cache has a directory.
    pub fn insert(&self, unit: &BinaryUnit) {
        let key = unit.member().content_hash();
        self.memory.insert(key, unit.clone());

        let Some(path) = self.path_for(unit.member()) else {
            return;
        };
        if !self.is_persistent() {
            return;
        }
        if let Err(error) = persist(&path, unit.bytes()) {
            warn!(
                "cannot persist {} to {}, caching in memory only: {error}",
                unit.member(),
                path.display()
            );
            self.persist.store(false, Ordering::Release);
        }
    }

    /// Drops the unit for `member` from memory and disk. Returns `true` if anything was
    /// removed.
    pub fn remove(&self, member: &MemberDescriptor) -> bool {
        let mut removed = self.memory.remove(&member.content_hash()).is_some();
        if let Some(path) = self.path_for(member) {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => warn!("cannot remove {}: {error}", path.display()),
            }
        }
        removed
    }
}

fn load(path: &Path, member: &MemberDescriptor, class: &TypeId) -> Result<BinaryUnit> {
    let file = Physical::new(path)?;
    validate(file.data(), member, class)?;
    Ok(BinaryUnit::new(
        member.clone(),
        class.descriptor().to_string(),
        file.data(),
        true,
    ))
}

/// Checks that `bytes` decode to a unit defining `class` with a `hook` method.
///
/// # Errors
/// Returns [`Error::CacheRejected`] describing the mismatch.
pub fn validate(bytes: &[u8], member: &MemberDescriptor, class: &TypeId) -> Result<()> {
    let reject = |reason: String| Error::CacheRejected {
        member: member.canonical(),
        reason,
    };
    let file = DexFile::parse(bytes).map_err(|error| reject(error.to_string()))?;
    let defined = file
        .classes()
        .iter()
        .any(|c| file.pool().types().get(c.class as usize) == Some(class));
    if !defined {
        return Err(reject(format!("unit does not define {class}")));
    }
    if file.find_method(class.descriptor(), "hook").is_none() {
        return Err(reject(format!("{class} has no hook method")));
    }
    Ok(())
}

fn persist(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("unit");
    let temp = dir.join(format!(
        ".{name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let result = options.open(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    match result.and_then(|()| fs::rename(&temp, path)) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = fs::remove_file(&temp);
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::encode,
        trampoline::{generator::generate, Layout, TrampolineConfig},
    };

    fn unit_for(member: &MemberDescriptor) -> (BinaryUnit, TypeId) {
        let config = TrampolineConfig::default();
        let layout = Layout::new(member, &config.class_prefix, &config.bindings);
        let bytes = encode(generate(member, &config).unwrap(), &config.optimizer).unwrap();
        let unit = BinaryUnit::new(
            member.clone(),
            layout.class.descriptor().to_string(),
            bytes,
            false,
        );
        (unit, layout.class)
    }

    #[test]
    fn test_memory_only_cache() {
        let member = MemberDescriptor::parse("La/B;->c()V").unwrap();
        let (unit, class) = unit_for(&member);
        let cache = UnitCache::new(None);
        assert!(cache.get(&member, &class).is_none());
        cache.insert(&unit);
        let hit = cache.get(&member, &class).unwrap();
        assert!(hit.from_cache());
        assert_eq!(hit.bytes(), unit.bytes());
        assert!(cache.remove(&member));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disk_round_trip_and_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let member = MemberDescriptor::parse("static La/B;->d(J)I").unwrap();
        let (unit, class) = unit_for(&member);

        let cache = UnitCache::new(Some(dir.path().to_path_buf()));
        cache.insert(&unit);
        let path = cache.path_for(&member).unwrap();
        assert!(path.is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let fresh = UnitCache::new(Some(dir.path().to_path_buf()));
        let loaded = fresh.get(&member, &class).unwrap();
        assert_eq!(loaded.bytes(), unit.bytes());

        fs::write(&path, b"not a unit").unwrap();
        let fresh = UnitCache::new(Some(dir.path().to_path_buf()));
        assert!(fresh.get(&member, &class).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_validate_wrong_class() {
        let member = MemberDescriptor::parse("La/B;->c()V").unwrap();
        let (unit, _) = unit_for(&member);
        let other = TypeId::class("Other");
        assert!(matches!(
            validate(unit.bytes(), &member, &other),
            Err(Error::CacheRejected { .. })
        ));
    }

    #[test]
    fn test_unwritable_directory_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let member = MemberDescriptor::parse("La/B;->c()V").unwrap();
        let (unit, class) = unit_for(&member);

        let cache = UnitCache::new(Some(blocker.join("sub")));
        cache.insert(&unit);
        assert!(!cache.is_persistent());
        assert!(cache.get(&member, &class).is_some());
    }
}
