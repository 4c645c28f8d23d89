//! Content-addressed cache of per-image VM state.
//!
//! Each pulled bootc image gets one entry directory named by its
//! [`ImageId`] (the 64-hex content digest), holding the disk image, the
//! run-state JSON, the pid file, and an optional cloud-init ISO.
//!
//! Access goes through guards backed by the advisory lock in
//! [`crate::lock`]. The invariant that closes the rm-vs-run race: the
//! lock is always acquired *before* the existence check, so a concurrent
//! removal cannot slip between "it exists" and "I hold it".
//!
//! Guards fail with [`Error::GuardReleased`] on every operation after
//! `release()`. Misuse is a typed error, never silent corruption.

use crate::config::Dirs;
use crate::error::{Error, Result};
use crate::lock::{CacheLock, LockMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Length of a full image id (sha256 digest in hex).
pub const IMAGE_ID_LEN: usize = 64;

/// 64-character lowercase-hex content digest identifying a pulled image.
///
/// The sole key for cache entries and VM identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Parse and validate a full image id.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != IMAGE_ID_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::InvalidImageId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The full 64-character hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for display (first 12 characters).
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ImageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Shared guard internals. Operations check the lock is still held.
#[derive(Debug)]
struct GuardInner {
    id: ImageId,
    dir: PathBuf,
    lock: Option<CacheLock>,
}

impl GuardInner {
    fn assert_held(&self, operation: &str) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::guard_released(operation));
        }
        Ok(())
    }

    fn release(&mut self) {
        // Dropping the CacheLock releases the flock. Second call is a no-op.
        self.lock.take();
    }
}

/// Read-only capability over one locked cache entry (shared lock).
#[derive(Debug)]
pub struct ReadGuard {
    inner: GuardInner,
}

impl ReadGuard {
    /// Image id this guard is bound to.
    pub fn id(&self) -> &ImageId {
        &self.inner.id
    }

    /// Path of the entry directory.
    ///
    /// Fails once the guard has been released.
    pub fn entry_dir(&self) -> Result<&Path> {
        self.inner.assert_held("entry_dir")?;
        Ok(&self.inner.dir)
    }

    /// Absolute path of a file inside the entry.
    pub fn file_path(&self, name: &str) -> Result<PathBuf> {
        self.inner.assert_held("file_path")?;
        Ok(self.inner.dir.join(name))
    }

    /// Read a file from the entry.
    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.assert_held("load")?;
        Ok(std::fs::read(self.inner.dir.join(name))?)
    }

    /// Release the lock. Every later operation on this guard fails with
    /// [`Error::GuardReleased`]. Calling release twice is a no-op.
    pub fn release(&mut self) {
        self.inner.release();
    }
}

/// Read-write capability over one locked cache entry (exclusive lock).
#[derive(Debug)]
pub struct WriteGuard {
    inner: GuardInner,
}

impl WriteGuard {
    /// Image id this guard is bound to.
    pub fn id(&self) -> &ImageId {
        &self.inner.id
    }

    /// Path of the entry directory.
    pub fn entry_dir(&self) -> Result<&Path> {
        self.inner.assert_held("entry_dir")?;
        Ok(&self.inner.dir)
    }

    /// Absolute path of a file inside the entry.
    pub fn file_path(&self, name: &str) -> Result<PathBuf> {
        self.inner.assert_held("file_path")?;
        Ok(self.inner.dir.join(name))
    }

    /// Read a file from the entry.
    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.assert_held("load")?;
        Ok(std::fs::read(self.inner.dir.join(name))?)
    }

    /// Write a file into the entry.
    pub fn store(&self, name: &str, contents: &[u8]) -> Result<()> {
        self.inner.assert_held("store")?;
        Ok(std::fs::write(self.inner.dir.join(name), contents)?)
    }

    /// Move an external file into the entry by rename.
    pub fn move_into(&self, src: &Path, name: &str) -> Result<()> {
        self.inner.assert_held("move_into")?;
        Ok(std::fs::rename(src, self.inner.dir.join(name))?)
    }

    /// Delete the entire entry directory recursively.
    ///
    /// The lock stays held; releasing remains the caller's responsibility.
    pub fn remove(&self) -> Result<()> {
        self.inner.assert_held("remove")?;
        Ok(std::fs::remove_dir_all(&self.inner.dir)?)
    }

    /// Release the lock. Every later operation fails typed; calling
    /// release twice is a no-op.
    pub fn release(&mut self) {
        self.inner.release();
    }
}

/// The content-addressed on-disk cache.
#[derive(Debug, Clone)]
pub struct ImageCache {
    entries_dir: PathBuf,
    locks_dir: PathBuf,
}

impl ImageCache {
    /// Open the cache over the given directory context, creating the
    /// trees if needed.
    pub fn open(dirs: &Dirs) -> Result<Self> {
        dirs.ensure()?;
        Ok(Self {
            entries_dir: dirs.entries_dir(),
            locks_dir: dirs.locks_dir(),
        })
    }

    fn entry_dir(&self, id: &ImageId) -> PathBuf {
        self.entries_dir.join(id.as_str())
    }

    fn lock_path(&self, id: &ImageId) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", id))
    }

    fn acquire(&self, id: &ImageId, mode: LockMode) -> Result<CacheLock> {
        CacheLock::try_acquire(&self.lock_path(id), mode)?
            .ok_or_else(|| Error::busy(id.as_str()))
    }

    /// Enumerate entry directories. Names that are not valid image ids
    /// are skipped, not errors.
    pub fn list(&self) -> Result<Vec<ImageId>> {
        let mut ids = Vec::new();
        for dirent in std::fs::read_dir(&self.entries_dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let name = dirent.file_name();
            if let Some(name) = name.to_str() {
                if let Ok(id) = ImageId::parse(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Resolve a (possibly truncated) image id to a cached entry.
    ///
    /// A prefix matching more than one entry is an error rather than a
    /// silent first-match pick.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<ImageId> {
        let mut matches: Vec<ImageId> = self
            .list()?
            .into_iter()
            .filter(|id| id.as_str().starts_with(prefix))
            .collect();

        match matches.len() {
            0 => Err(Error::entry_not_found(prefix)),
            1 => Ok(matches.swap_remove(0)),
            n => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                count: n,
            }),
        }
    }

    /// Acquire a shared guard on an entry.
    ///
    /// Returns `Ok(None)` if the entry does not exist (absence is not an
    /// error); the lock acquired for the check is released before
    /// returning. Contention yields [`Error::Busy`].
    pub fn get(&self, id: &ImageId) -> Result<Option<ReadGuard>> {
        let lock = self.acquire(id, LockMode::Shared)?;
        let dir = self.entry_dir(id);
        // Existence is only meaningful while the lock is held.
        if !dir.is_dir() {
            drop(lock);
            return Ok(None);
        }
        Ok(Some(ReadGuard {
            inner: GuardInner {
                id: id.clone(),
                dir,
                lock: Some(lock),
            },
        }))
    }

    /// Acquire an exclusive guard on an existing entry.
    ///
    /// Same absence/contention semantics as [`ImageCache::get`].
    pub fn get_exclusive(&self, id: &ImageId) -> Result<Option<WriteGuard>> {
        let lock = self.acquire(id, LockMode::Exclusive)?;
        let dir = self.entry_dir(id);
        if !dir.is_dir() {
            drop(lock);
            return Ok(None);
        }
        Ok(Some(WriteGuard {
            inner: GuardInner {
                id: id.clone(),
                dir,
                lock: Some(lock),
            },
        }))
    }

    /// Acquire an exclusive guard, creating the entry if absent.
    ///
    /// Always returns a guard on success. If directory creation fails the
    /// lock is released and the error propagates.
    pub fn get_exclusive_or_add(&self, id: &ImageId) -> Result<WriteGuard> {
        let lock = self.acquire(id, LockMode::Exclusive)?;
        let dir = self.entry_dir(id);
        if !dir.is_dir() {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                drop(lock);
                return Err(Error::storage("create cache entry", e.to_string()));
            }
        }
        Ok(WriteGuard {
            inner: GuardInner {
                id: id.clone(),
                dir,
                lock: Some(lock),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(fill: char) -> ImageId {
        ImageId::parse(&fill.to_string().repeat(IMAGE_ID_LEN)).unwrap()
    }

    fn open_cache(tmp: &tempfile::TempDir) -> ImageCache {
        ImageCache::open(&Dirs::at_root(tmp.path())).unwrap()
    }

    #[test]
    fn test_image_id_validation() {
        assert!(ImageId::parse(&"a".repeat(64)).is_ok());
        assert!(ImageId::parse(&"a".repeat(63)).is_err());
        assert!(ImageId::parse(&"A".repeat(64)).is_err(), "uppercase hex rejected");
        assert!(ImageId::parse(&"g".repeat(64)).is_err(), "non-hex rejected");
        let id = test_id('b');
        assert_eq!(id.short().len(), 12);
    }

    #[test]
    fn test_add_then_get_returns_same_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('a');

        let mut write = cache.get_exclusive_or_add(&id).unwrap();
        let created = write.entry_dir().unwrap().to_path_buf();
        write.release();

        let guard = cache.get(&id).unwrap().expect("entry must exist");
        assert_eq!(guard.entry_dir().unwrap(), created);
    }

    #[test]
    fn test_get_missing_entry_is_none_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('c');

        assert!(cache.get(&id).unwrap().is_none());
        assert!(cache.get_exclusive(&id).unwrap().is_none());
        // The probe released its lock: an exclusive acquisition succeeds.
        let _guard = cache.get_exclusive_or_add(&id).unwrap();
    }

    #[test]
    fn test_two_exclusive_guards_one_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('d');

        let held = cache.get_exclusive_or_add(&id).unwrap();
        let err = cache.get_exclusive(&id).unwrap_err();
        assert!(err.is_busy());
        drop(held);
    }

    #[test]
    fn test_shared_excludes_exclusive_but_not_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('e');

        let mut setup = cache.get_exclusive_or_add(&id).unwrap();
        setup.release();

        let read_a = cache.get(&id).unwrap().unwrap();
        let read_b = cache.get(&id).unwrap().unwrap();
        assert!(cache.get_exclusive(&id).unwrap_err().is_busy());
        drop((read_a, read_b));

        let write = cache.get_exclusive(&id).unwrap().unwrap();
        assert!(cache.get(&id).unwrap_err().is_busy());
        drop(write);
    }

    #[test]
    fn test_guard_operations_fail_after_release() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('f');

        let mut guard = cache.get_exclusive_or_add(&id).unwrap();
        guard.store("state", b"x").unwrap();
        guard.release();
        // Second release is a harmless no-op.
        guard.release();

        assert!(matches!(
            guard.load("state"),
            Err(Error::GuardReleased { .. })
        ));
        assert!(matches!(
            guard.store("state", b"y"),
            Err(Error::GuardReleased { .. })
        ));
        assert!(matches!(
            guard.file_path("state"),
            Err(Error::GuardReleased { .. })
        ));
        assert!(matches!(guard.remove(), Err(Error::GuardReleased { .. })));
        assert!(matches!(
            guard.move_into(Path::new("/nonexistent"), "x"),
            Err(Error::GuardReleased { .. })
        ));

        let mut read = cache.get(&id).unwrap().unwrap();
        read.release();
        assert!(matches!(read.load("state"), Err(Error::GuardReleased { .. })));
        assert!(matches!(
            read.file_path("state"),
            Err(Error::GuardReleased { .. })
        ));
    }

    #[test]
    fn test_remove_deletes_entry_but_keeps_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('1');

        let guard = cache.get_exclusive_or_add(&id).unwrap();
        guard.store("disk.img", b"payload").unwrap();
        guard.remove().unwrap();

        // Entry is gone, but the lock is still held by the guard.
        assert!(cache.list().unwrap().is_empty());
        assert!(cache.get_exclusive(&id).unwrap_err().is_busy());
        drop(guard);

        // After release, absence shows up as None rather than busy.
        assert!(cache.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_list_skips_malformed_names() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let id = test_id('2');

        let mut guard = cache.get_exclusive_or_add(&id).unwrap();
        guard.release();

        let entries = Dirs::at_root(tmp.path()).entries_dir();
        std::fs::create_dir(entries.join("not-an-image-id")).unwrap();
        std::fs::create_dir(entries.join("ABCD")).unwrap();
        std::fs::write(entries.join("stray-file"), b"x").unwrap();

        let ids = cache.list().unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn test_resolve_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp);
        let a = ImageId::parse(&format!("aa{}", "0".repeat(62))).unwrap();
        let b = ImageId::parse(&format!("ab{}", "0".repeat(62))).unwrap();

        for id in [&a, &b] {
            cache.get_exclusive_or_add(id).unwrap().release();
        }

        assert_eq!(cache.resolve_prefix("aa").unwrap(), a);
        assert_eq!(cache.resolve_prefix("ab").unwrap(), b);
        assert!(matches!(
            cache.resolve_prefix("a"),
            Err(Error::AmbiguousPrefix { count: 2, .. })
        ));
        assert!(cache.resolve_prefix("ff").unwrap_err().is_not_found());
    }
}
