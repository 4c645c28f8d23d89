//! Advisory per-image file locks.
//!
//! One lock file per image id, acquired with non-blocking `flock(2)`.
//! Contention is reported immediately as "busy"; acquisition never
//! blocks or queues. The lock is released when the [`CacheLock`] is
//! dropped (closing the descriptor releases the flock).
//!
//! Lock files live in the run directory, outside the cache tree, so a
//! concurrent `rm` of the entry directory cannot delete the lock that
//! protects it.

use crate::error::Result;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders; excludes exclusive.
    Shared,
    /// At most one holder; excludes everything.
    Exclusive,
}

/// A held advisory lock.
///
/// Dropping the lock releases it.
#[derive(Debug)]
pub struct CacheLock {
    // Held only for the flock; released on close.
    _file: File,
    mode: LockMode,
}

impl CacheLock {
    /// Try to acquire the lock at `path` in the given mode.
    ///
    /// Returns `Ok(None)` if another holder conflicts (busy). Never blocks.
    /// The lock file is created if absent and intentionally never removed:
    /// unlinking a lock file that another process may be about to open
    /// reintroduces the race the lock exists to close.
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;

        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(Some(Self { _file: file, mode }));
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        }
    }

    /// The mode this lock was acquired in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // flock conflicts between separate open file descriptions, so two
    // opens of the same path within one process exercise the same
    // exclusion the multi-process case does.

    fn lock_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("locks").join("test.lock")
    }

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = lock_path(&tmp);

        let first = CacheLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .expect("first exclusive should succeed");
        let second = CacheLock::try_acquire(&path, LockMode::Exclusive).unwrap();
        assert!(second.is_none(), "second exclusive must be busy");

        drop(first);
        let third = CacheLock::try_acquire(&path, LockMode::Exclusive).unwrap();
        assert!(third.is_some(), "lock must be acquirable after release");
    }

    #[test]
    fn test_shared_allows_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let path = lock_path(&tmp);

        let a = CacheLock::try_acquire(&path, LockMode::Shared).unwrap();
        let b = CacheLock::try_acquire(&path, LockMode::Shared).unwrap();
        assert!(a.is_some());
        assert!(b.is_some(), "two shared holders must coexist");
    }

    #[test]
    fn test_shared_excludes_exclusive_and_vice_versa() {
        let tmp = tempfile::tempdir().unwrap();
        let path = lock_path(&tmp);

        let shared = CacheLock::try_acquire(&path, LockMode::Shared)
            .unwrap()
            .unwrap();
        assert!(
            CacheLock::try_acquire(&path, LockMode::Exclusive)
                .unwrap()
                .is_none(),
            "exclusive against shared must be busy"
        );
        drop(shared);

        let excl = CacheLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .unwrap();
        assert!(
            CacheLock::try_acquire(&path, LockMode::Shared)
                .unwrap()
                .is_none(),
            "shared against exclusive must be busy"
        );
        drop(excl);
    }

    #[test]
    fn test_exclusive_held_blocks_other_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let path = lock_path(&tmp);

        let held = CacheLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .unwrap();

        let path2 = path.clone();
        let theirs = std::thread::spawn(move || {
            CacheLock::try_acquire(&path2, LockMode::Exclusive)
                .unwrap()
                .is_some()
        })
        .join()
        .unwrap();

        assert!(!theirs, "second holder must observe busy, not block");
        drop(held);
    }
}
