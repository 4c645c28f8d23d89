//! Runtime directory configuration.
//!
//! [`Dirs`] is the explicit context every component is constructed with.
//! It is built once in `main` and passed down; no module reaches into
//! ambient global state for paths.
//!
//! # Layout
//!
//! - Cache tree: `~/.cache/bootvm/entries/{image-id}/` holds the disk image,
//!   run-state JSON, pid file, optional cloud-init ISO.
//! - Run tree: `$XDG_RUNTIME_DIR/bootvm/` (volatile) holds lock files and
//!   helper-process sockets. Locks live here, *outside* the cache tree,
//!   so deleting an entry never deletes the lock protecting it.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Explicit directory context for all bootvm components.
#[derive(Debug, Clone)]
pub struct Dirs {
    cache_dir: PathBuf,
    run_dir: PathBuf,
}

impl Dirs {
    /// Resolve the default directories for the current user.
    pub fn new() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| Error::storage("resolve paths", "could not determine cache directory"))?
            .join("bootvm");

        let run_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("bootvm")
            .join("run");

        Ok(Self { cache_dir, run_dir })
    }

    /// Place both trees under a single root. Used by tests.
    pub fn at_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cache_dir: root.join("cache"),
            run_dir: root.join("run"),
        }
    }

    /// Create the directory trees if they do not exist yet.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.entries_dir())
            .map_err(|e| Error::storage("create cache directory", e.to_string()))?;
        std::fs::create_dir_all(self.locks_dir())
            .map_err(|e| Error::storage("create run directory", e.to_string()))?;
        Ok(())
    }

    /// Root of the per-image cache entries.
    pub fn entries_dir(&self) -> PathBuf {
        self.cache_dir.join("entries")
    }

    /// Directory holding one advisory lock file per image id.
    pub fn locks_dir(&self) -> PathBuf {
        self.run_dir.join("locks")
    }

    /// Volatile run directory for helper sockets.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_root_keeps_locks_outside_cache_tree() {
        let dirs = Dirs::at_root("/tmp/bootvm-test");
        assert!(dirs.entries_dir().starts_with("/tmp/bootvm-test/cache"));
        assert!(dirs.locks_dir().starts_with("/tmp/bootvm-test/run"));
        assert!(!dirs.locks_dir().starts_with(dirs.entries_dir()));
    }

    #[test]
    fn test_ensure_creates_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = Dirs::at_root(tmp.path());
        dirs.ensure().unwrap();
        assert!(dirs.entries_dir().is_dir());
        assert!(dirs.locks_dir().is_dir());
    }
}
