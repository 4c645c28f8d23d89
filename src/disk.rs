//! Disk-image cache for installed bootc images.
//!
//! Each cache entry holds one raw disk image produced by the privileged
//! install procedure. Whether the cached disk can be reused is decided by
//! a provenance record, the digest of the image it was built from,
//! stored as an extended attribute *on the disk file itself*, so the
//! record can never be separated from the artifact it describes.
//!
//! Rebuilds are crash-safe: the installer writes into a sparse temp file
//! in the entry directory, the provenance xattr is attached there, and a
//! single atomic rename publishes the result. A reader can never observe
//! a partially written disk at the canonical path.

use crate::cache::ImageId;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Canonical disk image filename inside a cache entry.
pub const DISK_FILENAME: &str = "disk.img";

/// Extended attribute carrying the provenance digest.
const PROVENANCE_XATTR: &str = "user.bootvm.image-digest";

/// Fixed capacity of the sparse disk image (bytes).
pub const DISK_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// What [`ensure_disk`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOutcome {
    /// The cached disk already matched the requested digest.
    Reused,
    /// A new disk was installed and published.
    Rebuilt,
}

/// The privileged install procedure (collaborator boundary).
///
/// Given a target path that already exists as an empty sparse file,
/// populate it with a bootable OS image. Implementations must not report
/// success on a non-zero install exit.
pub trait DiskInstaller {
    /// Install `image` onto the disk file at `target`.
    fn install(&self, image: &ImageId, target: &Path) -> Result<()>;
}

/// Production installer: runs bootc-install inside a privileged podman
/// container with the target disk bind-mounted in, streaming its logs.
#[derive(Debug, Clone)]
pub struct PodmanBootcInstaller {
    /// Image reference to run the install from (digest-pinned).
    reference: String,
}

impl PodmanBootcInstaller {
    /// Create an installer for the given (already pulled) image reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn reference(&self) -> &str {
        &self.reference
    }
}

impl DiskInstaller for PodmanBootcInstaller {
    fn install(&self, image: &ImageId, target: &Path) -> Result<()> {
        let dir = target
            .parent()
            .ok_or_else(|| Error::install("target disk has no parent directory"))?;
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::install("target disk has a non-utf8 name"))?;

        tracing::info!(image = %image.short(), disk = %target.display(), "installing bootc image to disk");

        let mut cmd = std::process::Command::new("podman");
        cmd.args(["run", "--rm", "--privileged", "--pid=host"])
            .args(["--security-opt", "label=type:unconfined_t"])
            .arg("-v")
            .arg(format!("{}:/output", dir.display()))
            .arg(&self.reference)
            .args(["bootc", "install", "to-disk", "--via-loopback", "--generic-image"])
            .arg(format!("/output/{}", name));

        let status = crate::process::run_streaming(cmd, "bootc-install")?;
        if !status.success() {
            return Err(Error::install(format!(
                "bootc install exited with {} for image {}",
                status,
                image.short()
            )));
        }
        Ok(())
    }
}

/// Read the provenance digest off a disk file.
///
/// Any failure (missing attribute, unreadable store, garbage payload)
/// means "unknown provenance" and returns `None`; that is a rebuild
/// trigger, not an error.
fn read_provenance(path: &Path) -> Option<ImageId> {
    let raw = xattr::get(path, PROVENANCE_XATTR).ok().flatten()?;
    let digest = String::from_utf8(raw).ok()?;
    ImageId::parse(digest.trim()).ok()
}

/// Attach the provenance digest to a disk file.
fn write_provenance(path: &Path, digest: &ImageId) -> Result<()> {
    xattr::set(path, PROVENANCE_XATTR, digest.as_str().as_bytes())
        .map_err(|e| Error::storage("set provenance attribute", e.to_string()))
}

/// Ensure a usable disk image for `digest` exists in `entry_dir`.
///
/// Reuses the cached disk when its provenance matches; otherwise builds a
/// fresh one via `installer` and atomically replaces the canonical file.
/// A previously valid disk stays untouched until the replacement rename
/// succeeds.
pub fn ensure_disk(
    entry_dir: &Path,
    digest: &ImageId,
    installer: &dyn DiskInstaller,
) -> Result<DiskOutcome> {
    let disk_path = entry_dir.join(DISK_FILENAME);

    if disk_path.exists() {
        match read_provenance(&disk_path) {
            Some(found) if found == *digest => {
                tracing::debug!(disk = %disk_path.display(), "disk provenance matches, reusing");
                return Ok(DiskOutcome::Reused);
            }
            Some(found) => {
                tracing::info!(
                    cached = %found.short(),
                    requested = %digest.short(),
                    "disk built from different image, rebuilding"
                );
            }
            None => {
                tracing::warn!(disk = %disk_path.display(), "disk provenance unreadable, rebuilding");
            }
        }
    }

    build_disk(entry_dir, &disk_path, digest, installer)?;
    Ok(DiskOutcome::Rebuilt)
}

/// Build a new disk in a temp file and publish it by rename.
fn build_disk(
    entry_dir: &Path,
    disk_path: &Path,
    digest: &ImageId,
    installer: &dyn DiskInstaller,
) -> Result<PathBuf> {
    // Temp file lives in the entry dir so the final rename stays on one
    // filesystem. It is deleted on drop if anything below fails.
    let tmp = tempfile::Builder::new()
        .prefix(".disk-")
        .suffix(".tmp")
        .tempfile_in(entry_dir)
        .map_err(|e| Error::storage("create temp disk", e.to_string()))?;

    tmp.as_file()
        .set_len(DISK_SIZE_BYTES)
        .map_err(|e| Error::storage("allocate sparse disk", e.to_string()))?;

    installer.install(digest, tmp.path())?;
    write_provenance(tmp.path(), digest)?;

    // Sole publication point: readers see the old disk or the new one,
    // never an intermediate state.
    let published = tmp
        .persist(disk_path)
        .map_err(|e| Error::storage("publish disk image", e.error.to_string()))?;
    drop(published);

    tracing::info!(disk = %disk_path.display(), digest = %digest.short(), "disk image published");
    Ok(disk_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn test_digest(fill: char) -> ImageId {
        ImageId::parse(&fill.to_string().repeat(64)).unwrap()
    }

    /// Installer that records invocations and writes a marker payload.
    struct FakeInstaller {
        calls: Cell<usize>,
        payload: RefCell<Vec<u8>>,
        fail: Cell<bool>,
    }

    impl FakeInstaller {
        fn new(payload: &[u8]) -> Self {
            Self {
                calls: Cell::new(0),
                payload: RefCell::new(payload.to_vec()),
                fail: Cell::new(false),
            }
        }
    }

    impl DiskInstaller for FakeInstaller {
        fn install(&self, _image: &ImageId, target: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail.get() {
                return Err(Error::install("simulated install failure"));
            }
            std::fs::write(target, &*self.payload.borrow())?;
            Ok(())
        }
    }

    fn xattrs_supported(dir: &Path) -> bool {
        // Some test filesystems (tmpfs without user_xattr) reject user.*
        // attributes; skip provenance-dependent tests there.
        let probe = dir.join(".xattr-probe");
        std::fs::write(&probe, b"x").unwrap();
        let ok = xattr::set(&probe, "user.bootvm.probe", b"1").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    }

    #[test]
    fn test_first_ensure_builds_then_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        if !xattrs_supported(tmp.path()) {
            eprintln!("skipping: xattrs not supported on test filesystem");
            return;
        }
        let digest = test_digest('a');
        let installer = FakeInstaller::new(b"disk-a");

        let outcome = ensure_disk(tmp.path(), &digest, &installer).unwrap();
        assert_eq!(outcome, DiskOutcome::Rebuilt);
        assert_eq!(installer.calls.get(), 1);

        // Same digest again: zero further install invocations.
        let outcome = ensure_disk(tmp.path(), &digest, &installer).unwrap();
        assert_eq!(outcome, DiskOutcome::Reused);
        assert_eq!(installer.calls.get(), 1);

        let disk = tmp.path().join(DISK_FILENAME);
        assert_eq!(read_provenance(&disk), Some(digest));
    }

    #[test]
    fn test_digest_change_triggers_exactly_one_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        if !xattrs_supported(tmp.path()) {
            eprintln!("skipping: xattrs not supported on test filesystem");
            return;
        }
        let d1 = test_digest('b');
        let d2 = test_digest('c');
        let installer = FakeInstaller::new(b"disk");

        ensure_disk(tmp.path(), &d1, &installer).unwrap();
        assert_eq!(installer.calls.get(), 1);

        let outcome = ensure_disk(tmp.path(), &d2, &installer).unwrap();
        assert_eq!(outcome, DiskOutcome::Rebuilt);
        assert_eq!(installer.calls.get(), 2);
        assert_eq!(
            read_provenance(&tmp.path().join(DISK_FILENAME)),
            Some(d2)
        );
    }

    #[test]
    fn test_missing_provenance_is_rebuild_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        if !xattrs_supported(tmp.path()) {
            eprintln!("skipping: xattrs not supported on test filesystem");
            return;
        }
        let digest = test_digest('d');
        let installer = FakeInstaller::new(b"fresh");

        // A disk file with no provenance record (e.g. copied in by hand).
        std::fs::write(tmp.path().join(DISK_FILENAME), b"stale").unwrap();

        let outcome = ensure_disk(tmp.path(), &digest, &installer).unwrap();
        assert_eq!(outcome, DiskOutcome::Rebuilt);
        assert_eq!(installer.calls.get(), 1);
        assert_eq!(
            std::fs::read(tmp.path().join(DISK_FILENAME)).unwrap(),
            b"fresh"
        );
    }

    #[test]
    fn test_failed_install_leaves_previous_disk_intact() {
        let tmp = tempfile::tempdir().unwrap();
        if !xattrs_supported(tmp.path()) {
            eprintln!("skipping: xattrs not supported on test filesystem");
            return;
        }
        let d1 = test_digest('e');
        let d2 = test_digest('f');
        let installer = FakeInstaller::new(b"good");

        ensure_disk(tmp.path(), &d1, &installer).unwrap();

        installer.fail.set(true);
        let err = ensure_disk(tmp.path(), &d2, &installer).unwrap_err();
        assert!(matches!(err, Error::Install(_)));

        // Canonical path still holds the previous valid disk, and the
        // failed temp artifact is gone.
        let disk = tmp.path().join(DISK_FILENAME);
        assert_eq!(std::fs::read(&disk).unwrap(), b"good");
        assert_eq!(read_provenance(&disk), Some(d1));
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".disk-"))
            .collect();
        assert!(leftovers.is_empty(), "no partial artifacts may remain");
    }

    #[test]
    fn test_failed_install_on_fresh_entry_leaves_no_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let digest = test_digest('1');
        let installer = FakeInstaller::new(b"never");
        installer.fail.set(true);

        assert!(ensure_disk(tmp.path(), &digest, &installer).is_err());
        assert!(!tmp.path().join(DISK_FILENAME).exists());
    }
}
