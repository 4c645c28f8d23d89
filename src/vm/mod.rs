//! VM lifecycle backends.
//!
//! Two backends share one trait: [`domain`] drives a hypervisor's domain
//! API and [`supervised`] supervises helper processes directly. The
//! backend is selected once at startup from the platform, never per call.
//!
//! Lifecycle is a small state machine: Absent, Running, Stopped. The
//! supervised backend collapses Stopped into Absent once the helper
//! process is gone; the domain backend can hold a defined-but-stopped
//! domain alongside a live cache entry.

pub mod domain;
pub mod supervised;

use crate::config::Dirs;
use crate::error::Result;
use crate::ssh;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run-state file kept in the cache entry while a VM is configured.
pub const RUN_STATE_FILENAME: &str = "run.json";
/// Pidfile for the supervised backend's guest helper.
pub const PIDFILE_FILENAME: &str = "run.pid";
/// Cloud-init seed ISO, present only when the caller supplied one.
pub const CIDATA_FILENAME: &str = "cidata.iso";

/// Default wall-clock budget for the guest to reach Running.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters for starting a VM, shared by both backends.
#[derive(Debug, Clone)]
pub struct RunParams {
    /// Guest user to provision and connect as.
    pub user: String,
    /// SSH identity file. `None` means no credential injection and
    /// implies no interactive session.
    pub ssh_identity: Option<PathBuf>,
    /// Host-side port forwarded to the guest's port 22.
    pub ssh_port: u16,
    /// Directory of NoCloud files to pack into a seed ISO.
    pub cloud_init_dir: Option<PathBuf>,
    /// Command to run over SSH once ready. Empty means interactive shell.
    pub command: Vec<String>,
    /// Tear the VM down when the session ends.
    pub remove_on_exit: bool,
    /// Start the VM and return without opening a session.
    pub background: bool,
    /// Guest vCPU count.
    pub cpus: u32,
    /// Guest memory in MiB.
    pub memory_mib: u32,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            ssh_identity: None,
            ssh_port: 0,
            cloud_init_dir: None,
            command: Vec::new(),
            remove_on_exit: false,
            background: false,
            cpus: 2,
            memory_mib: 2048,
        }
    }
}

/// Persisted run state, written next to the disk when a VM starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunState {
    pub ssh_port: u16,
    pub ssh_identity: Option<PathBuf>,
    /// Guest user the credential was provisioned for.
    pub user: String,
    pub repository: String,
    pub tag: String,
}

/// A VM named after its cache entry, with state files in the entry dir.
#[derive(Debug, Clone)]
pub struct VmInstance {
    /// Backend-visible name (the full ImageId string).
    pub name: String,
    /// Cache entry directory holding the disk and run-state files.
    pub dir: PathBuf,
}

impl VmInstance {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    pub fn disk_path(&self) -> PathBuf {
        self.dir.join(crate::disk::DISK_FILENAME)
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.dir.join(RUN_STATE_FILENAME)
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.dir.join(PIDFILE_FILENAME)
    }

    pub fn cidata_path(&self) -> PathBuf {
        self.dir.join(CIDATA_FILENAME)
    }

    pub fn write_run_state(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(self.run_state_path(), json)?;
        Ok(())
    }

    pub fn read_run_state(&self) -> Result<Option<RunState>> {
        match std::fs::read(self.run_state_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_run_state(&self) -> Result<()> {
        match std::fs::remove_file(self.run_state_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// VM lifecycle operations.
///
/// `is_running` and `exists` are pure queries and never mutate. SSH
/// plumbing is identical across backends, so it lives in default methods.
pub trait VmBackend {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Start the VM. Fails with InvalidState if already running, and
    /// blocks until the guest reports Running or the boot timeout hits.
    fn run(&self, vm: &VmInstance, params: &RunParams) -> Result<()>;

    /// Forcibly stop the VM. Idempotent when already stopped.
    fn shutdown(&self, vm: &VmInstance) -> Result<()>;

    /// Remove the persistent definition. Requires the VM to be stopped.
    fn delete(&self, vm: &VmInstance) -> Result<()>;

    /// Shutdown then delete, unconditionally.
    fn force_delete(&self, vm: &VmInstance) -> Result<()> {
        self.shutdown(vm)?;
        self.delete(vm)
    }

    fn is_running(&self, vm: &VmInstance) -> Result<bool>;

    fn exists(&self, vm: &VmInstance) -> Result<bool>;

    fn write_run_state(&self, vm: &VmInstance, state: &RunState) -> Result<()> {
        vm.write_run_state(state)
    }

    /// Block until the guest's sshd answers on the forwarded port.
    fn wait_for_ssh_ready(&self, port: u16) -> Result<()> {
        ssh::wait_for_ready(port, ssh::DEFAULT_READY_TIMEOUT)
    }

    /// Open an SSH session against the forwarded port.
    fn run_ssh(&self, identity: &Path, port: u16, user: &str, command: &[String]) -> Result<i32> {
        ssh::run_ssh(identity, port, user, command)
    }
}

/// Pick the backend for this platform. Done once at startup; callers
/// only ever see the trait.
pub fn create_backend(dirs: &Dirs) -> Box<dyn VmBackend> {
    if cfg!(target_os = "macos") {
        Box::new(supervised::SupervisedBackend::new(dirs.clone()))
    } else {
        Box::new(domain::DomainBackend::new(domain::VirshHypervisor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_json_uses_pascal_case_keys() {
        let state = RunState {
            ssh_port: 2222,
            ssh_identity: Some(PathBuf::from("/home/user/.ssh/id_ed25519")),
            user: "core".to_string(),
            repository: "quay.io/fedora/fedora-bootc".to_string(),
            tag: "42".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["SshPort"], 2222);
        assert_eq!(json["User"], "core");
        assert_eq!(json["Repository"], "quay.io/fedora/fedora-bootc");
        assert_eq!(json["Tag"], "42");
        assert!(json.get("ssh_port").is_none());
    }

    #[test]
    fn test_run_state_round_trip_through_entry_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = VmInstance::new("abc", tmp.path());

        assert!(vm.read_run_state().unwrap().is_none());

        let state = RunState {
            ssh_port: 2222,
            ssh_identity: None,
            user: "root".to_string(),
            repository: "repo".to_string(),
            tag: "latest".to_string(),
        };
        vm.write_run_state(&state).unwrap();

        let loaded = vm.read_run_state().unwrap().unwrap();
        assert_eq!(loaded.ssh_port, 2222);
        assert_eq!(loaded.tag, "latest");

        vm.clear_run_state().unwrap();
        assert!(vm.read_run_state().unwrap().is_none());
        // Clearing twice is fine.
        vm.clear_run_state().unwrap();
    }
}
