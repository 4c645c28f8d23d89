//! Supervised-process backend.
//!
//! No hypervisor daemon: the guest runner is an ordinary child process
//! tracked through a pidfile in the cache entry. There is no persistent
//! definition, so Stopped and Absent collapse once the helper is gone
//! and `delete` only clears the state files.

use super::{RunParams, VmBackend, VmInstance};
use crate::cloudinit;
use crate::config::Dirs;
use crate::error::{Error, Result};
use crate::monitor::{self, Session};
use crate::process;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SupervisedBackend {
    dirs: Dirs,
    /// Sessions started by this process, torn down on shutdown. VMs
    /// started by earlier invocations are reached through the pidfile.
    sessions: Mutex<HashMap<String, Session>>,
}

impl SupervisedBackend {
    pub fn new(dirs: Dirs) -> Self {
        Self {
            dirs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn live_pid(&self, vm: &VmInstance) -> Option<libc::pid_t> {
        let pid = process::read_pidfile(&vm.pidfile_path())?;
        if process::is_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    fn clear_pidfile(&self, vm: &VmInstance) -> Result<()> {
        match std::fs::remove_file(vm.pidfile_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the network bridge through its persisted pid and drop the
    /// pidfile. The bridge outlives the invocation that started it, so
    /// a stop from a later invocation must reach it here.
    fn stop_bridge(&self, vm: &VmInstance) -> Result<()> {
        let pidfile =
            monitor::bridge_pidfile(&monitor::session_dir(self.dirs.run_dir(), &vm.name));
        if let Some(pid) = process::read_pidfile(&pidfile) {
            if process::is_alive(pid) {
                process::stop_process(pid, STOP_TIMEOUT, true)?;
            }
        }
        match std::fs::remove_file(&pidfile) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl VmBackend for SupervisedBackend {
    fn name(&self) -> &'static str {
        "supervised"
    }

    fn run(&self, vm: &VmInstance, params: &RunParams) -> Result<()> {
        if self.live_pid(vm).is_some() {
            return Err(Error::invalid_state("stopped", "running"));
        }

        if let Some(dir) = &params.cloud_init_dir {
            cloudinit::create_iso(dir, &vm.cidata_path())?;
        }

        let run_dir = monitor::session_dir(self.dirs.run_dir(), &vm.name);
        let session = Session::start(vm, params, &run_dir)?;

        self.sessions.lock().insert(vm.name.clone(), session);
        Ok(())
    }

    fn shutdown(&self, vm: &VmInstance) -> Result<()> {
        let session = self.sessions.lock().remove(&vm.name);

        if let Some(mut session) = session {
            session.stop()?;
        } else if let Some(pid) = self.live_pid(vm) {
            // Started by an earlier invocation; all we hold are pids.
            process::stop_process(pid, STOP_TIMEOUT, true)?;
        }

        self.stop_bridge(vm)?;
        self.clear_pidfile(vm)
    }

    fn delete(&self, vm: &VmInstance) -> Result<()> {
        if self.live_pid(vm).is_some() {
            return Err(Error::invalid_state("stopped", "running"));
        }
        // Nothing persistent beyond the state files.
        self.clear_pidfile(vm)?;
        vm.clear_run_state()
    }

    fn is_running(&self, vm: &VmInstance) -> Result<bool> {
        Ok(self.live_pid(vm).is_some())
    }

    fn exists(&self, vm: &VmInstance) -> Result<bool> {
        Ok(self.live_pid(vm).is_some() || vm.run_state_path().exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::RunState;

    fn backend(root: &std::path::Path) -> SupervisedBackend {
        SupervisedBackend::new(Dirs::at_root(root))
    }

    #[test]
    fn test_absent_vm_has_no_state() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        assert!(!b.is_running(&vm).unwrap());
        assert!(!b.exists(&vm).unwrap());
    }

    #[test]
    fn test_stale_pidfile_reads_as_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        // A pid that cannot exist on this system.
        std::fs::write(vm.pidfile_path(), "999999999\n").unwrap();
        assert!(!b.is_running(&vm).unwrap());
        // A dead pid is not a definition either.
        assert!(!b.exists(&vm).unwrap());
    }

    #[test]
    fn test_live_pidfile_reads_as_running() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        let pid = unsafe { libc::getpid() };
        std::fs::write(vm.pidfile_path(), format!("{pid}\n")).unwrap();
        assert!(b.is_running(&vm).unwrap());
        assert!(b.exists(&vm).unwrap());
    }

    #[test]
    fn test_run_while_running_is_invalid_state() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        let pid = unsafe { libc::getpid() };
        std::fs::write(vm.pidfile_path(), format!("{pid}\n")).unwrap();

        let err = b.run(&vm, &RunParams::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_delete_refused_while_running() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        let pid = unsafe { libc::getpid() };
        std::fs::write(vm.pidfile_path(), format!("{pid}\n")).unwrap();

        let err = b.delete(&vm).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_delete_clears_state_files() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        std::fs::write(vm.pidfile_path(), "999999999\n").unwrap();
        vm.write_run_state(&RunState {
            ssh_port: 2222,
            ssh_identity: None,
            user: "root".to_string(),
            repository: "repo".to_string(),
            tag: "latest".to_string(),
        })
        .unwrap();
        assert!(b.exists(&vm).unwrap());

        b.delete(&vm).unwrap();
        assert!(!vm.pidfile_path().exists());
        assert!(!vm.run_state_path().exists());
        assert!(!b.exists(&vm).unwrap());
    }

    #[test]
    fn test_shutdown_clears_stale_bridge_pidfile() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        let session_dir = monitor::session_dir(b.dirs.run_dir(), &vm.name);
        std::fs::create_dir_all(&session_dir).unwrap();
        let bridge_pidfile = monitor::bridge_pidfile(&session_dir);
        std::fs::write(vm.pidfile_path(), "999999999\n").unwrap();
        std::fs::write(&bridge_pidfile, "999999999\n").unwrap();

        b.shutdown(&vm).unwrap();
        assert!(!vm.pidfile_path().exists());
        assert!(!bridge_pidfile.exists());
    }

    #[test]
    fn test_shutdown_on_stopped_vm_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let vm = VmInstance::new("abc", tmp.path().join("entry"));
        std::fs::create_dir_all(&vm.dir).unwrap();

        b.shutdown(&vm).unwrap();
        std::fs::write(vm.pidfile_path(), "999999999\n").unwrap();
        b.shutdown(&vm).unwrap();
        assert!(!vm.pidfile_path().exists());
    }
}
