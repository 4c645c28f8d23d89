//! Process management utilities.
//!
//! Liveness checks, signal delivery, graceful stop, pid-file handling
//! for supervised VM helper processes, and a small log-streaming
//! pipeline for collaborator subprocesses.

use crate::error::{Error, Result};
use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};

/// Default timeout for graceful shutdown before SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait after SIGKILL before reaping.
const SIGKILL_WAIT: Duration = Duration::from_millis(50);

/// Poll interval while waiting for a process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Wait for a process to exit (non-blocking check).
///
/// Returns `Some(exit_code)` if the process has exited, `None` if still
/// running. Handles EINTR by retrying the waitpid call.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    loop {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

        if result == pid {
            let exit_code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            };
            return Some(exit_code);
        } else if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // Not our child or already reaped.
            return Some(-1);
        } else {
            return None;
        }
    }
}

/// Wait for a process to exit (blocking). Handles EINTR.
pub fn wait(pid: libc::pid_t) -> i32 {
    loop {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return -1;
        }

        return if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        };
    }
}

/// Send SIGTERM. Returns true if the signal was delivered.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL. Returns true if the signal was delivered.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Gracefully stop a process.
///
/// Sends SIGTERM, waits up to `timeout` for exit, then SIGKILLs if
/// `force` is set. Returns the exit code when it could be collected.
pub fn stop_process(pid: libc::pid_t, timeout: Duration, force: bool) -> Result<i32> {
    if !is_alive(pid) {
        return Ok(try_wait(pid).unwrap_or(0));
    }

    if !terminate(pid) {
        // Died between the liveness check and the signal.
        return Ok(try_wait(pid).unwrap_or(-1));
    }

    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(code) = try_wait(pid) {
            return Ok(code);
        }
        if !is_alive(pid) {
            return Ok(try_wait(pid).unwrap_or(-1));
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }

    if force {
        tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
        kill(pid);
        std::thread::sleep(SIGKILL_WAIT);
        Ok(try_wait(pid).unwrap_or_else(|| wait(pid)))
    } else {
        Err(Error::command_failed(
            "stop process",
            format!("timeout waiting for process {} to stop", pid),
        ))
    }
}

/// A handle to a running helper process.
#[derive(Debug)]
pub struct ChildProcess {
    pid: libc::pid_t,
    exit_code: Option<i32>,
}

impl ChildProcess {
    /// Wrap an already-spawned process by pid.
    pub fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            exit_code: None,
        }
    }

    /// The process id.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        if let Some(code) = try_wait(self.pid) {
            self.exit_code = Some(code);
            false
        } else {
            is_alive(self.pid)
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = wait(self.pid);
        self.exit_code = Some(code);
        code
    }

    /// Gracefully stop the process (SIGTERM, poll, optional SIGKILL).
    pub fn stop(&mut self, timeout: Duration, force: bool) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = stop_process(self.pid, timeout, force)?;
        self.exit_code = Some(code);
        Ok(code)
    }
}

// ============================================================================
// Pid files
// ============================================================================

/// Write a pid file (decimal pid, trailing newline).
pub fn write_pidfile(path: &Path, pid: libc::pid_t) -> Result<()> {
    std::fs::write(path, format!("{}\n", pid))
        .map_err(|e| Error::storage("write pid file", e.to_string()))
}

/// Read a pid file. Returns `None` if the file is absent or holds
/// anything but a decimal pid.
pub fn read_pidfile(path: &Path) -> Option<libc::pid_t> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse::<libc::pid_t>().ok()
}

// ============================================================================
// Log streaming
// ============================================================================

/// Run a collaborator subprocess, streaming its stdout/stderr into the
/// log at debug level, and return its exit status.
///
/// One reader thread per stream; both are joined before the exit status
/// is reported, so no output is lost to the exit race.
pub fn run_streaming(
    mut cmd: std::process::Command,
    label: &str,
) -> Result<std::process::ExitStatus> {
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::command_failed(label, e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_label = label.to_string();
    let out_reader = std::thread::spawn(move || {
        if let Some(stdout) = stdout {
            for line in std::io::BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                tracing::debug!(helper = %out_label, "{}", line);
            }
        }
    });

    let err_label = label.to_string();
    let err_reader = std::thread::spawn(move || {
        if let Some(stderr) = stderr {
            for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                tracing::debug!(helper = %err_label, "{}", line);
            }
        }
    });

    let status = child
        .wait()
        .map_err(|e| Error::command_failed(label, e.to_string()))?;

    let _ = out_reader.join();
    let _ = err_reader.join();

    Ok(status)
}
