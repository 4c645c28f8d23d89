//! Helper-process supervision for the supervised VM backend.
//!
//! A session is two helper processes plus a relay: the network bridge
//! (gvproxy) owns guest networking end to end and serves a datagram
//! socket that the guest runner's (vfkit) NIC dials directly, while a
//! relay proxy carries the guest's vsock control channel to the
//! bridge's control socket. The network path runs entirely between the
//! two helpers, so a backgrounded VM keeps its connectivity after this
//! process exits; only the vsock control channel is session-scoped.
//!
//! Startup order is load-bearing: bridge first, wait for its network
//! socket file, then relay, then runner. Both helpers' pids are
//! persisted before start counts as successful; if a pidfile cannot be
//! written the helpers are killed rather than left orphaned. Teardown
//! runs in reverse.

use crate::error::{Error, Result};
use crate::process::{self, ChildProcess};
use crate::proxy::{Endpoint, RelayProxy};
use crate::ssh;
use crate::vm::{RunParams, VmInstance};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Socket-file wait: best effort, existence does not prove the listener
/// accepts yet.
const SOCKET_WAIT_ATTEMPTS: u32 = 5;
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(200);

const HELPER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Network bridge control socket, in the per-VM run directory.
const BRIDGE_SOCKET: &str = "bridge.sock";
/// Bridge-owned datagram socket the guest runner's NIC dials.
const NETWORK_SOCKET: &str = "net.sock";
/// Unix socket the runner exposes the guest's vsock control port on.
const VSOCK_SOCKET: &str = "vsock.sock";
/// Guest-side vsock port of the control channel.
const VSOCK_CONTROL_PORT: u32 = 1024;
/// Pidfile for the network bridge, next to its sockets.
const BRIDGE_PIDFILE: &str = "bridge.pid";

/// A started helper-process session.
pub struct Session {
    runtime: tokio::runtime::Runtime,
    bridge: ChildProcess,
    bridge_pidfile: PathBuf,
    proxy: Option<RelayProxy>,
    runner: ChildProcess,
}

impl Session {
    /// Start the helpers for `vm` and persist both helpers' pids.
    pub fn start(vm: &VmInstance, params: &RunParams, run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let bridge_socket = run_dir.join(BRIDGE_SOCKET);
        let network_socket = run_dir.join(NETWORK_SOCKET);
        let vsock_socket = run_dir.join(VSOCK_SOCKET);
        let bridge_pidfile = bridge_pidfile(run_dir);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| Error::command_failed("tokio runtime", e.to_string()))?;

        let mut bridge = spawn_helper(
            bridge_command(&bridge_socket, &network_socket, params.ssh_port),
            "gvproxy",
        )?;

        if !wait_for_socket(&network_socket) {
            tracing::warn!(
                socket = %network_socket.display(),
                "bridge network socket did not appear, continuing anyway"
            );
        }

        // Reap the bridge's exit for the log. Diagnostics only; session
        // correctness never depends on this thread.
        let bridge_pid = bridge.pid();
        std::thread::spawn(move || {
            let code = process::wait(bridge_pid);
            tracing::debug!(pid = bridge_pid, code, "network bridge exited");
        });

        // Control channel only. The guest's vsock port is relayed to the
        // bridge's control socket for this invocation's lifetime; the
        // network path is the bridge-owned socket above and never passes
        // through this process.
        let proxy = match runtime.block_on(RelayProxy::spawn(
            Endpoint::Unix(vsock_socket.clone()),
            Endpoint::Unix(bridge_socket),
        )) {
            Ok(proxy) => proxy,
            Err(e) => {
                let _ = bridge.stop(HELPER_STOP_TIMEOUT, true);
                return Err(e);
            }
        };

        let runner_cmd = match runner_command(vm, params, &network_socket, &vsock_socket) {
            Ok(cmd) => cmd,
            Err(e) => {
                let _ = bridge.stop(HELPER_STOP_TIMEOUT, true);
                return Err(e);
            }
        };
        let mut runner = match spawn_helper(runner_cmd, "vfkit") {
            Ok(runner) => runner,
            Err(e) => {
                let _ = bridge.stop(HELPER_STOP_TIMEOUT, true);
                return Err(e);
            }
        };

        if let Err(e) = process::write_pidfile(&bridge_pidfile, bridge_pid)
            .and_then(|()| process::write_pidfile(&vm.pidfile_path(), runner.pid()))
        {
            // Without the pidfiles nothing can find these helpers again.
            tracing::warn!(error = %e, "pidfile write failed, killing helpers");
            let _ = runner.stop(HELPER_STOP_TIMEOUT, true);
            let _ = bridge.stop(HELPER_STOP_TIMEOUT, true);
            let _ = std::fs::remove_file(&bridge_pidfile);
            return Err(e);
        }

        tracing::debug!(
            runner_pid = runner.pid(),
            bridge_pid,
            "helper session started"
        );

        Ok(Self {
            runtime,
            bridge,
            bridge_pidfile,
            proxy: Some(proxy),
            runner,
        })
    }

    pub fn runner_pid(&self) -> libc::pid_t {
        self.runner.pid()
    }

    pub fn runner_is_running(&mut self) -> bool {
        self.runner.is_running()
    }

    /// Tear the session down in reverse start order.
    pub fn stop(&mut self) -> Result<()> {
        let mut first_err = None;

        if let Err(e) = self.runner.stop(HELPER_STOP_TIMEOUT, true) {
            first_err.get_or_insert(e);
        }
        if let Some(mut proxy) = self.proxy.take() {
            let _guard = self.runtime.enter();
            proxy.stop();
        }
        if let Err(e) = self.bridge.stop(HELPER_STOP_TIMEOUT, true) {
            // Best-effort cleanup failure; the runner error wins.
            tracing::warn!(error = %e, "network bridge stop failed");
            first_err.get_or_insert(e);
        }
        let _ = std::fs::remove_file(&self.bridge_pidfile);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_helper(mut cmd: Command, label: &str) -> Result<ChildProcess> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|e| Error::command_failed(label, e.to_string()))?;
    tracing::debug!(helper = label, pid = child.id(), "helper started");
    Ok(ChildProcess::new(child.id() as libc::pid_t))
}

fn bridge_command(control_socket: &Path, network_socket: &Path, ssh_port: u16) -> Command {
    let mut cmd = Command::new("gvproxy");
    cmd.arg("-listen")
        .arg(format!("unix://{}", control_socket.display()))
        .arg("-listen-vfkit")
        .arg(format!("unixgram://{}", network_socket.display()))
        .arg("-ssh-port")
        .arg(ssh_port.to_string());
    cmd
}

fn runner_command(
    vm: &VmInstance,
    params: &RunParams,
    net_socket: &Path,
    vsock_socket: &Path,
) -> Result<Command> {
    let mut cmd = Command::new("vfkit");
    for arg in runner_args(vm, params, net_socket, vsock_socket)? {
        cmd.arg(arg);
    }
    Ok(cmd)
}

/// Argument list for the guest runner. Kept separate from process spawn
/// so the shape is testable without the binary installed.
fn runner_args(
    vm: &VmInstance,
    params: &RunParams,
    net_socket: &Path,
    vsock_socket: &Path,
) -> Result<Vec<String>> {
    let mut args = vec![
        "--cpus".to_string(),
        params.cpus.to_string(),
        "--memory".to_string(),
        params.memory_mib.to_string(),
        "--bootloader".to_string(),
        "efi,create".to_string(),
        "--device".to_string(),
        format!("virtio-blk,path={}", vm.disk_path().display()),
        "--device".to_string(),
        format!("virtio-net,unixSocketPath={}", net_socket.display()),
        "--device".to_string(),
        format!(
            "virtio-vsock,port={VSOCK_CONTROL_PORT},socketURL={}",
            vsock_socket.display()
        ),
    ];

    if let Some(identity) = &params.ssh_identity {
        let pubkey = identity.with_extension("pub");
        let payload = ssh::build_credential_payload(&params.user, &pubkey)?;
        args.push("--oem-string".to_string());
        args.push(format!("io.systemd.credential.binary:bootvm.provision={payload}"));
    }

    if params.cloud_init_dir.is_some() {
        args.push("--device".to_string());
        args.push(format!(
            "virtio-blk,path={},readonly",
            vm.cidata_path().display()
        ));
    }

    Ok(args)
}

fn wait_for_socket(path: &Path) -> bool {
    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        if path.exists() {
            return true;
        }
        std::thread::sleep(SOCKET_WAIT_INTERVAL);
    }
    path.exists()
}

/// Per-VM run directory under the process run dir.
pub fn session_dir(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(name)
}

/// Pidfile of the network bridge for a session dir. The bridge outlives
/// the invocation that started it, so later invocations need its pid.
pub fn bridge_pidfile(session_dir: &Path) -> PathBuf {
    session_dir.join(BRIDGE_PIDFILE)
}
