//! SSH plumbing: host port allocation, guest readiness, credential
//! injection payloads, and the interactive `ssh` subprocess.

use crate::error::{Error, Result};
use base64::Engine;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

/// Default wall-clock budget for the guest's sshd to come up.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ask the kernel for a free TCP port on loopback.
///
/// The port is released before we return, so another process can grab it
/// before the VM binds it. In practice the window is tiny and a collision
/// surfaces immediately as a boot-time forwarding failure, which is
/// simpler to act on than reserving ports out of band.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Poll the forwarded port until sshd answers with its version banner.
///
/// A bare TCP accept is not enough: the host-side forwarder accepts
/// connections before the guest service exists. Only an "SSH-" banner
/// proves sshd is really behind the port.
pub fn wait_for_ready(port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    loop {
        if try_banner(addr) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::SshTimeout {
                port,
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

fn try_banner(addr: SocketAddr) -> bool {
    let Ok(stream) = TcpStream::connect_timeout(&addr, Duration::from_secs(1)) else {
        return false;
    };
    if stream.set_read_timeout(Some(Duration::from_secs(2))).is_err() {
        return false;
    }
    let mut buf = [0u8; 4];
    let mut stream = stream;
    match stream.read_exact(&mut buf) {
        Ok(()) => &buf == b"SSH-",
        Err(_) => false,
    }
}

/// Build the boot-time credential payload that provisions `user` with the
/// public key at `pubkey_path`.
///
/// The payload is a shell script the guest runs once at first boot. The
/// key bytes are embedded base64-encoded so the script survives any quoting
/// the delivery channel applies, and the whole script is base64-encoded
/// again for the same reason. The receiving side decodes once and pipes
/// the result to a shell.
pub fn build_credential_payload(user: &str, pubkey_path: &Path) -> Result<String> {
    let key = std::fs::read(pubkey_path)?;
    let key_b64 = base64::engine::general_purpose::STANDARD.encode(&key);

    let home = if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    };

    let script = format!(
        "#!/bin/sh\n\
         set -e\n\
         mkdir -p {home}/.ssh\n\
         chmod 0750 {home}/.ssh\n\
         echo {key_b64} | base64 -d > {home}/.ssh/authorized_keys\n\
         chmod 0700 {home}/.ssh/authorized_keys\n\
         chown -R {user}:{user} {home}/.ssh\n"
    );

    Ok(base64::engine::general_purpose::STANDARD.encode(script))
}

/// Run `ssh` against the forwarded port, inheriting our stdio so the
/// session is interactive. Returns the remote command's exit code.
///
/// Host key checking is disabled: the guest regenerates its host key on
/// every fresh disk, so pinning it would only produce spurious mismatch
/// aborts against localhost.
pub fn run_ssh(identity: &Path, port: u16, user: &str, command: &[String]) -> Result<i32> {
    let mut cmd = Command::new("ssh");
    cmd.arg("-i")
        .arg(identity)
        .arg("-p")
        .arg(port.to_string())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("LogLevel=ERROR")
        .arg(format!("{user}@127.0.0.1"));
    cmd.args(command);

    tracing::debug!(port, user, "starting ssh session");

    let status = cmd
        .status()
        .map_err(|e| Error::command_failed("ssh", e.to_string()))?;

    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_allocate_port_returns_bindable_port() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // The port was released, so we can bind it again right away.
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn test_wait_for_ready_accepts_ssh_banner() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n");
            }
        });
        wait_for_ready(port, Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_wait_for_ready_times_out_without_banner() {
        // Listener that accepts but never speaks.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let conns: Vec<_> = listener.incoming().take(5).collect();
            drop(conns);
        });
        let err = wait_for_ready(port, Duration::from_secs(3)).unwrap_err();
        assert!(matches!(err, Error::SshTimeout { .. }));
    }

    #[test]
    fn test_credential_payload_embeds_key_and_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let key_path = tmp.path().join("id_ed25519.pub");
        let key = b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA test@host\n";
        std::fs::write(&key_path, key).unwrap();

        let payload = build_credential_payload("core", &key_path).unwrap();
        let script = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        let script = String::from_utf8(script).unwrap();

        let key_b64 = base64::engine::general_purpose::STANDARD.encode(key);
        assert!(script.contains(&key_b64));
        assert!(script.contains("/home/core/.ssh"));
        assert!(script.contains("chmod 0750 /home/core/.ssh"));
        assert!(script.contains("chmod 0700 /home/core/.ssh/authorized_keys"));
        assert!(script.contains("chown -R core:core"));
    }

    #[test]
    fn test_credential_payload_root_home() {
        let tmp = tempfile::tempdir().unwrap();
        let key_path = tmp.path().join("key.pub");
        std::fs::write(&key_path, b"ssh-ed25519 AAAA root@host\n").unwrap();

        let payload = build_credential_payload("root", &key_path).unwrap();
        let script = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        let script = String::from_utf8(script).unwrap();
        assert!(script.contains("/root/.ssh"));
        assert!(!script.contains("/home/root"));
    }
}
