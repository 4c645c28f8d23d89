//! Bidirectional byte-relay proxy.
//!
//! Bridges a listening channel to a dialed channel for backends whose
//! guest traffic cannot reach a host-visible socket directly (the guest
//! vsock channel exposed by the guest-execution helper is relayed to the
//! network-bridge helper's unix socket).
//!
//! One engine serves both directions: accept on the listening endpoint,
//! dial the paired endpoint, then pump bytes both ways. The first pump to
//! terminate (EOF, error, or cancellation) tears down the pair; the
//! other pump's own termination is then ignored. Each accepted connection
//! gets an independent pump pair, so one connection's failure never
//! affects the others; accept errors are logged and the loop continues.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One side of the relay.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
    /// TCP socket address.
    Tcp(SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

type RelayStream = Box<dyn Pump + Send + Unpin>;

/// Object-safe byte stream.
trait Pump: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> Pump for T {}

impl Endpoint {
    async fn listen(&self) -> Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                if path.exists() {
                    tokio::fs::remove_file(path).await?;
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Ok(Listener::Unix(UnixListener::bind(path).map_err(|e| {
                    Error::proxy(format!("bind {}: {}", path.display(), e))
                })?))
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await.map_err(
                |e| Error::proxy(format!("bind {}: {}", addr, e)),
            )?)),
        }
    }

    async fn dial(&self) -> std::io::Result<RelayStream> {
        match self {
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        }
    }

    fn owned_socket(&self) -> Option<PathBuf> {
        match self {
            Endpoint::Unix(path) => Some(path.clone()),
            Endpoint::Tcp(_) => None,
        }
    }
}

impl Listener {
    async fn accept(&self) -> std::io::Result<RelayStream> {
        match self {
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// A running relay between two endpoints.
pub struct RelayProxy {
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    owned_socket: Option<PathBuf>,
}

impl RelayProxy {
    /// Start relaying: accept on `listen`, dial `dial` per connection.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// owns the listener socket file (if unix) and the accept task.
    pub async fn spawn(listen: Endpoint, dial: Endpoint) -> Result<Self> {
        let listener = listen.listen().await?;
        let owned_socket = listen.owned_socket();
        let cancel = CancellationToken::new();

        tracing::debug!(listen = %listen, dial = %dial, "relay proxy listening");

        let accept_cancel = cancel.clone();
        let dial = Arc::new(dial);
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = accept_cancel.cancelled() => {
                        tracing::debug!("relay proxy shutting down");
                        break;
                    }

                    accepted = listener.accept() => {
                        match accepted {
                            Ok(conn) => {
                                let dial = Arc::clone(&dial);
                                let conn_cancel = accept_cancel.child_token();
                                tokio::spawn(async move {
                                    if let Err(e) = relay_connection(conn, &dial, conn_cancel).await {
                                        tracing::debug!(error = %e, "relay connection ended with error");
                                    }
                                });
                            }
                            Err(e) => {
                                // One bad accept must not take the proxy down.
                                tracing::warn!(error = %e, "relay accept failed, continuing");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            accept_task: Some(accept_task),
            owned_socket,
        })
    }

    /// Stop the relay and all in-flight connections.
    ///
    /// Safe to call more than once; cancelling an already-cancelled token
    /// is a no-op. Removes the listener socket file if this proxy owns one.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(path) = self.owned_socket.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for RelayProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pump one accepted connection against a freshly dialed peer.
///
/// Two concurrent copy loops; the first to finish (EOF, error, cancel)
/// wins the select and both halves are dropped, closing the pair.
async fn relay_connection(
    accepted: RelayStream,
    dial: &Endpoint,
    cancel: CancellationToken,
) -> Result<()> {
    let dialed = dial
        .dial()
        .await
        .map_err(|e| Error::proxy(format!("dial {}: {}", dial, e)))?;

    let (mut accepted_rx, mut accepted_tx) = tokio::io::split(accepted);
    let (mut dialed_rx, mut dialed_tx) = tokio::io::split(dialed);

    let inbound = tokio::io::copy(&mut accepted_rx, &mut dialed_tx);
    let outbound = tokio::io::copy(&mut dialed_rx, &mut accepted_tx);

    tokio::select! {
        () = cancel.cancelled() => {
            tracing::debug!("relay connection cancelled");
        }
        res = inbound => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "inbound pump ended");
            }
        }
        res = outbound => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "outbound pump ended");
            }
        }
    }

    Ok(())
}
