//! Single-use listening endpoint and byte relay.
//!
//! Fallback handoff strategy when the raw handle cannot be passed to the
//! worker directly: a uniquely named local endpoint is opened, the worker
//! connects to it exactly once, and a byte-for-byte relay pipes traffic
//! between that connection and the client transport. Either side closing
//! or erroring tears down both through one shared cancellation token.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionData;

use super::SupervisorError;

/// Relay copy buffer size.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// A uniquely named, single-use local endpoint.
///
/// The listener accepts exactly one connection; afterwards the socket file
/// is removed so further connection attempts are refused.
pub struct SingleUseEndpoint {
    listener: Option<UnixListener>,
    path: PathBuf,
}

impl SingleUseEndpoint {
    /// Binds a fresh endpoint with a randomly generated name under `dir`.
    pub fn bind(dir: &Path) -> Result<Self, SupervisorError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(SupervisorError::ControlSocket)?;
        }
        let path = dir.join(format!("exthostd-conn-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&path).map_err(SupervisorError::ControlSocket)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        debug!("Single-use endpoint bound at {:?}", path);

        Ok(Self {
            listener: Some(listener),
            path,
        })
    }

    /// Endpoint address, for the worker's environment or handoff message.
    #[must_use]
    pub fn address(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Waits for the worker's one connection, closes the endpoint, and
    /// starts the relay against `data`'s transport.
    ///
    /// The initial chunk and any handshake replay bytes are written to the
    /// worker before live traffic, preserving byte order across the handoff
    /// boundary.
    pub async fn accept_and_relay(
        mut self,
        mut data: ConnectionData,
        wait: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let Some(listener) = self.listener.take() else {
            data.close().await;
            return Err(SupervisorError::ControlClosed);
        };
        let accepted = timeout(wait, listener.accept())
            .await
            .map_err(|_| SupervisorError::ControlTimeout(wait));

        // Single-use: refuse any second connection attempt.
        drop(listener);
        let _ = std::fs::remove_file(&self.path);

        let (worker_conn, _) = match accepted {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                data.close().await;
                return Err(SupervisorError::ControlSocket(e));
            }
            Err(e) => {
                data.close().await;
                return Err(e);
            }
        };

        data.drain().await.map_err(SupervisorError::Transport)?;

        let (transport, initial_chunk) = data.into_parts();
        let replay = transport.replay_state().replay;

        tokio::spawn(run_relay(
            transport.into_stream(),
            worker_conn,
            replay,
            initial_chunk,
            cancel,
        ));

        Ok(())
    }
}

impl Drop for SingleUseEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pipes bytes both ways until either side closes, errors, or the shared
/// token is cancelled. Both sides are shut down together.
async fn run_relay(
    client: tokio::net::TcpStream,
    worker: UnixStream,
    replay: Vec<u8>,
    initial_chunk: Vec<u8>,
    cancel: CancellationToken,
) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut worker_read, mut worker_write) = tokio::io::split(worker);

    // Handshake replay first, then the pre-capture chunk, then live bytes.
    for preface in [&replay, &initial_chunk] {
        if !preface.is_empty() {
            if let Err(e) = worker_write.write_all(preface).await {
                warn!("Relay preface write failed: {e}");
                cancel.cancel();
                return;
            }
        }
    }

    let to_worker = {
        let cancel = cancel.clone();
        async move {
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    read = client_read.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if worker_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
            let _ = worker_write.shutdown().await;
        }
    };

    let to_client = {
        let cancel = cancel.clone();
        async move {
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    read = worker_read.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if client_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
            let _ = client_write.shutdown().await;
        }
    };

    tokio::join!(to_worker, to_client);
    debug!("Relay closed");
}
