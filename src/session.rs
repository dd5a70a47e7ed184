//! Connection session lifecycle.
//!
//! One `ConnectionSession` per reconnection token, coordinating the worker
//! supervisor and the client transport across the initial connection, any
//! number of reconnections, and termination. All teardown funnels into a
//! single idempotent cleanup routine; a session closes on worker exit,
//! worker spawn error, or explicit disposal — never on client disconnect
//! alone.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{HandoffMode, ServerConfig};
use crate::connection::ConnectionData;
use crate::environment::{EnvironmentParams, build_worker_environment};
use crate::supervisor::{self, SupervisorError, WorkerEvent, WorkerHandle};
use crate::transport::Transport;

/// Session error types.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation on a disposed session.
    #[error("Session is disposed")]
    Disposed,

    /// Operation valid only in a different lifecycle state.
    #[error("Invalid session state: {0:?}")]
    InvalidState(SessionState),

    /// Worker spawn failed. Fatal: the session transitions to Closed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no worker yet.
    Idle,
    /// Worker spawn requested.
    Spawning,
    /// Worker ready, data flowing.
    Active,
    /// Terminal.
    Closed,
}

/// Worker exit diagnostics (code, signal).
pub type ExitDiagnostics = (Option<i32>, Option<i32>);

struct SessionInner {
    state: SessionState,
    remote_addr: String,
    worker: Option<WorkerHandle>,
    worker_ready: bool,
    /// Present only while waiting for a not-yet-ready worker or during a
    /// reconnection handoff. A newer reconnection replaces it.
    pending: Option<ConnectionData>,
    disposed: bool,
    last_exit: Option<ExitDiagnostics>,
}

/// The stateful object bound to one logical client session.
pub struct ConnectionSession {
    token: String,
    config: Arc<ServerConfig>,
    closure_tx: mpsc::UnboundedSender<String>,
    inner: Mutex<SessionInner>,
}

/// Shortens a reconnection token for log correlation. Only the prefix is
/// ever displayed.
#[must_use]
pub fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

impl ConnectionSession {
    /// Creates an idle session for `token`.
    ///
    /// `closure_tx` receives the token exactly once, when the session
    /// closes.
    #[must_use]
    pub fn new(
        token: String,
        remote_addr: String,
        config: Arc<ServerConfig>,
        closure_tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            config,
            closure_tx,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                remote_addr,
                worker: None,
                worker_ready: false,
                pending: None,
                disposed: false,
                last_exit: None,
            }),
        })
    }

    /// Reconnection token identifying this session.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Remote address of the most recent client connection.
    pub async fn remote_addr(&self) -> String {
        self.inner.lock().await.remote_addr.clone()
    }

    /// Exit diagnostics recorded when the worker terminated, if it has.
    pub async fn last_exit(&self) -> Option<ExitDiagnostics> {
        self.inner.lock().await.last_exit
    }

    /// Starts the session: builds the worker environment, spawns the
    /// worker, and queues `data` for delivery once the worker is ready.
    ///
    /// Spawn failure is fatal: the session transitions directly to Closed,
    /// emits its one closure notification, and the pending transport is
    /// closed without data written.
    pub async fn start(
        self: &Arc<Self>,
        data: ConnectionData,
        env_params: EnvironmentParams,
    ) -> Result<(), SessionError> {
        let remote_addr;
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                drop(inner);
                data.close().await;
                return Err(SessionError::Disposed);
            }
            if inner.state != SessionState::Idle {
                let state = inner.state;
                drop(inner);
                data.close().await;
                return Err(SessionError::InvalidState(state));
            }
            inner.state = SessionState::Spawning;
            inner.pending = Some(data);
            remote_addr = inner.remote_addr.clone();
        }

        info!(
            "[{}] Starting session, spawning extension host",
            token_prefix(&self.token)
        );

        let environment = build_worker_environment(env_params, &self.config);
        let exec_args = supervisor::worker_exec_args(&self.config);

        let spawned = supervisor::spawn_worker(&self.config, &environment, &exec_args);
        let mut worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                error!(
                    "[{}] Worker spawn failed (remote {remote_addr}): {e}",
                    token_prefix(&self.token)
                );
                self.cleanup().await;
                return Err(e.into());
            }
        };

        let events = worker.take_events();
        let endpoint_mode = worker.mode() == HandoffMode::NamedEndpoint;

        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                // Disposed while spawning: that cleanup could not see this
                // worker, so kill it here.
                worker.kill();
                return Err(SessionError::Disposed);
            }
            inner.worker = Some(worker);
        }

        if let Some(events) = events {
            let session = Arc::clone(self);
            tokio::spawn(session.run_event_pump(events));
        }

        if endpoint_mode {
            // Listening-endpoint mode: readiness is the worker's first
            // endpoint connection, which delivery itself waits for.
            self.mark_ready().await;
        }

        Ok(())
    }

    /// Accepts a reconnection for this session.
    ///
    /// Updates the remote address and hands the new connection to the live
    /// worker. If the worker is not ready yet, the new connection replaces
    /// any held, undelivered one — the superseded transport is closed, and
    /// only the newest client connection survives. That discard is an
    /// accepted data-loss boundary of the pre-readiness race.
    pub async fn accept_reconnection(
        &self,
        remote_addr: String,
        transport: Transport,
        initial_chunk: Vec<u8>,
    ) -> Result<(), SessionError> {
        let data = ConnectionData::new(transport, initial_chunk);

        let superseded;
        let deliver_now;
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                drop(inner);
                data.close().await;
                return Err(SessionError::Disposed);
            }

            debug!(
                "[{}] Reconnection from {remote_addr}",
                token_prefix(&self.token)
            );
            inner.remote_addr = remote_addr;
            superseded = inner.pending.replace(data);
            deliver_now = inner.worker_ready && inner.worker.is_some();
        }

        if let Some(old) = superseded {
            debug!(
                "[{}] Discarding superseded connection",
                token_prefix(&self.token)
            );
            old.close().await;
        }

        if deliver_now {
            self.deliver_pending().await;
        }

        Ok(())
    }

    /// Asks the worker to shorten its internal reconnection grace time.
    /// No-op when no worker is live.
    pub async fn shorten_grace_time(&self) {
        let inner = self.inner.lock().await;
        if let Some(ref worker) = inner.worker {
            worker.shorten_grace_time();
        }
    }

    /// Explicitly disposes the session.
    pub async fn dispose(&self) {
        self.cleanup().await;
    }

    /// Whether the session has been disposed.
    pub async fn is_disposed(&self) -> bool {
        self.inner.lock().await.disposed
    }

    async fn run_event_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Ready => {
                    debug!("[{}] Worker ready", token_prefix(&self.token));
                    self.mark_ready().await;
                }
                WorkerEvent::Log(entry) => {
                    self.forward_log(&entry.severity, &entry.message);
                }
                WorkerEvent::Exited { code, signal } => {
                    info!(
                        "[{}] Worker exited (code {code:?}, signal {signal:?})",
                        token_prefix(&self.token)
                    );
                    self.inner.lock().await.last_exit = Some((code, signal));
                    self.cleanup().await;
                    break;
                }
            }
        }
    }

    fn forward_log(&self, severity: &str, message: &str) {
        let prefix = token_prefix(&self.token);
        match severity {
            "trace" | "debug" => debug!("[{prefix}] worker: {message}"),
            "warn" => warn!("[{prefix}] worker: {message}"),
            "error" => error!("[{prefix}] worker: {message}"),
            _ => info!("[{prefix}] worker: {message}"),
        }
    }

    /// Marks the worker ready and delivers any pending connection.
    async fn mark_ready(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            inner.worker_ready = true;
            if inner.state == SessionState::Spawning {
                inner.state = SessionState::Active;
            }
        }
        self.deliver_pending().await;
    }

    /// Drains and hands the most recent pending connection to the worker.
    ///
    /// Handoff failures tear down that connection only; whether the session
    /// dies is decided by the worker exit monitor, not here.
    async fn deliver_pending(&self) {
        let mut inner = self.inner.lock().await;
        let Some(data) = inner.pending.take() else {
            return;
        };
        let remote_addr = inner.remote_addr.clone();
        let Some(ref mut worker) = inner.worker else {
            inner.pending = Some(data);
            return;
        };

        match worker.deliver(data).await {
            Ok(()) => {
                debug!(
                    "[{}] Connection handed to worker",
                    token_prefix(&self.token)
                );
            }
            Err(e) => {
                warn!(
                    "[{}] Connection handoff failed (remote {remote_addr}): {e}",
                    token_prefix(&self.token)
                );
            }
        }
    }

    /// The single cleanup routine. Idempotent: every path that ends the
    /// session funnels here, and only the first call has any effect.
    ///
    /// Closes the held transport, kills the worker if one is live, drops
    /// internal references and emits exactly one closure notification.
    pub async fn cleanup(&self) {
        let pending;
        let worker;
        let remote_addr;
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.state = SessionState::Closed;
            inner.worker_ready = false;
            pending = inner.pending.take();
            worker = inner.worker.take();
            remote_addr = inner.remote_addr.clone();
        }

        info!(
            "[{}] Closing session (remote {remote_addr})",
            token_prefix(&self.token)
        );

        if let Some(data) = pending {
            data.close().await;
        }
        if let Some(worker) = worker {
            worker.kill();
        }

        let _ = self.closure_tx.send(self.token.clone());
    }
}
