//! Session registry.
//!
//! Owns all live sessions keyed by reconnection token. The first
//! connection for a token creates a session; a connection carrying a known
//! token is routed to the existing session as a reconnection. Sessions
//! remove themselves through their closure notification.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connection::ConnectionData;
use crate::environment::EnvironmentParams;
use crate::session::{ConnectionSession, SessionError, token_prefix};
use crate::transport::Transport;

/// How an inbound connection was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A new session was created and its worker spawn started.
    Created,
    /// An existing session accepted the connection as a reconnection.
    Reconnected,
}

/// Registry of live sessions, one per reconnection token.
pub struct SessionRegistry {
    config: Arc<ServerConfig>,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
    closure_tx: mpsc::UnboundedSender<String>,
}

impl SessionRegistry {
    /// Creates the registry and starts its removal task.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        let (closure_tx, closure_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            closure_tx,
        });

        tokio::spawn(Arc::clone(&registry).remove_closed(closure_rx));

        registry
    }

    /// Routes an accepted client connection by its reconnection token.
    ///
    /// Unknown token: a session is created and started. Known token: the
    /// session receives the connection as a reconnection. Lookup and insert
    /// happen under one lock acquisition, so two simultaneous first
    /// connections for the same token resolve to a single session.
    pub async fn accept_connection(
        self: &Arc<Self>,
        token: String,
        remote_addr: String,
        transport: Transport,
        initial_chunk: Vec<u8>,
        env_params: EnvironmentParams,
    ) -> Result<AcceptOutcome, SessionError> {
        let (session, created) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&token) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let session = ConnectionSession::new(
                        token.clone(),
                        remote_addr.clone(),
                        Arc::clone(&self.config),
                        self.closure_tx.clone(),
                    );
                    sessions.insert(token.clone(), Arc::clone(&session));
                    (session, true)
                }
            }
        };

        if !created {
            session
                .accept_reconnection(remote_addr, transport, initial_chunk)
                .await?;
            return Ok(AcceptOutcome::Reconnected);
        }

        info!(
            "[{}] New session from {remote_addr}",
            token_prefix(&token)
        );
        let data = ConnectionData::new(transport, initial_chunk);
        session.start(data, env_params).await?;

        Ok(AcceptOutcome::Created)
    }

    /// Looks a session up by token.
    pub async fn get(&self, token: &str) -> Option<Arc<ConnectionSession>> {
        self.sessions.lock().await.get(token).cloned()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Disposes every session. Used at server shutdown.
    pub async fn dispose_all(&self) {
        let sessions: Vec<_> = {
            let map = self.sessions.lock().await;
            map.values().cloned().collect()
        };
        for session in sessions {
            session.dispose().await;
        }
    }

    async fn remove_closed(
        self: Arc<Self>,
        mut closure_rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(token) = closure_rx.recv().await {
            if self.sessions.lock().await.remove(&token).is_some() {
                debug!("[{}] Session removed from registry", token_prefix(&token));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = SessionRegistry::new(Arc::new(ServerConfig::default()));
        assert_eq!(registry.count().await, 0);
        assert!(registry.get("absent").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_same_token_connections_share_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            worker_command: "/bin/sh".to_string(),
            worker_args: vec!["-c".to_string(), "sleep 30".to_string()],
            socket_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let registry = SessionRegistry::new(Arc::new(config));

        let mut clients = Vec::new();
        let mut accepts = Vec::new();
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            clients.push(tokio::net::TcpStream::connect(addr).await.unwrap());
            let (server, _) = listener.accept().await.unwrap();

            let registry = Arc::clone(&registry);
            accepts.push(tokio::spawn(async move {
                registry
                    .accept_connection(
                        "tok-race".to_string(),
                        addr.to_string(),
                        Transport::plain(server),
                        Vec::new(),
                        EnvironmentParams::default(),
                    )
                    .await
            }));
        }

        let mut outcomes = Vec::new();
        for accept in accepts {
            outcomes.push(accept.await.unwrap().unwrap());
        }

        assert_eq!(registry.count().await, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == AcceptOutcome::Created)
                .count(),
            1,
            "exactly one connection creates the session"
        );

        registry.dispose_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            worker_command: "/nonexistent/worker".to_string(),
            socket_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let registry = SessionRegistry::new(Arc::new(config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();

        let result = registry
            .accept_connection(
                "tok-1".to_string(),
                addr.to_string(),
                Transport::plain(client),
                Vec::new(),
                EnvironmentParams::default(),
            )
            .await;
        assert!(result.is_err());

        // Closure notification drains asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(registry.count().await, 0);
    }
}
