//! Server configuration.
//!
//! Handles loading and parsing the exthostd.toml configuration file.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration file name.
const CONFIG_FILE: &str = "exthostd.toml";

/// Default listen address for client connections.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";

/// Default worker readiness timeout in milliseconds.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;

/// Handoff strategy for transferring a live connection to the worker.
///
/// Fixed once per session at creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffMode {
    /// Send the raw socket handle over the control channel.
    #[default]
    DirectTransfer,
    /// Relay bytes through a single-use named local endpoint, for workers
    /// that cannot receive a raw handle.
    NamedEndpoint,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept client connections on.
    pub listen_addr: String,
    /// Worker executable.
    pub worker_command: String,
    /// Extra arguments placed before the fixed worker arguments.
    pub worker_args: Vec<String>,
    /// Directory holding helper binaries, prepended to the worker PATH.
    pub helper_dir: Option<PathBuf>,
    /// Path of the "open browser" helper injected into the environment.
    pub browser_helper: Option<PathBuf>,
    /// Suppresses browser helper injection.
    pub suppress_browser_helper: bool,
    /// Whether the worker must transform URIs for the remote client.
    pub transform_uris: bool,
    /// Whether the worker should route traffic through the host proxy.
    pub use_host_proxy: bool,
    /// Handoff strategy. None = direct transfer.
    pub handoff_mode: Option<HandoffMode>,
    /// Directory for control/endpoint sockets. None = runtime dir.
    pub socket_dir: Option<PathBuf>,
    /// Worker readiness timeout in milliseconds.
    pub ready_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            worker_command: "exthost-worker".to_string(),
            worker_args: Vec::new(),
            helper_dir: None,
            browser_helper: None,
            suppress_browser_helper: false,
            transform_uris: true,
            use_host_proxy: false,
            handoff_mode: None,
            socket_dir: None,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// Returns the configuration file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("exthostd")
            .join(CONFIG_FILE)
    }

    /// Resolved handoff mode for new sessions.
    #[must_use]
    pub fn resolved_handoff_mode(&self) -> HandoffMode {
        self.handoff_mode.unwrap_or_default()
    }

    /// Directory for control and endpoint sockets.
    #[must_use]
    pub fn resolved_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
    }

    /// Loads the configuration from disk, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load() -> io::Result<Self> {
        let path = Self::config_path();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::info!("Configuration loaded from {:?}", path);

        Ok(config)
    }

    /// Saves the configuration to disk.
    ///
    /// # Errors
    /// Returns error if save fails.
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        fs::write(&path, content)?;
        Ok(())
    }
}
