//! exthostd - Main entry point.
//!
//! Headless server that accepts remote editor client connections, spawns
//! extension-host workers and keeps sessions alive across reconnects.
//!
//! Usage: exthostd [OPTIONS]
//!
//! Options:
//!   --version, -v    Show version
//!   --listen ADDR    Override the configured listen address

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use exthostd::config::ServerConfig;
use exthostd::environment::EnvironmentParams;
use exthostd::logging::{self, LogConfig};
use exthostd::registry::SessionRegistry;
use exthostd::transport::Transport;

/// Crate version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum accepted connect-header size in bytes.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// First line a client sends: the connect header. Bytes following the
/// newline belong to the session payload and become the initial chunk.
#[derive(Debug, Deserialize)]
struct ConnectHeader {
    /// Reconnection token identifying the logical session.
    token: String,
    /// Whether the connection was protocol-upgraded before reaching us.
    #[serde(default)]
    upgraded: bool,
    /// Upgraded only: peer must skip protocol framing on the raw handle.
    #[serde(default)]
    skip_framing: bool,
    /// Upgraded only: per-message compression is active.
    #[serde(default)]
    compressed: bool,
    /// Client locale for the worker NLS configuration.
    #[serde(default)]
    locale: Option<String>,
    /// Enables verbose worker logging.
    #[serde(default)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("exthostd v{VERSION}");
        return Ok(());
    }

    logging::init(&LogConfig::default())?;

    let mut config = ServerConfig::load()?;
    if let Some(pos) = args.iter().position(|a| a == "--listen") {
        if let Some(addr) = args.get(pos + 1) {
            config.listen_addr.clone_from(addr);
        }
    }

    let listen_addr = config.listen_addr.clone();
    let registry = SessionRegistry::new(Arc::new(config));

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("exthostd v{VERSION} listening on {listen_addr}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, disposing all sessions");
                registry.dispose_all().await;
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            handle_connection(registry, stream, addr.to_string()).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            }
        }
    }

    Ok(())
}

/// Reads the connect header, classifies the transport and routes the
/// connection into the session registry.
async fn handle_connection(registry: Arc<SessionRegistry>, mut stream: TcpStream, addr: String) {
    let (header, initial_chunk) = match read_header(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Rejecting connection from {addr}: {e}");
            return;
        }
    };

    let transport = if header.upgraded {
        Transport::upgraded(stream, header.skip_framing, header.compressed, Vec::new())
    } else {
        Transport::plain(stream)
    };

    let env_params = EnvironmentParams {
        base: env::vars().collect::<HashMap<_, _>>(),
        locale: header.locale,
        debug: header.debug,
        ..EnvironmentParams::default()
    };

    let result = registry
        .accept_connection(header.token, addr.clone(), transport, initial_chunk, env_params)
        .await;

    match result {
        Ok(outcome) => info!("Connection from {addr} routed: {outcome:?}"),
        Err(e) => error!("Connection from {addr} failed: {e}"),
    }
}

/// Reads one newline-terminated JSON header; any bytes already read past
/// the newline are returned as the initial chunk.
async fn read_header(
    stream: &mut TcpStream,
) -> Result<(ConnectHeader, Vec<u8>), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("connection closed before header".into());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let header: ConnectHeader = serde_json::from_slice(&buf[..pos])?;
            let initial_chunk = buf.split_off(pos + 1);
            return Ok((header, initial_chunk));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err("connect header too large".into());
        }
    }
}
