//! exthostd
//!
//! Remote extension-host connection manager for headless editor servers.
//! Spawns out-of-process extension-host workers, hands live client
//! connections over to them, and keeps sessions alive across client
//! disconnect/reconnect cycles without losing in-flight data.
//!
//! # Architecture
//!
//! - **Transport Module**: plain/upgraded client connection abstraction
//! - **Connection Module**: transport plus pre-capture bytes, handoff descriptor
//! - **Supervisor Module**: worker spawn, monitoring and socket handoff
//! - **Session Module**: per-token lifecycle state machine
//! - **Registry Module**: token-to-session routing
//! - **Environment Module**: worker process environment construction

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

#[cfg(not(unix))]
compile_error!(
    "exthostd requires a unix platform: socket handoff relies on unix domain sockets and SCM_RIGHTS descriptor passing"
);

pub mod config;
pub mod connection;
pub mod environment;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use config::{HandoffMode, ServerConfig};
pub use connection::ConnectionData;
pub use environment::{Environment, EnvironmentParams, build_worker_environment};
pub use protocol::{ControlMessage, HandoffDescriptor, HandoffKind};
pub use registry::{AcceptOutcome, SessionRegistry};
pub use session::{ConnectionSession, SessionError, SessionState};
pub use supervisor::{SupervisorError, WorkerEvent, WorkerHandle};
pub use transport::{Transport, TransportError};
