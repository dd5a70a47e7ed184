//! Control-message protocol between the session process and the worker.
//!
//! Messages are newline-delimited JSON over the worker control socket.
//! The set of message kinds is closed: both ends match exhaustively.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error types.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message exceeded the frame size limit.
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

/// Maximum accepted control-message size in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// How the live connection is transferred to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HandoffKind {
    /// The raw socket handle rides along with the message (unix fd passing).
    RawSocket,
    /// The worker must connect to a single-use local endpoint.
    NamedEndpoint {
        /// Filesystem address of the endpoint.
        address: String,
    },
}

/// Transfer descriptor for a live connection.
///
/// This is the wire contract between the supervisor and the worker when a
/// connection changes owner. Binary fields are base64 so the descriptor
/// survives JSON framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDescriptor {
    /// Handoff strategy for this transfer.
    #[serde(flatten)]
    pub kind: HandoffKind,
    /// Bytes read from the wire before the transport was captured (base64).
    pub initial_data: String,
    /// Whether the worker must skip protocol framing on the raw handle.
    pub skip_framing: bool,
    /// Whether per-message compression was negotiated.
    pub compressed: bool,
    /// Bytes already decoded during protocol negotiation (base64).
    pub replay: String,
}

/// A structured log entry forwarded from the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLogEntry {
    /// Severity: "trace", "debug", "info", "warn" or "error".
    pub severity: String,
    /// Pre-rendered log message.
    pub message: String,
}

/// Control messages exchanged with the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Worker finished bootstrap and may receive a socket handoff.
    Ready,
    /// Transfer a live connection to the worker.
    SocketHandoff(HandoffDescriptor),
    /// Ask the worker to shorten its internal reconnection wait.
    ReduceGraceTime,
    /// Structured log forwarded to the session's log sink.
    ConsoleLog(ConsoleLogEntry),
}

impl ControlMessage {
    /// Encodes the message as one newline-terminated JSON line.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(self)?;
        if line.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge(line.len()));
        }
        line.push(b'\n');
        Ok(line)
    }

    /// Decodes one JSON line (without the trailing newline).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        if line.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge(line.len()));
        }
        Ok(serde_json::from_str(line)?)
    }
}

/// Incremental line splitter for the NDJSON control stream.
///
/// Feed raw reads in, pull complete lines out. Partial lines stay buffered
/// until the next read completes them.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty line buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes and returns all complete lines.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim_end_matches('\r');
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ready_round_trip() {
        let encoded = ControlMessage::Ready.encode().unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text, "{\"type\":\"ready\"}\n");

        let decoded = ControlMessage::decode(text.trim_end()).unwrap();
        assert_eq!(decoded, ControlMessage::Ready);
    }

    #[test]
    fn test_handoff_descriptor_tags() {
        let msg = ControlMessage::SocketHandoff(HandoffDescriptor {
            kind: HandoffKind::RawSocket,
            initial_data: "aGk=".to_string(),
            skip_framing: true,
            compressed: false,
            replay: String::new(),
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "socket-handoff");
        assert_eq!(json["kind"], "raw-socket");
        assert_eq!(json["skipFraming"], true);
        assert_eq!(json["initialData"], "aGk=");
    }

    #[test]
    fn test_named_endpoint_address_survives() {
        let msg = ControlMessage::SocketHandoff(HandoffDescriptor {
            kind: HandoffKind::NamedEndpoint {
                address: "/tmp/exthostd-x.sock".to_string(),
            },
            initial_data: String::new(),
            skip_framing: false,
            compressed: false,
            replay: String::new(),
        });

        let line = String::from_utf8(msg.encode().unwrap()).unwrap();
        let decoded = ControlMessage::decode(line.trim_end()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_console_log_round_trip() {
        let msg = ControlMessage::ConsoleLog(ConsoleLogEntry {
            severity: "warn".to_string(),
            message: "extension activation slow".to_string(),
        });

        let line = String::from_utf8(msg.encode().unwrap()).unwrap();
        let decoded = ControlMessage::decode(line.trim_end()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_line_buffer_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"type\":\"re").is_empty());

        let lines = buf.push(b"ady\"}\n{\"type\":");
        assert_eq!(lines, vec!["{\"type\":\"ready\"}".to_string()]);

        let lines = buf.push(b"\"reduce-grace-time\"}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(
            ControlMessage::decode(&lines[0]).unwrap(),
            ControlMessage::ReduceGraceTime
        );
    }

    #[test]
    fn test_line_buffer_skips_blank_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"\n\r\n{\"type\":\"ready\"}\n");
        assert_eq!(lines.len(), 1);
    }
}
