//! Connection data holder.
//!
//! Pairs a captured transport with any bytes already read from the wire
//! before capture, so no data is lost between acceptance and handoff. The
//! pair is exclusively owned: it moves from the session to the supervisor,
//! never shared.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::protocol::{HandoffDescriptor, HandoffKind};
use crate::transport::{Transport, TransportError};

/// One captured client connection plus its initial chunk.
#[derive(Debug)]
pub struct ConnectionData {
    transport: Transport,
    initial_chunk: Vec<u8>,
}

impl ConnectionData {
    /// Captures a transport together with bytes read before capture
    /// (possibly empty).
    #[must_use]
    pub fn new(transport: Transport, initial_chunk: Vec<u8>) -> Self {
        Self {
            transport,
            initial_chunk,
        }
    }

    /// Bytes read from the wire before the transport was captured.
    #[must_use]
    pub fn initial_chunk(&self) -> &[u8] {
        &self.initial_chunk
    }

    /// Flushes all queued writes on the transport.
    pub async fn drain(&mut self) -> Result<(), TransportError> {
        self.transport.drain().await
    }

    /// Builds the transfer descriptor for a handoff of the given kind.
    ///
    /// Binary payloads are base64-encoded so the descriptor can travel as a
    /// JSON control message next to the native handle.
    #[must_use]
    pub fn describe_for_handoff(&self, kind: HandoffKind) -> HandoffDescriptor {
        let state = self.transport.replay_state();
        HandoffDescriptor {
            kind,
            initial_data: BASE64.encode(&self.initial_chunk),
            skip_framing: state.skip_framing,
            compressed: state.compressed,
            replay: BASE64.encode(&state.replay),
        }
    }

    /// Splits into the transport and the initial chunk.
    #[must_use]
    pub fn into_parts(self) -> (Transport, Vec<u8>) {
        (self.transport, self.initial_chunk)
    }

    /// Closes the underlying transport, discarding the held data.
    pub async fn close(self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_descriptor_for_plain_transport() {
        let stream = loopback_stream().await;
        let data = ConnectionData::new(Transport::plain(stream), b"abc".to_vec());

        let desc = data.describe_for_handoff(HandoffKind::RawSocket);
        assert_eq!(desc.kind, HandoffKind::RawSocket);
        assert_eq!(desc.initial_data, "YWJj");
        assert!(!desc.skip_framing);
        assert!(!desc.compressed);
        assert_eq!(desc.replay, "");
    }

    #[tokio::test]
    async fn test_descriptor_carries_replay_state() {
        let stream = loopback_stream().await;
        let transport = Transport::upgraded(stream, true, true, b"hs".to_vec());
        let data = ConnectionData::new(transport, Vec::new());

        let desc = data.describe_for_handoff(HandoffKind::RawSocket);
        assert!(desc.skip_framing);
        assert!(desc.compressed);
        assert_eq!(desc.replay, "aHM=");
        assert_eq!(desc.initial_data, "");
    }

    #[tokio::test]
    async fn test_empty_initial_chunk() {
        let stream = loopback_stream().await;
        let data = ConnectionData::new(Transport::plain(stream), Vec::new());
        assert!(data.initial_chunk().is_empty());
    }
}
