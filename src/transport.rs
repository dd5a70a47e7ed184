//! Client transport abstraction.
//!
//! Wraps an accepted client connection with a uniform write/drain/close
//! contract. A transport is either *plain* (framed byte stream, no extra
//! protocol state) or *upgraded* (streaming-protocol socket carrying replay
//! state from the handshake). The variant is fixed at acceptance time.

use std::io;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation on a transport that was already closed.
    #[error("Transport is closed")]
    Closed,
}

/// Protocol replay state read off a transport at handoff time.
///
/// Plain transports report an empty state; upgraded transports report the
/// framing/compression flags and any handshake bytes the new owner must
/// treat as already-received payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    /// Peer must not re-parse protocol frames on the raw handle.
    pub skip_framing: bool,
    /// Per-message compression negotiated during the handshake.
    pub compressed: bool,
    /// Bytes already decoded from the handshake.
    pub replay: Vec<u8>,
}

/// A plain framed byte stream.
#[derive(Debug)]
pub struct PlainTransport {
    stream: TcpStream,
}

/// An upgraded streaming-protocol socket with handshake replay state.
#[derive(Debug)]
pub struct UpgradedTransport {
    stream: TcpStream,
    skip_framing: bool,
    compressed: bool,
    replay: Vec<u8>,
}

/// A client connection in one of its two fixed variants.
#[derive(Debug)]
pub enum Transport {
    /// Plain socket, no protocol state.
    Plain(PlainTransport),
    /// Upgraded socket with replay state.
    Upgraded(UpgradedTransport),
}

impl Transport {
    /// Wraps an accepted plain connection.
    #[must_use]
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(PlainTransport { stream })
    }

    /// Wraps an upgraded connection together with its handshake state.
    #[must_use]
    pub fn upgraded(
        stream: TcpStream,
        skip_framing: bool,
        compressed: bool,
        replay: Vec<u8>,
    ) -> Self {
        Self::Upgraded(UpgradedTransport {
            stream,
            skip_framing,
            compressed,
            replay,
        })
    }

    fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Self::Plain(t) => &mut t.stream,
            Self::Upgraded(t) => &mut t.stream,
        }
    }

    /// Writes all of `data` to the connection.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream_mut().write_all(data).await?;
        Ok(())
    }

    /// Completes once all previously queued writes reached the OS.
    ///
    /// Must resolve before the underlying handle is handed to another
    /// process, otherwise queued bytes could be lost or reordered relative
    /// to the handoff message.
    pub async fn drain(&mut self) -> Result<(), TransportError> {
        self.stream_mut().flush().await?;
        Ok(())
    }

    /// Shuts the connection down. Errors are ignored: the peer may already
    /// be gone.
    pub async fn close(mut self) {
        let _ = self.stream_mut().shutdown().await;
    }

    /// Replay state required by the new owner of the raw handle.
    ///
    /// This is the single place where variant-specific fields are read.
    #[must_use]
    pub fn replay_state(&self) -> ReplayState {
        match self {
            Self::Plain(_) => ReplayState::default(),
            Self::Upgraded(t) => ReplayState {
                skip_framing: t.skip_framing,
                compressed: t.compressed,
                replay: t.replay.clone(),
            },
        }
    }

    /// Consumes the transport, returning the underlying stream.
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        match self {
            Self::Plain(t) => t.stream,
            Self::Upgraded(t) => t.stream,
        }
    }

    /// Consumes the transport, returning the raw OS handle for transfer to
    /// another process. The handle is switched back to blocking mode so the
    /// receiving process sees a conventional socket.
    pub fn into_owned_fd(self) -> Result<std::os::fd::OwnedFd, TransportError> {
        let std_stream = self.into_stream().into_std()?;
        std_stream.set_nonblocking(false)?;
        Ok(std_stream.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_plain_replay_state_is_empty() {
        let (a, _b) = tcp_pair().await;
        let transport = Transport::plain(a);
        assert_eq!(transport.replay_state(), ReplayState::default());
    }

    #[tokio::test]
    async fn test_upgraded_replay_state_preserved() {
        let (a, _b) = tcp_pair().await;
        let transport = Transport::upgraded(a, true, false, vec![1, 2, 3]);
        let state = transport.replay_state();
        assert!(state.skip_framing);
        assert!(!state.compressed);
        assert_eq!(state.replay, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_write_drain_then_peer_reads() {
        let (a, mut b) = tcp_pair().await;
        let mut transport = Transport::plain(a);

        transport.write(b"hello").await.unwrap();
        transport.drain().await.unwrap();

        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_signals_eof_to_peer() {
        let (a, mut b) = tcp_pair().await;
        let transport = Transport::plain(a);
        transport.close().await;

        let mut buf = [0u8; 1];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
