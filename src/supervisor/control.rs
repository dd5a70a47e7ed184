//! Worker control channel.
//!
//! A per-worker unix socket over which the worker signals readiness and
//! forwards logs, and the supervisor sends handoff and grace-time messages.
//! Direct socket handoff rides the same channel: the descriptor travels as
//! a JSON line with the raw fd attached via `SCM_RIGHTS`.
//!
//! The channel task starts before the worker connects; outbound commands
//! queue until the connection is accepted. Supervision of the process
//! itself is independent, so a worker that dies without ever connecting
//! still gets its exit reported.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

use crate::protocol::{ControlMessage, LineBuffer};

use super::{SupervisorError, WorkerEvent};

/// A bound control socket awaiting its worker connection.
///
/// Single-use: the listener is dropped and the socket file removed after
/// the first accepted connection.
pub struct ControlEndpoint {
    listener: Option<UnixListener>,
    path: PathBuf,
}

impl ControlEndpoint {
    /// Binds the control socket at `path`, replacing any stale file.
    pub fn bind(path: &Path) -> Result<Self, SupervisorError> {
        if path.exists() {
            debug!("Removing stale control socket: {:?}", path);
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SupervisorError::ControlSocket)?;
            }
        }

        let listener = UnixListener::bind(path).map_err(SupervisorError::ControlSocket)?;

        // Owner-only: the path is the only credential the worker presents.
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(Self {
            listener: Some(listener),
            path: path.to_path_buf(),
        })
    }

    /// Accepts the worker connection and runs the channel until either
    /// side goes away. Outbound commands received on `cmd_rx` before the
    /// worker connects are flushed once it does.
    pub async fn run(
        mut self,
        wait: Duration,
        cmd_rx: mpsc::UnboundedReceiver<ControlCommand>,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        let accepted = timeout(wait, listener.accept()).await;
        drop(listener);
        let _ = std::fs::remove_file(&self.path);

        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!("Control socket accept failed: {e}");
                return;
            }
            Err(_) => {
                warn!("Worker did not connect to control socket within {wait:?}");
                return;
            }
        };

        debug!("Worker connected to control socket");
        run_channel(stream, cmd_rx, event_tx).await;
    }
}

impl Drop for ControlEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Outbound control traffic.
#[derive(Debug)]
pub enum ControlCommand {
    /// Plain JSON message.
    Send(ControlMessage),
    /// JSON message with the raw socket handle attached.
    SendWithFd(ControlMessage, OwnedFd),
}

async fn run_channel(
    stream: UnixStream,
    mut cmd_rx: mpsc::UnboundedReceiver<ControlCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = LineBuffer::new();
    let mut read_buf = [0u8; 4096];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if let Err(e) = write_command(&stream, cmd).await {
                    warn!("Control channel write failed: {e}");
                    break;
                }
            }
            ready = stream.readable() => {
                if ready.is_err() {
                    break;
                }
                match stream.try_read(&mut read_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in lines.push(&read_buf[..n]) {
                            dispatch_line(&line, &event_tx);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("Control channel read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

fn dispatch_line(line: &str, event_tx: &mpsc::UnboundedSender<WorkerEvent>) {
    match ControlMessage::decode(line) {
        Ok(ControlMessage::Ready) => {
            let _ = event_tx.send(WorkerEvent::Ready);
        }
        Ok(ControlMessage::ConsoleLog(entry)) => {
            let _ = event_tx.send(WorkerEvent::Log(entry));
        }
        Ok(other) => {
            // Session-to-worker kinds are not valid inbound.
            warn!("Unexpected control message from worker: {other:?}");
        }
        Err(e) => {
            // Stray parse issues are not fatal to the worker.
            warn!("Unparseable control message: {e}");
        }
    }
}

async fn write_command(stream: &UnixStream, cmd: ControlCommand) -> io::Result<()> {
    match cmd {
        ControlCommand::Send(msg) => {
            let line = msg.encode().map_err(io::Error::other)?;
            write_all(stream, &line).await
        }
        ControlCommand::SendWithFd(msg, fd) => {
            let line = msg.encode().map_err(io::Error::other)?;
            write_with_fd(stream, &line, &fd).await
        }
    }
}

async fn write_all(stream: &UnixStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sends `data` in one `sendmsg` call with `fd` in the ancillary payload.
async fn write_with_fd(stream: &UnixStream, data: &[u8], fd: &OwnedFd) -> io::Result<()> {
    use std::io::IoSlice;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{ControlMessage as Cmsg, MsgFlags, sendmsg};

    loop {
        stream.writable().await?;
        let fds = [fd.as_raw_fd()];
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(data)];
            let cmsgs = [Cmsg::ScmRights(&fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match result {
            Ok(n) if n == data.len() => return Ok(()),
            Ok(n) => {
                // Short write after the fd already transferred: flush the
                // remaining descriptor bytes plainly.
                return write_all(stream, &data[n..]).await;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}
