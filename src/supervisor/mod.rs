//! Worker process supervision.
//!
//! Owns the lifecycle of one out-of-process extension-host worker per
//! session: spawn with a constructed environment, route its output to the
//! log sink, monitor exit/error, and mediate handoff of live connections —
//! either by passing the raw socket handle over the control channel or by
//! relaying through a single-use named endpoint.

pub mod control;
pub mod endpoint;

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{HandoffMode, ServerConfig};
use crate::connection::ConnectionData;
use crate::environment::{ENV_CONTROL_SOCKET, ENV_ENDPOINT, Environment};
use crate::protocol::{ConsoleLogEntry, ControlMessage, HandoffKind};
use crate::transport::TransportError;

use control::{ControlCommand, ControlEndpoint};
use endpoint::SingleUseEndpoint;

/// Fixed worker-mode argument.
pub const ARG_WORKER_TYPE: &str = "--type=extension-host";

/// Supervisor error types.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS could not create the worker process. Fatal to the session.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Control or endpoint socket failure.
    #[error("Control socket error: {0}")]
    ControlSocket(#[source] std::io::Error),

    /// The worker did not connect in time.
    #[error("Worker did not connect within {0:?}")]
    ControlTimeout(Duration),

    /// The control channel task has shut down.
    #[error("Control channel closed")]
    ControlClosed,

    /// Transport failure during handoff.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Events surfaced by a supervised worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Worker finished bootstrap and may receive socket handoffs.
    Ready,
    /// Structured log entry forwarded from the worker.
    Log(ConsoleLogEntry),
    /// Worker process terminated. Fatal to the session.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if any (unix).
        signal: Option<i32>,
    },
}

/// Fixed spawn arguments for an extension-host worker.
#[must_use]
pub fn worker_exec_args(config: &ServerConfig) -> Vec<String> {
    let mut args = config.worker_args.clone();
    args.push(ARG_WORKER_TYPE.to_string());
    args.push(format!("--transform-uris={}", config.transform_uris));
    args.push(format!("--use-host-proxy={}", config.use_host_proxy));
    args
}

/// A live supervised worker process.
pub struct WorkerHandle {
    pid: Option<u32>,
    mode: HandoffMode,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    event_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    kill_signal: std::sync::Arc<Notify>,
    socket_dir: PathBuf,
    /// Endpoint pre-bound before spawn, consumed by the first handoff
    /// (listening-endpoint mode only).
    first_endpoint: Option<SingleUseEndpoint>,
    ready_wait: Duration,
}

impl WorkerHandle {
    /// Worker process id, if the spawn reported one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Handoff strategy fixed for this worker.
    #[must_use]
    pub fn mode(&self) -> HandoffMode {
        self.mode
    }

    /// Takes the merged worker event stream. Yields `None` after first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.event_rx.take()
    }

    fn send_control(&self, cmd: ControlCommand) -> Result<(), SupervisorError> {
        self.control_tx
            .send(cmd)
            .map_err(|_| SupervisorError::ControlClosed)
    }

    /// Asks the worker to shorten any reconnection wait it is tracking.
    /// Best-effort: failures only mean the worker is already gone.
    pub fn shorten_grace_time(&self) {
        if self
            .send_control(ControlCommand::Send(ControlMessage::ReduceGraceTime))
            .is_err()
        {
            debug!("Grace-time message dropped: control channel closed");
        }
    }

    /// Transfers a live connection to the worker. Never blocks on the
    /// worker itself.
    ///
    /// Drains the transport first so all queued bytes reach the OS before
    /// ownership changes. In direct mode the raw handle rides the control
    /// channel; in endpoint mode the accept-and-relay runs in its own task
    /// so the caller is not held for the worker's connect.
    pub async fn deliver(&mut self, mut data: ConnectionData) -> Result<(), SupervisorError> {
        match self.mode {
            HandoffMode::DirectTransfer => {
                data.drain().await?;
                let descriptor = data.describe_for_handoff(HandoffKind::RawSocket);
                let (transport, _initial_chunk) = data.into_parts();
                let fd = transport.into_owned_fd()?;
                self.send_control(ControlCommand::SendWithFd(
                    ControlMessage::SocketHandoff(descriptor),
                    fd,
                ))?;
                Ok(())
            }
            HandoffMode::NamedEndpoint => {
                let endpoint = match self.first_endpoint.take() {
                    Some(pre_bound) => pre_bound,
                    None => {
                        // Reconnection: fresh endpoint, announced over the
                        // control channel.
                        let endpoint = SingleUseEndpoint::bind(&self.socket_dir)?;
                        let descriptor = data.describe_for_handoff(HandoffKind::NamedEndpoint {
                            address: endpoint.address(),
                        });
                        self.send_control(ControlCommand::Send(ControlMessage::SocketHandoff(
                            descriptor,
                        )))?;
                        endpoint
                    }
                };
                let wait = self.ready_wait;
                tokio::spawn(async move {
                    if let Err(e) = endpoint
                        .accept_and_relay(data, wait, CancellationToken::new())
                        .await
                    {
                        warn!("Endpoint handoff failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    /// Kills the worker process. The monitor task reports the resulting
    /// exit through the event stream.
    pub fn kill(&self) {
        self.kill_signal.notify_one();
    }
}

/// Spawns one extension-host worker and wires up its supervision.
///
/// The control socket is bound before spawn and its path injected into the
/// worker environment; in listening-endpoint mode the first single-use
/// endpoint is bound up front as well, so its address can travel the same
/// way. Spawn failure is fatal to the calling session. The worker connects
/// to the control socket asynchronously; exit monitoring starts right away
/// so even a worker that dies during bootstrap has its exit reported.
pub fn spawn_worker(
    config: &ServerConfig,
    environment: &Environment,
    exec_args: &[String],
) -> Result<WorkerHandle, SupervisorError> {
    let mode = config.resolved_handoff_mode();
    let socket_dir = config.resolved_socket_dir();
    let ready_wait = Duration::from_millis(config.ready_timeout_ms);

    let control_path = socket_dir.join(format!("exthostd-ctl-{}.sock", Uuid::new_v4()));
    let control_endpoint = ControlEndpoint::bind(&control_path)?;

    let first_endpoint = match mode {
        HandoffMode::NamedEndpoint => Some(SingleUseEndpoint::bind(&socket_dir)?),
        HandoffMode::DirectTransfer => None,
    };

    let mut command = Command::new(&config.worker_command);
    command
        .args(exec_args)
        .env_clear()
        .envs(environment.iter())
        .env(ENV_CONTROL_SOCKET, &control_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref endpoint) = first_endpoint {
        command.env(ENV_ENDPOINT, endpoint.address());
    }

    let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
    let pid = child.id();
    info!(
        "Spawned extension host worker (pid {:?}, command {})",
        pid, config.worker_command
    );

    // Route worker output to the log sink. Output-stream errors are logged,
    // never fatal.
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_output(stdout, pid, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_output(stderr, pid, "stderr"));
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let kill_signal = std::sync::Arc::new(Notify::new());

    tokio::spawn(control_endpoint.run(ready_wait, control_rx, event_tx.clone()));
    tokio::spawn(monitor_exit(child, kill_signal.clone(), event_tx));

    Ok(WorkerHandle {
        pid,
        mode,
        control_tx,
        event_rx: Some(event_rx),
        kill_signal,
        socket_dir,
        first_endpoint,
        ready_wait,
    })
}

/// Forwards worker lines to tracing, tagged with the pid and stream name.
async fn pump_output<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("worker[{pid:?}] {name}: {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!("worker[{pid:?}] {name} read error: {e}");
                break;
            }
        }
    }
}

/// Waits for the worker to exit (or a kill request), then reports the exit
/// code and signal for diagnostics.
async fn monitor_exit(
    mut child: tokio::process::Child,
    kill_signal: std::sync::Arc<Notify>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill_signal.notified() => {
            debug!("Killing worker (pid {:?})", child.id());
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            let code = status.code();
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);

            if status.success() {
                info!("Worker exited cleanly");
            } else {
                warn!("Worker exited (code {code:?}, signal {signal:?})");
            }
            let _ = event_tx.send(WorkerEvent::Exited { code, signal });
        }
        Err(e) => {
            error!("Worker process error: {e}");
            let _ = event_tx.send(WorkerEvent::Exited {
                code: None,
                signal: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_worker_exec_args_fixed_contract() {
        let config = ServerConfig {
            use_host_proxy: true,
            ..ServerConfig::default()
        };
        let args = worker_exec_args(&config);
        assert_eq!(
            args,
            vec![
                "--type=extension-host".to_string(),
                "--transform-uris=true".to_string(),
                "--use-host-proxy=true".to_string(),
            ]
        );
    }

    #[test]
    fn test_worker_exec_args_keep_extra_args_first() {
        let config = ServerConfig {
            worker_args: vec!["--inspect=0".to_string()],
            ..ServerConfig::default()
        };
        let args = worker_exec_args(&config);
        assert_eq!(args[0], "--inspect=0");
        assert_eq!(args[1], ARG_WORKER_TYPE);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            worker_command: "/nonexistent/exthost-worker-binary".to_string(),
            socket_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let env = crate::environment::build_worker_environment(
            crate::environment::EnvironmentParams::default(),
            &config,
        );

        let result = spawn_worker(&config, &env, &worker_exec_args(&config));
        assert!(matches!(result, Err(SupervisorError::Spawn(_))));
    }
}
