// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Supervision of external acquisition processes.
//!
//! The supervisor spawns one backend tool per session, feeds its output into
//! the matching [`Decoder`] and publishes every decoded sweep as an
//! [`AcquisitionEvent`]. It owns the child process for the whole session and
//! reports how the session ended.
//!
//! State machine:
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!                        |
//!                        +----> Failed ---> Idle (on stop or next start)
//! ```

mod source;

use std::os::fd::{OwnedFd, RawFd};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use command_fds::{CommandFdExt, FdMapping};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::backend::{AcquisitionConfig, BackendInfo, BackendRegistry};
use crate::protocol::{Decoder, SweepDecoder, SweepRecord};
use source::OutputSource;

/// Descriptor number a pipe backend writes its records to.
///
/// The pipe's write end is mapped onto this descriptor in the child; stdout
/// and stderr stay separate and are forwarded as log lines.
const PIPE_OUTPUT_FD: RawFd = 3;

/// How long the log forwarders get to deliver a finished backend's last lines.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts and buffer sizes for acquisition sessions.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long launching the backend may take.
    pub startup_timeout: Duration,
    /// How long to wait for a graceful exit after closing the output pipe.
    pub stop_timeout: Duration,
    /// How long to wait for the process to be reaped after a kill.
    pub kill_timeout: Duration,
    /// Maximum bytes read from the backend per chunk.
    pub read_chunk_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(1),
            read_chunk_size: 64 * 1024,
        }
    }
}

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    /// No session.
    #[default]
    Idle,
    /// Backend is being launched.
    Starting,
    /// Backend output is being decoded.
    Running,
    /// Stop requested, waiting for the backend to exit.
    Stopping,
    /// Session ended with an error.
    Failed(String),
}

impl AcquisitionState {
    /// Whether a session currently owns a backend process.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Errors that prevent a session from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("an acquisition session is already running")]
    AlreadyRunning,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid argument template '{template}' for {backend}: {reason}")]
    Template {
        backend: String,
        template: String,
        reason: String,
    },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not start within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited during startup with code {code:?}")]
    ExitedDuringStartup { program: String, code: Option<i32> },
}

/// Errors that end a running session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("backend exited unexpectedly with code {code:?}")]
    ProcessExitedUnexpectedly { code: Option<i32> },

    #[error("failed to read backend output: {0}")]
    ReadFailed(String),
}

/// Events published by a running session, in order.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// The backend was launched.
    Started { backend: String, command: String },
    /// A decoded sweep.
    Sweep(SweepRecord),
    /// A non-fatal condition or a line of backend diagnostics.
    Log(String),
    /// The session ended normally, either by user request or because the backend finished.
    Finished { stopped_by_user: bool },
    /// The session ended with an error.
    Failed(SessionError),
}

/// Receiver for the supervisor's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<AcquisitionEvent>;

struct Session {
    backend: String,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle that runs at most one backend session at a time.
pub struct AcquisitionSupervisor {
    registry: Arc<BackendRegistry>,
    config: SupervisorConfig,
    event_tx: mpsc::UnboundedSender<AcquisitionEvent>,
    state_tx: Arc<watch::Sender<AcquisitionState>>,
    session: Option<Session>,
}

impl std::fmt::Debug for AcquisitionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSupervisor")
            .field("config", &self.config)
            .field("state", &*self.state_tx.borrow())
            .field("backend", &self.session.as_ref().map(|s| &s.backend))
            .finish_non_exhaustive()
    }
}

impl AcquisitionSupervisor {
    /// Create a supervisor over `registry`.
    ///
    /// Returns the supervisor and the receiver for its events. The receiver
    /// outlives individual sessions.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, config: SupervisorConfig) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(AcquisitionState::Idle);

        (
            Self {
                registry,
                config,
                event_tx,
                state_tx: Arc::new(state_tx),
                session: None,
            },
            event_rx,
        )
    }

    /// The backend table this supervisor was built with.
    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.state_tx.borrow().clone()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state_tx.subscribe()
    }

    /// Launch `backend` with `config`.
    ///
    /// Returns once the process is running and its output is being read.
    /// On error the state is `Failed` and no process is left behind.
    pub async fn start(&mut self, backend: &str, config: &AcquisitionConfig) -> Result<(), StartupError> {
        if self.state().is_active() {
            return Err(StartupError::AlreadyRunning);
        }
        if let Some(previous) = self.session.take() {
            // Already finished on its own; reap the task
            let _ = previous.task.await;
        }

        let info = self
            .registry
            .get(backend)
            .cloned()
            .ok_or_else(|| StartupError::UnknownBackend(backend.to_string()))?;

        self.state_tx.send_replace(AcquisitionState::Starting);
        match self.launch(info, config).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start {}: {}", backend, e);
                self.state_tx.send_replace(AcquisitionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn launch(&self, info: BackendInfo, config: &AcquisitionConfig) -> Result<Session, StartupError> {
        let session_config = info.session_config(config);
        let uses_pipe = info.format.uses_pipe();
        let pipe_fd = PIPE_OUTPUT_FD.to_string();
        let args = info.render_args(&session_config, uses_pipe.then_some(pipe_fd.as_str()))?;
        let command_line = std::iter::once(info.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        info!("Starting backend: {}", command_line);

        let launch_error = |source| StartupError::Launch {
            program: info.program.clone(),
            source,
        };

        let mut command = Command::new(&info.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The command owns the write end; it is closed in this process once
        // the command is dropped after spawning.
        let pipe_reader = if uses_pipe {
            let (reader, writer) = std::io::pipe().map_err(launch_error)?;
            command
                .fd_mappings(vec![FdMapping {
                    parent_fd: OwnedFd::from(writer),
                    child_fd: PIPE_OUTPUT_FD,
                }])
                .map_err(|e| launch_error(std::io::Error::other(e)))?;
            Some(reader)
        } else {
            None
        };

        let mut child = spawn_with_timeout(command, self.config.startup_timeout)
            .await
            .map_err(|e| match e {
                SpawnError::Io(source) => launch_error(source),
                SpawnError::TimedOut => StartupError::Timeout {
                    program: info.program.clone(),
                    timeout: self.config.startup_timeout,
                },
            })?;

        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                return Err(StartupError::ExitedDuringStartup {
                    program: info.program.clone(),
                    code: status.code(),
                });
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(std::io::Error::other("child stdout was not captured")))?;
        let (source, stdout_log) = match pipe_reader {
            Some(reader) => (
                OutputSource::pipe(reader, self.config.read_chunk_size).map_err(launch_error)?,
                Some(stdout),
            ),
            None => (OutputSource::stdout(stdout, self.config.read_chunk_size), None),
        };

        let stderr = child.stderr.take();

        let decoder = Decoder::for_format(info.format, &session_config);
        debug!("Decoding {} output as {}", info.name, info.format.name());

        self.state_tx.send_replace(AcquisitionState::Running);
        let _ = self.event_tx.send(AcquisitionEvent::Started {
            backend: info.name.clone(),
            command: command_line,
        });
        let _ = self
            .event_tx
            .send(AcquisitionEvent::Log(format!("Started backend: {}", info.program)));

        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = stdout_log {
            log_tasks.push(tokio::spawn(forward_lines(stdout, info.name.clone(), self.event_tx.clone())));
        }
        if let Some(stderr) = stderr {
            log_tasks.push(tokio::spawn(forward_lines(stderr, info.name.clone(), self.event_tx.clone())));
        }

        let cancel_token = CancellationToken::new();
        let worker = SessionWorker {
            backend: info.name.clone(),
            child,
            source,
            decoder,
            log_tasks,
            event_tx: self.event_tx.clone(),
            state_tx: Arc::clone(&self.state_tx),
            cancel_token: cancel_token.clone(),
            stop_timeout: self.config.stop_timeout,
            kill_timeout: self.config.kill_timeout,
        };
        let task = tokio::spawn(worker.run());

        Ok(Session {
            backend: info.name,
            cancel_token,
            task,
        })
    }

    /// Stop the current session.
    ///
    /// Closes the backend's output, waits for it to exit and kills it on
    /// timeout. Always leaves the supervisor `Idle`; calling it with no
    /// session running is a no-op.
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Stopping backend {}", session.backend);
            session.cancel_token.cancel();
            if let Err(e) = session.task.await {
                warn!("Session task for {} ended abnormally: {}", session.backend, e);
            }
        }
        self.state_tx.send_replace(AcquisitionState::Idle);
    }
}

impl Drop for AcquisitionSupervisor {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel_token.cancel();
        }
    }
}

enum SpawnError {
    Io(std::io::Error),
    TimedOut,
}

async fn spawn_with_timeout(mut command: Command, limit: Duration) -> Result<Child, SpawnError> {
    let handle = tokio::runtime::Handle::current();
    let spawn = tokio::task::spawn_blocking(move || {
        // The child registers with the reactor, so spawn inside the runtime context
        let _guard = handle.enter();
        command.spawn()
    });

    match timeout(limit, spawn).await {
        Ok(Ok(result)) => result.map_err(SpawnError::Io),
        Ok(Err(join_error)) => Err(SpawnError::Io(std::io::Error::other(join_error))),
        Err(_) => Err(SpawnError::TimedOut),
    }
}

/// Forward a diagnostic stream line by line as `Log` events.
async fn forward_lines<R>(reader: R, backend: String, event_tx: mpsc::UnboundedSender<AcquisitionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!("[{}] {}", backend, line);
                let _ = event_tx.send(AcquisitionEvent::Log(format!("[{backend}] {line}")));
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {} diagnostics: {}", backend, e);
                break;
            }
        }
    }
}

enum SessionEnd {
    StopRequested,
    EndOfStream,
    ReadFailed(std::io::Error),
}

/// State owned by a running session's task.
struct SessionWorker {
    backend: String,
    child: Child,
    source: OutputSource,
    decoder: Decoder,
    log_tasks: Vec<JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<AcquisitionEvent>,
    state_tx: Arc<watch::Sender<AcquisitionState>>,
    cancel_token: CancellationToken,
    stop_timeout: Duration,
    kill_timeout: Duration,
}

impl SessionWorker {
    async fn run(mut self) {
        let end = self.read_loop().await;

        let dropped = self.decoder.finish();
        if dropped > 0 {
            debug!("Discarded {} undecoded bytes from {}", dropped, self.backend);
        }

        let Self {
            backend,
            mut child,
            source,
            log_tasks,
            event_tx,
            state_tx,
            cancel_token,
            stop_timeout,
            kill_timeout,
            ..
        } = self;

        let mut stopped_by_user = matches!(end, SessionEnd::StopRequested);
        let status = if stopped_by_user {
            state_tx.send_replace(AcquisitionState::Stopping);
            // Closing our end of the output is the graceful stop request
            drop(source);
            terminate(&mut child, stop_timeout, kill_timeout).await
        } else {
            drop(source);
            tokio::select! {
                status = child.wait() => status.ok(),
                () = cancel_token.cancelled() => {
                    stopped_by_user = true;
                    state_tx.send_replace(AcquisitionState::Stopping);
                    terminate(&mut child, stop_timeout, kill_timeout).await
                }
            }
        };

        drain_logs(&backend, log_tasks).await;

        let outcome = if stopped_by_user {
            info!("Scan stopped by user ({})", backend);
            let _ = event_tx.send(AcquisitionEvent::Log("Scan stopped by user".to_string()));
            Ok(())
        } else if let SessionEnd::ReadFailed(e) = end {
            Err(SessionError::ReadFailed(e.to_string()))
        } else {
            match status {
                Some(status) if !status.success() => Err(SessionError::ProcessExitedUnexpectedly {
                    code: status.code(),
                }),
                _ => {
                    info!("Scan finished ({})", backend);
                    Ok(())
                }
            }
        };

        match outcome {
            Ok(()) => {
                state_tx.send_replace(AcquisitionState::Idle);
                let _ = event_tx.send(AcquisitionEvent::Finished { stopped_by_user });
            }
            Err(e) => {
                error!("{} failed: {}", backend, e);
                state_tx.send_replace(AcquisitionState::Failed(e.to_string()));
                let _ = event_tx.send(AcquisitionEvent::Failed(e));
            }
        }
    }

    async fn read_loop(&mut self) -> SessionEnd {
        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => return SessionEnd::StopRequested,

                chunk = self.source.next_chunk() => match chunk {
                    Ok(Some(bytes)) => self.publish(&bytes),
                    Ok(None) => {
                        debug!("{} closed its output", self.backend);
                        return SessionEnd::EndOfStream;
                    }
                    Err(e) => {
                        warn!("Read error from {}: {}", self.backend, e);
                        return SessionEnd::ReadFailed(e);
                    }
                }
            }
        }
    }

    fn publish(&mut self, bytes: &[u8]) {
        for result in self.decoder.feed(bytes) {
            let event = match result {
                Ok(record) => AcquisitionEvent::Sweep(record),
                Err(e) => {
                    warn!("Dropped malformed {} frame: {}", self.backend, e);
                    AcquisitionEvent::Log(format!("Dropped malformed frame: {e}"))
                }
            };
            if self.event_tx.send(event).is_err() {
                // Nobody is listening; keep draining so the backend is not blocked
                debug!("Event receiver closed");
            }
        }
    }
}

/// Wait for the log forwarders to reach end of stream, aborting any still
/// running after [`LOG_DRAIN_TIMEOUT`].
async fn drain_logs(backend: &str, tasks: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + LOG_DRAIN_TIMEOUT;
    for mut task in tasks {
        if timeout_at(deadline, &mut task).await.is_err() {
            debug!("{} diagnostics still open after exit, dropping the rest", backend);
            task.abort();
        }
    }
}

/// Wait for a graceful exit, then kill.
async fn terminate(child: &mut Child, stop_timeout: Duration, kill_timeout: Duration) -> Option<ExitStatus> {
    if let Ok(status) = timeout(stop_timeout, child.wait()).await {
        return status.ok();
    }

    warn!("Backend did not exit within {:?}, killing it", stop_timeout);
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill backend: {}", e);
    }
    match timeout(kill_timeout, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            error!("Backend still running {:?} after kill", kill_timeout);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameFormat;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

    fn sh_backend(name: &str, format: FrameFormat, script: &str) -> BackendInfo {
        BackendInfo::new(name, "sh", format).with_args(["-c", script])
    }

    fn supervisor_with(backends: Vec<BackendInfo>, config: SupervisorConfig) -> (AcquisitionSupervisor, EventReceiver) {
        let mut registry = BackendRegistry::empty();
        for backend in backends {
            registry.register(backend);
        }
        AcquisitionSupervisor::new(Arc::new(registry), config)
    }

    async fn next_event(rx: &mut EventReceiver) -> AcquisitionEvent {
        timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Collect events until the session ends.
    async fn until_end(rx: &mut EventReceiver) -> Vec<AcquisitionEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = matches!(event, AcquisitionEvent::Finished { .. } | AcquisitionEvent::Failed(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn sweeps(events: &[AcquisitionEvent]) -> Vec<&SweepRecord> {
        events
            .iter()
            .filter_map(|e| match e {
                AcquisitionEvent::Sweep(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn log_lines(events: &[AcquisitionEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                AcquisitionEvent::Log(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    fn printf_octal(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("\\{b:03o}")).collect()
    }

    #[tokio::test]
    async fn test_text_backend_runs_to_completion() {
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend(
                "csv",
                FrameFormat::TextCsv,
                "echo 'Found 1 device' >&2; printf '0,0,100000000,0,1000,3,-50,-40,-45\\n'",
            )],
            SupervisorConfig::default(),
        );

        supervisor.start("csv", &AcquisitionConfig::default()).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, AcquisitionEvent::Started { .. }));

        let events = until_end(&mut rx).await;
        let records = sweeps(&events);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frequencies(), &[100.0, 100.001, 100.002]);
        assert_eq!(records[0].powers(), &[-50.0, -40.0, -45.0]);
        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Finished { stopped_by_user: false })
        ));

        let mut state = supervisor.subscribe_state();
        timeout(EVENT_TIMEOUT, state.wait_for(|s| *s == AcquisitionState::Idle))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_as_failure() {
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend("broken", FrameFormat::TextCsv, "sleep 0.3; exit 3")],
            SupervisorConfig::default(),
        );

        supervisor.start("broken", &AcquisitionConfig::default()).await.unwrap();
        let events = until_end(&mut rx).await;

        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Failed(SessionError::ProcessExitedUnexpectedly { code: Some(3) }))
        ));
        assert!(matches!(supervisor.state(), AcquisitionState::Failed(_)));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), AcquisitionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_closes_output_and_reports_user_stop() {
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend(
                "loop",
                FrameFormat::TextCsv,
                "while true; do printf '0,0,1000000,0,1000,2,-5,-6\\n'; sleep 0.05; done",
            )],
            SupervisorConfig::default(),
        );

        supervisor.start("loop", &AcquisitionConfig::default()).await.unwrap();
        assert_eq!(supervisor.state(), AcquisitionState::Running);

        loop {
            if let AcquisitionEvent::Sweep(record) = next_event(&mut rx).await {
                assert_eq!(record.len(), 2);
                break;
            }
        }

        supervisor.stop().await;
        assert_eq!(supervisor.state(), AcquisitionState::Idle);

        let events = until_end(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Finished { stopped_by_user: true })
        ));
    }

    #[tokio::test]
    async fn test_stop_kills_unresponsive_backend() {
        let config = SupervisorConfig {
            stop_timeout: Duration::from_millis(100),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend("stuck", FrameFormat::TextCsv, "exec sleep 30")],
            config,
        );

        supervisor.start("stuck", &AcquisitionConfig::default()).await.unwrap();
        timeout(Duration::from_secs(5), supervisor.stop()).await.unwrap();
        assert_eq!(supervisor.state(), AcquisitionState::Idle);

        let events = until_end(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Finished { stopped_by_user: true })
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut supervisor, _rx) = supervisor_with(Vec::new(), SupervisorConfig::default());
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), AcquisitionState::Idle);
    }

    #[tokio::test]
    async fn test_startup_errors() {
        let (mut supervisor, _rx) = supervisor_with(
            vec![
                BackendInfo::new("missing", "/nonexistent/spectrum-tool", FrameFormat::TextCsv),
                sh_backend("bad-template", FrameFormat::TextCsv, "{frequency}"),
            ],
            SupervisorConfig::default(),
        );
        let config = AcquisitionConfig::default();

        assert!(matches!(
            supervisor.start("nope", &config).await,
            Err(StartupError::UnknownBackend(_))
        ));
        assert!(matches!(
            supervisor.start("missing", &config).await,
            Err(StartupError::Launch { .. })
        ));
        assert!(matches!(supervisor.state(), AcquisitionState::Failed(_)));
        assert!(matches!(
            supervisor.start("bad-template", &config).await,
            Err(StartupError::Template { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (mut supervisor, _rx) = supervisor_with(
            vec![sh_backend("idle", FrameFormat::TextCsv, "exec sleep 30")],
            SupervisorConfig {
                stop_timeout: Duration::from_millis(100),
                ..SupervisorConfig::default()
            },
        );
        let config = AcquisitionConfig::default();

        supervisor.start("idle", &config).await.unwrap();
        assert!(matches!(
            supervisor.start("idle", &config).await,
            Err(StartupError::AlreadyRunning)
        ));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_length_prefixed_backend_across_writes() {
        let mut record = Vec::new();
        record.extend_from_slice(&100_000_000u64.to_le_bytes());
        record.extend_from_slice(&100_000_004u64.to_le_bytes());
        record.extend_from_slice(&8u32.to_le_bytes());
        record.extend_from_slice(&[0; 4]);
        record.extend_from_slice(&(-30.0f32).to_le_bytes());
        record.extend_from_slice(&(-20.0f32).to_le_bytes());
        let (head, tail) = record.split_at(13);

        let script = format!(
            "printf '{}'; sleep 0.1; printf '{}'",
            printf_octal(head),
            printf_octal(tail)
        );
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend("hackrf", FrameFormat::LengthPrefixedBinary, &script)],
            SupervisorConfig::default(),
        );

        supervisor.start("hackrf", &AcquisitionConfig::default()).await.unwrap();
        let events = until_end(&mut rx).await;
        let records = sweeps(&events);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frequencies(), &[100.0, 100.000_004]);
        assert_eq!(records[0].powers(), &[-30.0, -20.0]);
    }

    #[tokio::test]
    async fn test_pipe_backend_reads_dedicated_descriptor() {
        let mut record = Vec::new();
        for field in [1u64, 2, 144_000_000, 146_000_000] {
            record.extend_from_slice(&field.to_be_bytes());
        }
        for field in [1_000_000u32, 3, 0, 0, 3, 1] {
            record.extend_from_slice(&field.to_be_bytes());
        }
        record.extend_from_slice(&[0; 4]);
        for power in [-80.0f32, -70.0, -60.0] {
            record.extend_from_slice(&power.to_le_bytes());
        }

        let script = format!(
            "echo 'soapy banner'; echo 'tuner ready' >&2; printf '{}' >&{{fd}}; echo 'done'",
            printf_octal(&record)
        );
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend("soapy", FrameFormat::PipeBinary, &script)],
            SupervisorConfig::default(),
        );

        supervisor.start("soapy", &AcquisitionConfig::default()).await.unwrap();
        let events = until_end(&mut rx).await;
        let records = sweeps(&events);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frequencies(), &[144.0, 145.0, 146.0]);
        assert_eq!(records[0].powers(), &[-80.0, -70.0, -60.0]);

        // Text on stdout is a diagnostic, not part of the record stream
        let logs = log_lines(&events);
        assert!(logs.contains(&"[soapy] soapy banner"), "{logs:?}");
        assert!(logs.contains(&"[soapy] tuner ready"), "{logs:?}");
        assert!(logs.contains(&"[soapy] done"), "{logs:?}");
        assert!(!logs.iter().any(|l| l.starts_with("Dropped malformed frame")), "{logs:?}");
        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Finished { stopped_by_user: false })
        ));
    }

    #[tokio::test]
    async fn test_final_diagnostics_arrive_before_session_end() {
        let (mut supervisor, mut rx) = supervisor_with(
            vec![sh_backend(
                "csv",
                FrameFormat::TextCsv,
                "printf '0,0,100000000,0,1000,2,-50,-40\\n'; for i in 1 2 3 4 5; do echo \"closing $i\" >&2; done; exit 2",
            )],
            SupervisorConfig::default(),
        );

        supervisor.start("csv", &AcquisitionConfig::default()).await.unwrap();
        let events = until_end(&mut rx).await;

        let logs = log_lines(&events);
        for i in 1..=5 {
            let line = format!("[csv] closing {i}");
            assert!(logs.contains(&line.as_str()), "missing {line}: {logs:?}");
        }
        assert!(matches!(
            events.last(),
            Some(AcquisitionEvent::Failed(SessionError::ProcessExitedUnexpectedly { code: Some(2) }))
        ));
    }
}
