//! Process-pipe transport.
//!
//! Launches the server as a child process and speaks newline-delimited
//! JSON-RPC over its stdin/stdout. Three background tasks run per process:
//!
//! - a reader that routes stdout lines to the correlator or the event sink
//! - a stderr reader that feeds the rolling diagnostic buffer
//! - a monitor that owns the `Child`, reports unexpected exits, and performs
//!   the shutdown sequence when asked
//!
//! The process counts as connected as soon as it is launched. The MCP
//! handshake belongs to the connection layer.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::config::{ConnectionSettings, ServerConfig};
use super::correlator::Correlator;
use super::errors::McpError;
use super::framing::{
    encode, format_stderr_suffix, route_line, Routed, StderrTail, STDERR_SNIPPET_LEN,
};
use super::transport::{EventSink, Transport};
use super::types::{JsonRpcNotification, JsonRpcRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long to wait for the output readers to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Terminal state of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The process exited within the grace period.
    Graceful,
    /// The grace period ran out and the process was killed.
    Forced,
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State shared between the transport and its background tasks.
struct Shared {
    server: String,
    correlator: Correlator,
    connected: AtomicBool,
    writer: Mutex<Option<ChildStdin>>,
    stderr: std::sync::Mutex<StderrTail>,
    events: EventSink,
    strict_framing: bool,
    last_shutdown: std::sync::Mutex<Option<ShutdownOutcome>>,
}

impl Shared {
    fn stderr_tail(&self) -> std::sync::MutexGuard<'_, StderrTail> {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_shutdown(&self, outcome: ShutdownOutcome) {
        *self.last_shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server.clone(),
        }
    }

    /// Write one framed message to stdin and flush it.
    async fn write_frame(&self, bytes: &[u8]) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| McpError::NotConnected {
            server: self.server.clone(),
        })?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| McpError::TransportError {
            server: self.server.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }
}

/// Handles for one running process.
struct Running {
    pid: Option<u32>,
    shutdown_tx: oneshot::Sender<Duration>,
    monitor: JoinHandle<Option<ShutdownOutcome>>,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Transport over a child process's stdio.
pub struct StdioTransport {
    config: ServerConfig,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl StdioTransport {
    pub fn new(config: ServerConfig, settings: ConnectionSettings, events: EventSink) -> Self {
        let shared = Shared {
            server: config.id.clone(),
            correlator: Correlator::new(&config.id),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            stderr: std::sync::Mutex::new(StderrTail::default()),
            events,
            strict_framing: settings.strict_framing,
            last_shutdown: std::sync::Mutex::new(None),
        };
        Self {
            config,
            settings,
            shared: Arc::new(shared),
            running: Mutex::new(None),
        }
    }

    /// OS process id of the running server, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    /// How the most recent shutdown sequence ended.
    pub fn last_shutdown(&self) -> Option<ShutdownOutcome> {
        *self
            .shared
            .last_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent diagnostic output, trimmed to the snippet length.
    pub fn stderr_snippet(&self) -> String {
        self.shared.stderr_tail().snippet(STDERR_SNIPPET_LEN)
    }

    fn spawn(&self) -> Result<Child, McpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            server: self.config.id.clone(),
            reason: format!("failed to launch '{}': {e}", self.config.command),
        })
    }

    fn capture_failed(&self, stream: &str) -> McpError {
        McpError::ConnectionFailed {
            server: self.config.id.clone(),
            reason: format!("failed to capture {stream}"),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn server_id(&self) -> &str {
        &self.config.id
    }

    async fn connect(&self) -> Result<(), McpError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.monitor.is_finished() {
                return Err(McpError::AlreadyConnected {
                    server: self.config.id.clone(),
                });
            }
        }
        // A previous process ended on its own; its monitor already cleaned up.
        *running = None;

        // Dropping `child` on any early return kills the process.
        let mut child = self.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| self.capture_failed("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.capture_failed("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.capture_failed("stderr"))?;
        let pid = child.id();

        *self.shared.stderr_tail() = StderrTail::default();
        *self.shared.writer.lock().await = Some(stdin);
        self.shared.events.rearm();
        self.shared.correlator.open();
        self.shared.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_stdout(self.shared.clone(), stdout));
        let stderr_reader = tokio::spawn(read_stderr(self.shared.clone(), stderr));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            self.shared.clone(),
            child,
            reader,
            stderr_reader,
            shutdown_rx,
            self.settings.shutdown_grace,
        ));

        tracing::info!(
            server = %self.config.id,
            pid = ?pid,
            command = %self.config.command,
            "server process started"
        );

        *running = Some(Running {
            pid,
            shutdown_tx,
            monitor,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        let running = self.running.lock().await.take();
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);

        // 1. Reject everything in flight.
        let shared = &self.shared;
        shared.correlator.close_all(|| shared.closed_error());

        // 2. Closing stdin asks the server to exit on its own.
        shared.writer.lock().await.take();

        let Some(Running {
            pid,
            shutdown_tx,
            monitor,
        }) = running
        else {
            return Ok(());
        };

        // 3-5. Signal, wait for the grace period, force-kill.
        let _ = shutdown_tx.send(self.settings.shutdown_grace);
        let outcome = match monitor.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(server = %self.config.id, error = %e, "process monitor failed");
                None
            }
        };

        tracing::info!(
            server = %self.config.id,
            pid = ?pid,
            outcome = ?outcome,
            "server process stopped"
        );

        if was_connected {
            shared.events.closed(None);
        }
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let handle = self.shared.correlator.register(method)?;
        let id = handle.id;

        let written = match encode(&JsonRpcRequest::new(id, method, params)) {
            Ok(bytes) => self.shared.write_frame(&bytes).await,
            Err(e) => Err(McpError::TransportError {
                server: self.config.id.clone(),
                reason: format!("failed to serialize request: {e}"),
            }),
        };
        // An early return drops the handle, which clears the pending entry.
        written?;

        self.shared
            .correlator
            .wait(handle, self.settings.request_timeout)
            .await
    }

    async fn send(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected {
                server: self.config.id.clone(),
            });
        }
        let bytes = encode(&notification).map_err(|e| McpError::TransportError {
            server: self.config.id.clone(),
            reason: format!("failed to serialize notification: {e}"),
        })?;
        self.shared.write_frame(&bytes).await
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Route stdout lines until EOF. Returns the error that should end the
/// connection, if any.
async fn read_stdout(shared: Arc<Shared>, stdout: ChildStdout) -> Option<McpError> {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                return Some(McpError::TransportError {
                    server: shared.server.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })
            }
        }

        match route_line(&line, &shared.correlator) {
            Ok(Routed::Message(message)) => shared.events.message(message),
            Ok(Routed::Unmatched) => {
                tracing::debug!(server = %shared.server, "dropping response with no pending request");
            }
            Ok(Routed::Response(_)) | Ok(Routed::Empty) => {}
            Err(reason) if shared.strict_framing => {
                return Some(McpError::MalformedMessage {
                    server: shared.server.clone(),
                    reason,
                });
            }
            Err(reason) => {
                tracing::warn!(server = %shared.server, %reason, "dropping malformed line");
            }
        }
    }
}

/// Feed stderr into the rolling buffer until EOF.
async fn read_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(server = %shared.server, line = %text.trim_end(), "server stderr");
                shared.stderr_tail().push(&text);
            }
        }
    }
}

/// Own the child until it exits or a shutdown is requested.
async fn monitor(
    shared: Arc<Shared>,
    mut child: Child,
    mut reader: JoinHandle<Option<McpError>>,
    mut stderr_reader: JoinHandle<()>,
    mut shutdown_rx: oneshot::Receiver<Duration>,
    grace: Duration,
) -> Option<ShutdownOutcome> {
    let outcome = tokio::select! {
        status = child.wait() => {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await;
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut stderr_reader).await;
            on_exit(&shared, status).await
        }
        request = &mut shutdown_rx => {
            // A dropped sender means the transport itself was dropped.
            let grace = request.unwrap_or(Duration::ZERO);
            Some(terminate(&mut child, grace, &shared.server).await)
        }
        result = &mut reader => match result {
            Ok(Some(error)) => fail_channel(&shared, &mut child, error, grace).await,
            // stdout closed: give the process a moment to finish exiting.
            _ => match tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await {
                Ok(status) => {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut stderr_reader).await;
                    on_exit(&shared, status).await
                }
                Err(_) => {
                    let error = McpError::ConnectionFailed {
                        server: shared.server.clone(),
                        reason: "server closed its output stream".into(),
                    };
                    fail_channel(&shared, &mut child, error, grace).await
                }
            },
        },
    };

    reader.abort();
    stderr_reader.abort();
    if let Some(outcome) = outcome {
        shared.record_shutdown(outcome);
    }
    outcome
}

/// Handle process exit. Returns `Some` when the exit was part of a requested
/// shutdown, `None` when it was unexpected.
async fn on_exit(
    shared: &Shared,
    status: std::io::Result<ExitStatus>,
) -> Option<ShutdownOutcome> {
    let was_connected = shared.connected.swap(false, Ordering::SeqCst);
    shared.writer.lock().await.take();

    if !was_connected {
        // disconnect() is in progress and owns the reporting.
        return Some(ShutdownOutcome::Graceful);
    }

    let abnormal = match &status {
        Ok(status) => describe_abnormal_exit(status),
        Err(e) => Some(format!("failed to wait for process: {e}")),
    };
    let snippet = shared.stderr_tail().snippet(STDERR_SNIPPET_LEN);

    match abnormal {
        Some(description) => {
            let error = McpError::ConnectionFailed {
                server: shared.server.clone(),
                reason: format!("{description}{}", format_stderr_suffix(&snippet)),
            };
            tracing::warn!(server = %shared.server, error = %error, "server process exited unexpectedly");
            shared.correlator.close_all(|| error.clone());
            shared.events.closed(Some(error));
        }
        None => {
            tracing::info!(server = %shared.server, "server process exited");
            shared.correlator.close_all(|| shared.closed_error());
            shared.events.closed(None);
        }
    }
    None
}

/// Tear the channel down because of a fatal read-side error.
async fn fail_channel(
    shared: &Shared,
    child: &mut Child,
    error: McpError,
    grace: Duration,
) -> Option<ShutdownOutcome> {
    if shared.connected.swap(false, Ordering::SeqCst) {
        tracing::warn!(server = %shared.server, error = %error, "closing channel");
        shared.correlator.close_all(|| error.clone());
        shared.events.closed(Some(error));
    }
    shared.writer.lock().await.take();
    Some(terminate(child, grace, &shared.server).await)
}

/// Ask the process to terminate, then force-kill it after `grace`.
async fn terminate(child: &mut Child, grace: Duration, server: &str) -> ShutdownOutcome {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => ShutdownOutcome::Graceful,
        Err(_) => {
            tracing::warn!(
                server,
                grace_ms = grace.as_millis() as u64,
                "server did not exit in time, killing"
            );
            let _ = child.kill().await;
            ShutdownOutcome::Forced
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we have not reaped yet.
        let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

/// `None` for a clean exit, otherwise a description of how it ended.
fn describe_abnormal_exit(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(format!("process exited with code {code}"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(format!("process terminated by signal {signal}"));
        }
    }
    Some("process terminated abnormally".to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
