//! Background capture of device log streams (`logcat`, `hilog`,
//! `idevicesyslog`).
//!
//! [`LogCapture::spawn`] starts the log command in its own process group and
//! a task that streams its stdout line by line into a [`LogSink`]. The task
//! owns a [`CancellationToken`]; [`stop`](LogCapture::stop) cancels it and
//! waits for the task to acknowledge, which happens only after the process
//! group has been signalled and the child reaped. Dropping a handle without
//! stopping cancels the task as well, and `kill_on_drop` covers the child.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use crate::driver::{DriverError, Result};

/// Callback invoked for every captured line.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Where captured lines go.
#[derive(Clone)]
pub enum LogSink {
    /// Keep lines in memory and return them from [`LogCapture::stop`].
    Buffer,
    /// Hand each line to a caller-supplied callback.
    Callback(LineCallback),
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSink::Buffer => f.write_str("Buffer"),
            LogSink::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Handle for a running log capture.
pub struct LogCapture {
    command: String,
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<Vec<String>>>,
}

impl LogCapture {
    /// Spawns `command_line` and starts streaming its stdout.
    pub fn spawn(command_line: Vec<OsString>, sink: LogSink) -> Result<Self> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| DriverError::InvalidParams("empty log command".into()))?;
        let command = command_line
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::CommandFailed("log process has no stdout".into()))?;

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let span = debug_span!("log_capture", command = %command);
        let join_handle = tokio::spawn(capture_loop(child, stdout, sink, token).instrument(span));

        debug!(%command, "log capture started");
        Ok(Self {
            command,
            cancel_token,
            join_handle: Some(join_handle),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Stops the capture and returns buffered lines.
    ///
    /// Returns once the log process has been terminated and reaped. With a
    /// callback sink the returned list is empty.
    pub async fn stop(mut self) -> Vec<String> {
        self.cancel_token.cancel();
        let lines = match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        debug!(command = %self.command, lines = lines.len(), "log capture stopped");
        lines
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// A driver-owned slot holding at most one running capture.
///
/// Starting a new capture stops the previous one first. Lines are filtered
/// by the identifier given at start (empty keeps everything).
#[derive(Default)]
pub struct CaptureSlot {
    running: tokio::sync::Mutex<Option<(LogCapture, String)>>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, command_line: Vec<OsString>, identifier: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some((previous, _)) = running.take() {
            warn!(command = %previous.command(), "log capture already running, restarting");
            previous.stop().await;
        }
        let capture = LogCapture::spawn(command_line, LogSink::Buffer)?;
        *running = Some((capture, identifier.to_string()));
        Ok(())
    }

    /// Stops the running capture and returns the matching lines.
    pub async fn stop(&self) -> Result<Vec<String>> {
        let (capture, identifier) = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| DriverError::CommandFailed("log capture not started".into()))?;
        let lines = capture.stop().await;
        if identifier.is_empty() {
            return Ok(lines);
        }
        Ok(lines.into_iter().filter(|l| l.contains(&identifier)).collect())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn capture_loop(
    mut child: Child,
    stdout: ChildStdout,
    sink: LogSink,
    cancel: CancellationToken,
) -> Vec<String> {
    let mut lines = BufReader::new(stdout).lines();
    let mut buffer = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => match &sink {
                    LogSink::Buffer => buffer.push(line),
                    LogSink::Callback(callback) => callback(&line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "log stream read failed");
                    break;
                }
            }
        }
    }

    terminate(&mut child).await;
    buffer
}

/// Signals the child's process group, then kills and reaps the child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain syscall on the process group created at spawn time.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap log process");
    }
}
