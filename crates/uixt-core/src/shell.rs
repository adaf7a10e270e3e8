//! Device-management command channel (`adb`, `hdc`, `ideviceinstaller`).
//!
//! [`ShellChannel`] runs a CLI with a fixed device selector prefix
//! (`adb -s <serial>`, `hdc -t <serial>`, ...) under a per-command timeout.
//! Text output goes through [`shell`](ShellChannel::shell) /
//! [`run`](ShellChannel::run); binary captures such as screenshots use
//! [`exec_out`](ShellChannel::exec_out) and skip text decoding entirely.
//! Every command is recorded in the owning [`DriverSession`] when one is
//! attached.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, trace};

use crate::driver::{DriverError, Result};
use crate::session::DriverSession;

/// A device-scoped CLI wrapper.
#[derive(Clone)]
pub struct ShellChannel {
    program: PathBuf,
    prefix: Vec<String>,
    timeout: Duration,
    session: Option<Arc<DriverSession>>,
}

impl std::fmt::Debug for ShellChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellChannel")
            .field("program", &self.program)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ShellChannel {
    /// Creates a channel running `program <prefix...> <args...>`.
    pub fn new(program: impl Into<PathBuf>, prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix,
            timeout,
            session: None,
        }
    }

    /// `adb -s <serial>`.
    pub fn adb(program: impl Into<PathBuf>, serial: &str, timeout: Duration) -> Self {
        Self::new(program, vec!["-s".into(), serial.into()], timeout)
    }

    /// `hdc -t <serial>`.
    pub fn hdc(program: impl Into<PathBuf>, serial: &str, timeout: Duration) -> Self {
        Self::new(program, vec!["-t".into(), serial.into()], timeout)
    }

    /// `ideviceinstaller -u <udid>`.
    pub fn ideviceinstaller(udid: &str, timeout: Duration) -> Self {
        Self::new("ideviceinstaller", vec!["-u".into(), udid.into()], timeout)
    }

    /// Records every command into `session`.
    pub fn with_session(mut self, session: Arc<DriverSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Builds the command line without running it (also used by log capture).
    pub fn command_line<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut line: Vec<OsString> = vec![self.program.clone().into()];
        line.extend(self.prefix.iter().map(OsString::from));
        line.extend(args.into_iter().map(Into::into));
        line
    }

    /// Runs `<program> <prefix> <args>` and returns trimmed stdout.
    ///
    /// A non-zero exit status is a [`DriverError::CommandFailed`] carrying
    /// stderr (or stdout when stderr is empty).
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let bytes = self.run_raw(args, self.timeout).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Runs `shell <command>` on the device.
    pub async fn shell(&self, command: &str) -> Result<String> {
        self.run(&["shell", command]).await
    }

    /// Same as [`shell`](Self::shell) with an explicit timeout.
    pub async fn shell_with_timeout(&self, command: &str, timeout: Duration) -> Result<String> {
        let bytes = self.run_raw(&["shell", command], timeout).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Runs `exec-out <command>` and returns raw stdout bytes.
    pub async fn exec_out(&self, command: &str) -> Result<Vec<u8>> {
        self.run_raw(&["exec-out", command], self.timeout).await
    }

    /// Runs the command and returns raw stdout.
    pub async fn run_raw(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
        let line = self.command_line(args.iter().copied());
        let display_str = display_line(&line);
        let started = Instant::now();

        let mut cmd = Command::new(&line[0]);
        cmd.args(&line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(command = %display_str, "running");
        let outcome = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => Err(DriverError::Timeout),
            Ok(Err(e)) => Err(DriverError::Io(e)),
            Ok(Ok(output)) if output.status.success() => Ok(output.stdout),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    String::from_utf8_lossy(&output.stdout).trim().to_string()
                } else {
                    stderr
                };
                Err(DriverError::CommandFailed(format!(
                    "`{display_str}` exited with {}: {message}",
                    output.status
                )))
            }
        };

        let elapsed = started.elapsed();
        debug!(
            command = %display_str,
            elapsed_ms = elapsed.as_millis() as u64,
            success = outcome.is_ok(),
            "shell command completed"
        );
        if let Some(session) = &self.session {
            session
                .record_command("SHELL", &display_str, elapsed, outcome.as_deref())
                .await;
        }
        outcome
    }
}

fn display_line(line: &[OsString]) -> String {
    line.iter()
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes `value` for a POSIX device shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;

    #[test]
    fn command_line_includes_prefix() {
        let ch = ShellChannel::adb("adb", "emulator-5554", Duration::from_secs(1));
        let line = display_line(&ch.command_line(["shell", "wm size"]));
        assert_eq!(line, "adb -s emulator-5554 shell wm size");

        let ch = ShellChannel::hdc("hdc", "FMR0223", Duration::from_secs(1));
        assert_eq!(
            display_line(&ch.command_line(["shell", "ls"])),
            "hdc -t FMR0223 shell ls"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("com.example.app"), "com.example.app");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_local_program_and_records_history() {
        let session = Arc::new(DriverSession::new(SessionSettings::default()).unwrap());
        let ch = ShellChannel::new("echo", vec!["-n".into()], Duration::from_secs(5))
            .with_session(session.clone());
        let out = ch.run(&["hello"]).await.unwrap();
        assert_eq!(out, "hello");

        let history = session.request_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].method, "SHELL");
        assert_eq!(history[0].target, "echo -n hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let ch = ShellChannel::new("false", vec![], Duration::from_secs(5));
        let err = ch.run(&[]).await.unwrap_err();
        assert!(matches!(err, DriverError::CommandFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_transport() {
        let ch = ShellChannel::new("sleep", vec![], Duration::from_millis(50));
        let err = ch.run(&["5"]).await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout));
        assert!(err.is_transport());
    }
}
