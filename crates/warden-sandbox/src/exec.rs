//! Adapter-level execution types
//!
//! Explicit input/output with structured results. Adapters speak these; the
//! executor turns an [`ExecOutput`] into the caller-facing
//! [`ExecutionResult`](crate::result::ExecutionResult).

use crate::cancel::CancelSignal;
use bytes::Bytes;
use std::time::Duration;
use warden_core::constants::{SANDBOX_EXEC_TIMEOUT_MS_DEFAULT, SANDBOX_OUTPUT_BYTES_MAX_DEFAULT};

/// Signal number reported for processes the sandbox killed
pub const SIGKILL: i32 = 9;

/// How a process ended
///
/// Signal deaths carry the shell's `128 + signal` code so callers that only
/// look at `code` still see a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: 128 + signal,
            signal: Some(signal),
        }
    }

    /// Status reported when the sandbox kills the process tree
    pub fn sandbox_kill() -> Self {
        Self::signaled(SIGKILL)
    }

    pub fn is_zero(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::exited(0)
    }
}

#[cfg(unix)]
impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exited(code),
            (None, Some(signal)) => Self::signaled(signal),
            (None, None) => Self::exited(-1),
        }
    }
}

#[cfg(not(unix))]
impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self::exited(status.code().unwrap_or(-1))
    }
}

/// Options for a single adapter execution, resolved by the executor
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Effective timeout
    pub timeout_ms: u64,
    /// Cap on captured bytes, per stream
    pub max_output_bytes: u64,
    /// Caller-driven cancellation
    pub cancel: Option<CancelSignal>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_output(mut self, bytes: u64) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout_ms: SANDBOX_EXEC_TIMEOUT_MS_DEFAULT,
            max_output_bytes: SANDBOX_OUTPUT_BYTES_MAX_DEFAULT,
            cancel: None,
        }
    }
}

/// Output from one adapter execution
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub duration_ms: u64,
    /// Capture stopped at `max_output_bytes`
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// The timeout elapsed and the process tree was killed
    pub timed_out: bool,
    /// The caller cancelled and the process tree was killed
    pub cancelled: bool,
}

impl ExecOutput {
    /// Empty output for a process that ended with `status`
    pub fn exited(status: ExitStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn success(stdout: impl Into<Bytes>) -> Self {
        Self::exited(ExitStatus::default()).with_stdout(stdout)
    }

    pub fn failure(code: i32, stderr: impl Into<Bytes>) -> Self {
        Self::exited(ExitStatus::exited(code)).with_stderr(stderr)
    }

    /// Output for an execution killed at its deadline
    pub fn timed_out(duration_ms: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::exited(ExitStatus::sandbox_kill()).with_duration(duration_ms)
        }
    }

    /// Output for an execution killed on caller request
    pub fn cancelled(duration_ms: u64) -> Self {
        Self {
            cancelled: true,
            ..Self::exited(ExitStatus::sandbox_kill()).with_duration(duration_ms)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_zero() && !self.killed()
    }

    /// Whether the sandbox terminated the process tree
    pub fn killed(&self) -> bool {
        self.timed_out || self.cancelled
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<Bytes>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Bytes>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Replace every occurrence of a host path with its sandbox-visible name
    pub fn redact(mut self, host_path: &str, replacement: &str) -> Self {
        if host_path.is_empty() || host_path == replacement {
            return self;
        }
        self.stdout = redact_bytes(&self.stdout, host_path, replacement);
        self.stderr = redact_bytes(&self.stderr, host_path, replacement);
        self
    }
}

fn redact_bytes(data: &Bytes, needle: &str, replacement: &str) -> Bytes {
    let text = String::from_utf8_lossy(data);
    if !text.contains(needle) {
        return data.clone();
    }
    Bytes::from(text.replace(needle, replacement))
}
