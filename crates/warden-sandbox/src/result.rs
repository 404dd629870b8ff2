//! Caller-facing execution result

use crate::exec::ExecOutput;
use serde::{Deserialize, Serialize};

/// Normalized result of one execution
///
/// `timed_out` implies `killed` and `!success`; `success` holds exactly when
/// `exit_code == 0` and nothing was killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr merged, trimmed
    pub output: String,
    pub timed_out: bool,
    pub killed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Classify an adapter output
    pub fn from_output(output: ExecOutput, timeout_ms: u64) -> Self {
        let stdout = output.stdout_string();
        let stderr = output.stderr_string();
        let exit_code = output.status.code;
        let killed = output.killed();
        let timed_out = output.timed_out;
        let success = exit_code == 0 && !killed;

        let error = if timed_out {
            Some(format!("execution timed out after {}ms", timeout_ms))
        } else if output.cancelled {
            Some("execution cancelled".to_string())
        } else if !success {
            Some(format!("process exited with code {}", exit_code))
        } else {
            None
        };

        Self {
            success,
            exit_code,
            output: merge_output(&stdout, &stderr),
            stdout,
            stderr,
            timed_out,
            killed,
            duration_ms: output.duration_ms,
            error,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
        }
    }

    /// Result for a timeout an adapter reported as an error
    pub fn timed_out(timeout_ms: u64, duration_ms: u64) -> Self {
        Self::from_output(ExecOutput::timed_out(duration_ms), timeout_ms)
    }
}

/// Merge stdout and stderr into one trimmed block
pub fn merge_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    let merged = match (stdout.is_empty(), stderr.is_empty()) {
        (true, _) => stderr.to_string(),
        (false, true) => stdout.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    };
    merged.trim().to_string()
}
