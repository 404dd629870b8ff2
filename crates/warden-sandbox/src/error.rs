//! Error types for sandbox operations
//!
//! One error type for the whole crate; every variant carries a stable
//! machine-readable code.

use crate::config::RuntimeKind;
use thiserror::Error;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Sandbox errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// No runtime could be selected
    #[error("no sandbox runtime available (requested {requested}): {reason}")]
    NotAvailable {
        requested: RuntimeKind,
        reason: String,
    },

    /// An adapter failed unexpectedly
    #[error("execution failed on {runtime}: {reason}")]
    ExecutionFailed { runtime: RuntimeKind, reason: String },

    /// Adapter-reported timeout; converted to a result by the executor
    #[error("execution on {runtime} timed out after {timeout_ms}ms")]
    ExecTimeout { runtime: RuntimeKind, timeout_ms: u64 },

    /// Malformed request
    #[error("invalid request field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Configuration error
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// Pool was shut down while the caller waited
    #[error("sandbox pool shut down")]
    PoolShutDown,

    /// Invalid lifecycle state for the operation
    #[error("invalid state: expected {expected}, got {current}")]
    InvalidState { current: String, expected: String },

    /// IO error
    #[error("IO error: {reason}")]
    IoError { reason: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SandboxError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAvailable { .. } => "NOT_AVAILABLE",
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::ExecTimeout { .. } => "TIMEOUT",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ConfigError { .. } => "CONFIG_ERROR",
            Self::PoolShutDown => "POOL_SHUT_DOWN",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IoError { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            reason: err.to_string(),
        }
    }
}

impl From<SandboxError> for warden_core::Error {
    fn from(err: SandboxError) -> Self {
        warden_core::Error::Sandbox {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SandboxError::NotAvailable {
            requested: RuntimeKind::Auto,
            reason: "nothing detected".into(),
        };
        assert_eq!(err.code(), "NOT_AVAILABLE");
        assert_eq!(SandboxError::PoolShutDown.code(), "POOL_SHUT_DOWN");
        assert_eq!(
            SandboxError::validation("code", "empty").code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_exec_failed_display() {
        let err = SandboxError::ExecutionFailed {
            runtime: RuntimeKind::Docker,
            reason: "daemon went away".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docker"));
        assert!(msg.contains("daemon went away"));
    }

    #[test]
    fn test_into_core_error() {
        let err: warden_core::Error = SandboxError::PoolShutDown.into();
        assert!(matches!(
            err,
            warden_core::Error::Sandbox { ref code, .. } if code == "POOL_SHUT_DOWN"
        ));
    }
}
