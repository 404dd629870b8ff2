//! Error types for Warden
//!
//! Explicit error variants with context, using thiserror.

use thiserror::Error;

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, Error>;

/// Warden error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Failed to load configuration from {path}: {reason}")]
    ConfigLoad { path: String, reason: String },

    #[error("Sandbox error [{code}]: {message}")]
    Sandbox { code: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create an internal error from anything displayable
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfiguration {
            field: "sandbox.memory".into(),
            reason: "unknown unit".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sandbox.memory"));
        assert!(msg.contains("unknown unit"));
    }

    #[test]
    fn test_sandbox_error_display() {
        let err = Error::Sandbox {
            code: "NOT_AVAILABLE".into(),
            message: "no runtime".into(),
        };
        assert_eq!(err.to_string(), "Sandbox error [NOT_AVAILABLE]: no runtime");
    }
}
