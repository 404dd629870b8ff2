//! Telemetry and logging initialization
//!
//! Explicit telemetry configuration; all diagnostics flow through `tracing`.

use crate::error::{Error, Result};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Log level filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Whether to write events to stdout
    pub stdout_enabled: bool,
    /// Emit events as JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "warden".to_string(),
            log_level: "info".to_string(),
            stdout_enabled: true,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Disable stdout output
    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    /// Emit JSON lines
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Read `WARDEN_SERVICE_NAME`, `RUST_LOG` and `WARDEN_LOG_JSON`
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            service_name: lookup("WARDEN_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            stdout_enabled: true,
            json: lookup("WARDEN_LOG_JSON")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// Installs an `EnvFilter` (from `RUST_LOG`, falling back to
/// `config.log_level`) and a fmt layer. Fails if a global subscriber is
/// already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = if !config.stdout_enabled {
        tracing_subscriber::registry().with(env_filter).try_init()
    } else if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    result.map_err(|e| Error::Internal {
        message: format!("failed to initialize tracing subscriber: {}", e),
    })?;

    tracing::info!(
        service = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "warden");
        assert_eq!(config.log_level, "info");
        assert!(config.stdout_enabled);
        assert!(!config.json);
    }

    #[test]
    fn test_telemetry_config_builder() {
        let config = TelemetryConfig::new("sandbox-tests")
            .with_log_level("debug")
            .with_json(true)
            .without_stdout();

        assert_eq!(config.service_name, "sandbox-tests");
        assert_eq!(config.log_level, "debug");
        assert!(config.json);
        assert!(!config.stdout_enabled);
    }

    #[test]
    fn test_telemetry_config_from_vars() {
        let config = TelemetryConfig::from_vars(|key| match key {
            "WARDEN_SERVICE_NAME" => Some("sandbox-host".to_string()),
            "WARDEN_LOG_JSON" => Some("TRUE".to_string()),
            _ => None,
        });

        assert_eq!(config.service_name, "sandbox-host");
        assert_eq!(config.log_level, "info");
        assert!(config.json);
    }

    #[test]
    fn test_init_telemetry_twice_fails() {
        let config = TelemetryConfig::new("warden-test").without_stdout();
        assert!(init_telemetry(config.clone()).is_ok());
        assert!(matches!(
            init_telemetry(config),
            Err(Error::Internal { .. })
        ));
    }
}
