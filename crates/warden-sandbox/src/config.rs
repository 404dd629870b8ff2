//! Sandbox configuration
//!
//! Explicit limits with units in names. Callers may hand in either the
//! canonical shape or the simplified one (byte-valued memory limit, boolean
//! network flag, pool size); both arrive as [`SandboxConfigInput`] and are
//! collapsed by [`SandboxConfigInput::normalize`].

use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use warden_core::constants::{
    POOL_SIZE_DEFAULT, POOL_SIZE_MAX, SANDBOX_CPU_COUNT_DEFAULT, SANDBOX_EXEC_TIMEOUT_MS_DEFAULT,
    SANDBOX_EXEC_TIMEOUT_MS_MAX, SANDBOX_MEMORY_DEFAULT, SANDBOX_OUTPUT_BYTES_MAX_DEFAULT,
};

const BYTES_PER_KIB: u64 = 1024;
const BYTES_PER_MIB: u64 = 1024 * 1024;
const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// RuntimeKind
// =============================================================================

/// Isolation technology selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Gvisor,
    Nsjail,
    Docker,
    Podman,
    Bubblewrap,
    Firejail,
    Macos,
    Mock,
    Auto,
}

impl RuntimeKind {
    /// Fallback priority, most preferred first
    pub const PRIORITY: [RuntimeKind; 7] = [
        RuntimeKind::Gvisor,
        RuntimeKind::Nsjail,
        RuntimeKind::Bubblewrap,
        RuntimeKind::Firejail,
        RuntimeKind::Docker,
        RuntimeKind::Podman,
        RuntimeKind::Macos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gvisor => "gvisor",
            Self::Nsjail => "nsjail",
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Bubblewrap => "bubblewrap",
            Self::Firejail => "firejail",
            Self::Macos => "macos",
            Self::Mock => "mock",
            Self::Auto => "auto",
        }
    }

    /// Position in [`Self::PRIORITY`]; `None` for `mock` and `auto`
    pub fn priority(&self) -> Option<usize> {
        Self::PRIORITY.iter().position(|k| k == self)
    }

    /// Whether this names a real isolation technology
    pub fn is_native(&self) -> bool {
        self.priority().is_some()
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gvisor" | "runsc" => Ok(Self::Gvisor),
            "nsjail" => Ok(Self::Nsjail),
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "bubblewrap" | "bwrap" => Ok(Self::Bubblewrap),
            "firejail" => Ok(Self::Firejail),
            "macos" | "seatbelt" | "sandbox-exec" => Ok(Self::Macos),
            "mock" => Ok(Self::Mock),
            "auto" => Ok(Self::Auto),
            other => Err(SandboxError::ConfigError {
                reason: format!("unknown runtime '{}'", other),
            }),
        }
    }
}

// =============================================================================
// NetworkMode
// =============================================================================

/// Network access inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access (default)
    #[default]
    None,
    /// Share the host network
    Host,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Host => "host",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl FromStr for NetworkMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "false" => Ok(Self::None),
            "host" | "on" | "true" => Ok(Self::Host),
            other => Err(SandboxError::ConfigError {
                reason: format!("unknown network mode '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Memory quantities
// =============================================================================

/// Parse a memory quantity such as `256Mi`, `1Gi`, `512M` or `1048576`
///
/// Decimal and binary suffixes are both read as binary multiples.
pub fn parse_memory_bytes(quantity: &str) -> SandboxResult<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let value: f64 = number.parse().map_err(|_| SandboxError::ConfigError {
        reason: format!("invalid memory quantity '{}'", quantity),
    })?;

    let multiplier = match suffix.trim() {
        "" | "b" | "B" => 1,
        "Ki" | "K" | "k" | "KB" | "kb" => BYTES_PER_KIB,
        "Mi" | "M" | "m" | "MB" | "mb" => BYTES_PER_MIB,
        "Gi" | "G" | "g" | "GB" | "gb" => BYTES_PER_GIB,
        other => {
            return Err(SandboxError::ConfigError {
                reason: format!("unknown memory unit '{}' in '{}'", other, quantity),
            })
        }
    };

    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes <= 0.0 {
        return Err(SandboxError::ConfigError {
            reason: format!("memory quantity '{}' must be positive", quantity),
        });
    }
    Ok(bytes as u64)
}

/// Format a byte count as a rounded mebibyte quantity (`268435456` -> `256Mi`)
pub fn format_mebibytes(bytes: u64) -> String {
    let mebibytes = (bytes + BYTES_PER_MIB / 2) / BYTES_PER_MIB;
    format!("{}Mi", mebibytes)
}

// =============================================================================
// SandboxConfig
// =============================================================================

/// Canonical sandbox configuration
///
/// Built once per executor or pool and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Runtime selector
    pub runtime: RuntimeKind,
    /// Memory limit quantity (e.g. "256Mi")
    pub memory: String,
    /// CPU share in CPUs (fractional allowed)
    pub cpu: f64,
    /// Execution timeout
    pub timeout_ms: u64,
    /// Cap on captured bytes, per stream
    pub max_output_bytes: u64,
    /// Network access
    pub network: NetworkMode,
    /// Mount the sandbox root filesystem read-only
    pub read_only_fs: bool,
    /// Fall back to the next available runtime when the requested one is missing
    pub fallback_enabled: bool,
    /// Container image override for docker/podman
    pub image: Option<String>,
}

impl SandboxConfig {
    /// Create with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_read_only_fs(mut self, read_only: bool) -> Self {
        self.read_only_fs = read_only;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> SandboxResult<u64> {
        parse_memory_bytes(&self.memory)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> SandboxResult<()> {
        self.memory_bytes()?;
        if !self.cpu.is_finite() || self.cpu <= 0.0 {
            return Err(SandboxError::ConfigError {
                reason: format!("cpu must be a positive number, got {}", self.cpu),
            });
        }
        if self.timeout_ms == 0 || self.timeout_ms > SANDBOX_EXEC_TIMEOUT_MS_MAX {
            return Err(SandboxError::ConfigError {
                reason: format!(
                    "timeout_ms must be in 1..={}, got {}",
                    SANDBOX_EXEC_TIMEOUT_MS_MAX, self.timeout_ms
                ),
            });
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::ConfigError {
                reason: "max_output_bytes must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Auto,
            memory: SANDBOX_MEMORY_DEFAULT.to_string(),
            cpu: SANDBOX_CPU_COUNT_DEFAULT,
            timeout_ms: SANDBOX_EXEC_TIMEOUT_MS_DEFAULT,
            max_output_bytes: SANDBOX_OUTPUT_BYTES_MAX_DEFAULT,
            network: NetworkMode::None,
            read_only_fs: true,
            fallback_enabled: true,
            image: None,
        }
    }
}

// =============================================================================
// SandboxPoolConfig
// =============================================================================

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPoolConfig {
    /// Configuration shared by every pooled executor
    pub sandbox: SandboxConfig,
    /// Number of executors
    pub pool_size: usize,
}

impl SandboxPoolConfig {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self {
            sandbox,
            pool_size: POOL_SIZE_DEFAULT,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.pool_size == 0 || self.pool_size > POOL_SIZE_MAX {
            return Err(SandboxError::ConfigError {
                reason: format!(
                    "pool_size must be in 1..={}, got {}",
                    POOL_SIZE_MAX, self.pool_size
                ),
            });
        }
        self.sandbox.validate()
    }
}

impl Default for SandboxPoolConfig {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

// =============================================================================
// SandboxConfigInput
// =============================================================================

/// Caller-facing configuration, canonical or simplified
///
/// Every field is optional. Canonical fields win over their simplified
/// counterparts when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfigInput {
    pub runtime: Option<RuntimeKind>,
    /// Canonical memory quantity ("256Mi")
    pub memory: Option<String>,
    /// Simplified memory limit in bytes
    #[serde(alias = "memoryLimit")]
    pub memory_limit: Option<u64>,
    pub cpu: Option<f64>,
    #[serde(alias = "timeoutMs", alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(alias = "maxOutputBytes")]
    pub max_output_bytes: Option<u64>,
    /// Canonical network mode
    pub network: Option<NetworkMode>,
    /// Simplified network flag
    #[serde(alias = "networkAccess")]
    pub network_access: Option<bool>,
    #[serde(alias = "readOnlyFs", alias = "readOnly")]
    pub read_only_fs: Option<bool>,
    #[serde(alias = "fallbackEnabled")]
    pub fallback_enabled: Option<bool>,
    pub image: Option<String>,
    #[serde(alias = "poolSize")]
    pub pool_size: Option<usize>,
}

impl SandboxConfigInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse into the canonical shape
    pub fn normalize(&self) -> SandboxConfig {
        let defaults = SandboxConfig::default();

        let memory = self
            .memory
            .clone()
            .or_else(|| self.memory_limit.map(format_mebibytes))
            .unwrap_or(defaults.memory);

        let network = self
            .network
            .or_else(|| {
                self.network_access.map(|enabled| {
                    if enabled {
                        NetworkMode::Host
                    } else {
                        NetworkMode::None
                    }
                })
            })
            .unwrap_or(defaults.network);

        SandboxConfig {
            runtime: self.runtime.unwrap_or(defaults.runtime),
            memory,
            cpu: self.cpu.unwrap_or(defaults.cpu),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            max_output_bytes: self.max_output_bytes.unwrap_or(defaults.max_output_bytes),
            network,
            read_only_fs: self.read_only_fs.unwrap_or(defaults.read_only_fs),
            fallback_enabled: self.fallback_enabled.unwrap_or(defaults.fallback_enabled),
            image: self.image.clone().or(defaults.image),
        }
    }

    /// Collapse into a pool configuration
    pub fn normalize_pool(&self) -> SandboxPoolConfig {
        SandboxPoolConfig {
            sandbox: self.normalize(),
            pool_size: self.pool_size.unwrap_or(POOL_SIZE_DEFAULT),
        }
    }

    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merge(self, other: SandboxConfigInput) -> Self {
        Self {
            runtime: other.runtime.or(self.runtime),
            memory: other.memory.or(self.memory),
            memory_limit: other.memory_limit.or(self.memory_limit),
            cpu: other.cpu.or(self.cpu),
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            max_output_bytes: other.max_output_bytes.or(self.max_output_bytes),
            network: other.network.or(self.network),
            network_access: other.network_access.or(self.network_access),
            read_only_fs: other.read_only_fs.or(self.read_only_fs),
            fallback_enabled: other.fallback_enabled.or(self.fallback_enabled),
            image: other.image.or(self.image),
            pool_size: other.pool_size.or(self.pool_size),
        }
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> warden_core::Result<Self> {
        toml::from_str(content).map_err(|e| warden_core::Error::InvalidConfiguration {
            field: "sandbox".into(),
            reason: e.to_string(),
        })
    }

    /// Parse from JSON, as callers usually hand it over
    pub fn from_json_str(content: &str) -> warden_core::Result<Self> {
        serde_json::from_str(content).map_err(|e| warden_core::Error::InvalidConfiguration {
            field: "sandbox".into(),
            reason: e.to_string(),
        })
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> warden_core::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| warden_core::Error::ConfigLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        toml::from_str(&content).map_err(|e| warden_core::Error::ConfigLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Read from environment variables
    ///
    /// Reads:
    /// - `WARDEN_SANDBOX_RUNTIME`
    /// - `WARDEN_SANDBOX_MEMORY`
    /// - `WARDEN_SANDBOX_CPU`
    /// - `WARDEN_SANDBOX_TIMEOUT_MS`
    /// - `WARDEN_SANDBOX_MAX_OUTPUT_BYTES`
    /// - `WARDEN_SANDBOX_NETWORK`
    /// - `WARDEN_SANDBOX_POOL_SIZE`
    pub fn from_env() -> warden_core::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable lookup
    pub fn from_vars<F>(lookup: F) -> warden_core::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T, F>(lookup: &F, key: &str) -> warden_core::Result<Option<T>>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
            F: Fn(&str) -> Option<String>,
        {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                    warden_core::Error::InvalidConfiguration {
                        field: key.to_string(),
                        reason: e.to_string(),
                    }
                }),
            }
        }

        let memory = lookup("WARDEN_SANDBOX_MEMORY");
        if let Some(memory) = &memory {
            parse_memory_bytes(memory).map_err(|e| warden_core::Error::InvalidConfiguration {
                field: "WARDEN_SANDBOX_MEMORY".into(),
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            runtime: parsed(&lookup, "WARDEN_SANDBOX_RUNTIME")?,
            memory,
            cpu: parsed(&lookup, "WARDEN_SANDBOX_CPU")?,
            timeout_ms: parsed(&lookup, "WARDEN_SANDBOX_TIMEOUT_MS")?,
            max_output_bytes: parsed(&lookup, "WARDEN_SANDBOX_MAX_OUTPUT_BYTES")?,
            network: parsed(&lookup, "WARDEN_SANDBOX_NETWORK")?,
            pool_size: parsed(&lookup, "WARDEN_SANDBOX_POOL_SIZE")?,
            ..Self::default()
        })
    }
}

impl From<SandboxConfigInput> for SandboxConfig {
    fn from(input: SandboxConfigInput) -> Self {
        input.normalize()
    }
}

impl From<SandboxConfigInput> for SandboxPoolConfig {
    fn from(input: SandboxConfigInput) -> Self {
        input.normalize_pool()
    }
}
