//! Constants for Warden
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Sandbox Defaults
// =============================================================================

/// Default memory limit, as a Kubernetes-style quantity
pub const SANDBOX_MEMORY_DEFAULT: &str = "256Mi";

/// Default CPU share (number of CPUs, fractional allowed)
pub const SANDBOX_CPU_COUNT_DEFAULT: f64 = 1.0;

/// Default execution timeout in milliseconds (30 sec)
pub const SANDBOX_EXEC_TIMEOUT_MS_DEFAULT: u64 = 30 * 1000;

/// Maximum execution timeout in milliseconds (10 min)
pub const SANDBOX_EXEC_TIMEOUT_MS_MAX: u64 = 10 * 60 * 1000;

/// Default cap on captured stdout/stderr, per stream (1 MiB)
pub const SANDBOX_OUTPUT_BYTES_MAX_DEFAULT: u64 = 1024 * 1024;

/// Time allowed after a kill for the process tree to exit and pipes to drain
pub const SANDBOX_KILL_GRACE_MS: u64 = 2 * 1000;

/// Maximum processes inside a container runtime
pub const SANDBOX_PIDS_COUNT_MAX: u32 = 256;

/// Working directory as seen from inside a sandbox
pub const SANDBOX_WORKDIR: &str = "/workspace";

// =============================================================================
// Pool Defaults
// =============================================================================

/// Default number of executors in a pool
pub const POOL_SIZE_DEFAULT: usize = 4;

/// Maximum number of executors in a pool
pub const POOL_SIZE_MAX: usize = 256;

// =============================================================================
// Detection
// =============================================================================

/// Timeout for a single daemon probe (`docker info`, `podman info`)
pub const DETECT_PROBE_TIMEOUT_MS: u64 = 5 * 1000;

// =============================================================================
// Audit
// =============================================================================

/// Maximum audit records kept by the in-memory sink
pub const AUDIT_RECORDS_COUNT_MAX: usize = 10_000;
