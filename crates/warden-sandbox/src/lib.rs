//! Sandboxed execution for untrusted code and commands
//!
//! TigerStyle: Secure isolation with explicit lifecycle and state management.
//!
//! # Overview
//!
//! Requests run inside one of several interchangeable isolation runtimes:
//! - Runtime detection with a fixed fallback priority
//! - Memory, cpu, timeout and output limits per execution
//! - Whole process-tree termination on timeout or cancellation
//! - Audit records for every attributed execution
//!
//! # Runtimes
//!
//! - **gvisor**, **nsjail**, **bubblewrap**, **firejail** (Linux)
//! - **docker**, **podman** (container engines)
//! - **macos**: Seatbelt via `sandbox-exec`
//! - **mock**: deterministic in-memory stand-in for tests
//!
//! # Usage
//!
//! ```ignore
//! use warden_sandbox::{ExecutionContext, ExecutionRequest, SandboxPool, SandboxPoolConfig};
//!
//! // Executors are created and initialized on first use
//! let pool = SandboxPool::new(SandboxPoolConfig::default())?;
//!
//! let request = ExecutionRequest::code("print('hello')", "python");
//! let context = ExecutionContext::new().with_user("user-42");
//! let result = pool.execute(&request, &context).await?;
//!
//! assert!(result.success);
//! pool.shutdown().await;
//! ```

mod cancel;
mod config;
mod detect;
mod error;
mod exec;
mod executor;
mod mock;
mod pool;
mod process;
mod request;
mod result;
pub mod runtimes;
mod traits;

pub use cancel::CancelSignal;
pub use config::{
    format_mebibytes, parse_memory_bytes, NetworkMode, RuntimeKind, SandboxConfig,
    SandboxConfigInput, SandboxPoolConfig,
};
pub use detect::{
    select_runtime, HostRuntimeDetector, RuntimeDescriptor, RuntimeDetector,
    StaticRuntimeDetector,
};
pub use error::{SandboxError, SandboxResult};
pub use exec::{ExecOptions, ExecOutput, ExitStatus};
pub use executor::SandboxExecutor;
pub use mock::{CommandHandler, MockAdapter, BUSY_LOOP_MARKERS};
pub use pool::{PoolStats, PooledExecutor, SandboxPool, SandboxPoolBuilder};
pub use process::{run_process, ProcessLimits, ProcessSpec};
pub use request::{CodeRequest, CommandRequest, ExecutionContext, ExecutionRequest, Language};
pub use result::{merge_output, ExecutionResult};
pub use runtimes::{NativeAdapter, NativeAdapterFactory};
pub use traits::{AdapterFactory, ExecutorState, RuntimeAdapter};
