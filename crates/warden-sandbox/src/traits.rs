//! Runtime adapter contract and executor lifecycle
//!
//! TigerStyle: Explicit state machine with clear transitions.

use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::exec::{ExecOptions, ExecOutput};
use crate::request::ExecutionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sandbox executor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// No adapter selected yet, or cleaned up
    Uninitialized,
    /// Runtime detection and adapter setup in progress
    Initializing,
    /// Adapter ready for requests
    Ready,
}

impl ExecutorState {
    /// Check if requests can run in this state
    pub fn can_execute(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the executor can start initializing
    pub fn can_initialize(&self) -> bool {
        matches!(self, Self::Uninitialized)
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// One isolation technology behind a uniform interface
///
/// Implementations:
/// - MockAdapter: deterministic, in-memory, for tests
/// - NativeAdapter: one per technology (gvisor, nsjail, bubblewrap,
///   firejail, docker, podman, macos)
///
/// Every implementation must kill the whole process tree on timeout or
/// cancellation, and cap captured output at `options.max_output_bytes`.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// The technology this adapter drives
    fn kind(&self) -> RuntimeKind;

    /// Prepare resources held across executions
    async fn initialize(&mut self) -> SandboxResult<()> {
        Ok(())
    }

    /// Run one request
    ///
    /// A timeout may be reported either as an output with `timed_out` set or
    /// as `SandboxError::ExecTimeout`; the executor treats both the same.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecOptions,
    ) -> SandboxResult<ExecOutput>;

    /// Release everything `initialize` acquired
    async fn cleanup(&mut self) -> SandboxResult<()> {
        Ok(())
    }
}

/// Builds the adapter for a selected runtime
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        kind: RuntimeKind,
        config: &SandboxConfig,
    ) -> SandboxResult<Box<dyn RuntimeAdapter>>;
}
