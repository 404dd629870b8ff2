//! Native runtime adapters
//!
//! Every isolation technology shares one adapter, [`NativeAdapter`], which
//! owns a private host workspace and runs requests through the process
//! runner. A [`Backend`] only decides how to wrap an [`Invocation`] in its
//! technology's command line.
//!
//! Backends without a native memory or cpu control fall back to rlimits
//! (see [`fallback_limits`]). An rlimit caps total cpu seconds, never the
//! rate, so a cpu share below 1.0 is not throttled on those runtimes.

mod bubblewrap;
mod container;
mod firejail;
mod gvisor;
mod macos;
mod nsjail;

pub use bubblewrap::BubblewrapBackend;
pub use container::ContainerBackend;
pub use firejail::FirejailBackend;
pub use gvisor::GvisorBackend;
pub use macos::MacosBackend;
pub use nsjail::NsjailBackend;

use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{ExecOptions, ExecOutput};
use crate::mock::MockAdapter;
use crate::process::{run_process, ProcessLimits, ProcessSpec};
use crate::request::{ExecutionRequest, Language};
use crate::traits::{AdapterFactory, RuntimeAdapter};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::constants::{SANDBOX_KILL_GRACE_MS, SANDBOX_WORKDIR};

/// PATH seen inside every sandbox
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// One resolved run, before a backend wraps it
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Unique per run; container backends name the container after it
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    /// Base environment overlaid with the request's variables
    pub env: BTreeMap<String, String>,
    /// Host directory backing the workspace
    pub workspace: PathBuf,
    /// Workspace path as seen from inside the sandbox
    pub workdir: PathBuf,
    /// Working directory as seen from inside the sandbox
    pub cwd: PathBuf,
    pub language: Option<Language>,
    /// Effective timeout of this run; backend-side backstops derive from it
    pub timeout_ms: u64,
}

/// How one isolation technology wraps an invocation
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> RuntimeKind;

    /// Host binary that must be on PATH
    fn binary(&self) -> &'static str;

    /// Where the workspace appears inside the sandbox
    fn workdir(&self, _workspace: &Path) -> PathBuf {
        PathBuf::from(SANDBOX_WORKDIR)
    }

    /// Build the host command line for `invocation`
    fn wrap(
        &self,
        binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec>;

    /// Host command that stops a run whose wrapper process was killed
    ///
    /// Needed when the sandbox outlives its supervising process, as a
    /// container does. Runs after a timeout or cancel and when the execution
    /// is dropped mid-run.
    fn teardown(&self, _binary: &Path, _invocation: &Invocation) -> Option<ProcessSpec> {
        None
    }
}

/// Adapter for a real isolation technology
pub struct NativeAdapter<B: Backend> {
    backend: B,
    config: SandboxConfig,
    binary: Option<PathBuf>,
    workspace: Option<TempDir>,
    /// Host spellings of the workspace path, redacted from output
    host_paths: Vec<String>,
}

impl<B: Backend> NativeAdapter<B> {
    pub fn new(backend: B, config: SandboxConfig) -> Self {
        Self {
            backend,
            config,
            binary: None,
            workspace: None,
            host_paths: Vec::new(),
        }
    }

    /// Host workspace, once initialized
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|dir| dir.path())
    }

    fn invocation(
        &self,
        request: &ExecutionRequest,
        workspace: &Path,
        options: &ExecOptions,
    ) -> Invocation {
        let workdir = self.backend.workdir(workspace);

        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
        env.insert("HOME".to_string(), workdir.display().to_string());
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        env.extend(request.env().iter().map(|(k, v)| (k.clone(), v.clone())));

        let (program, args, cwd, language) = match request {
            ExecutionRequest::Code(code) => {
                // validate() has already rejected unknown languages
                let language = Language::parse(&code.language).unwrap_or(Language::Sh);
                let (program, args) = language.interpreter(&code.code);
                (program, args, workdir.clone(), Some(language))
            }
            ExecutionRequest::Command(command) => {
                let cwd = match &command.cwd {
                    Some(cwd) => workdir.join(cwd),
                    None => workdir.clone(),
                };
                (command.command.clone(), command.args.clone(), cwd, None)
            }
        };

        Invocation {
            id: Uuid::new_v4().simple().to_string(),
            program,
            args,
            env,
            workspace: workspace.to_path_buf(),
            workdir,
            cwd,
            language,
            timeout_ms: options.timeout_ms,
        }
    }
}

#[async_trait]
impl<B: Backend> RuntimeAdapter for NativeAdapter<B> {
    fn kind(&self) -> RuntimeKind {
        self.backend.kind()
    }

    async fn initialize(&mut self) -> SandboxResult<()> {
        if self.workspace.is_some() {
            return Ok(());
        }

        let binary = which::which(self.backend.binary()).map_err(|e| SandboxError::NotAvailable {
            requested: self.backend.kind(),
            reason: format!("{} not found: {}", self.backend.binary(), e),
        })?;

        let workspace = tempfile::Builder::new().prefix("warden-").tempdir()?;
        let mut host_paths = vec![workspace.path().display().to_string()];
        if let Ok(canonical) = workspace.path().canonicalize() {
            let canonical = canonical.display().to_string();
            if !host_paths.contains(&canonical) {
                host_paths.push(canonical);
            }
        }
        // Longest first so a prefix never leaves a partial host path behind.
        host_paths.sort_by_key(|p| std::cmp::Reverse(p.len()));

        info!(
            runtime = %self.backend.kind(),
            binary = %binary.display(),
            workspace = %workspace.path().display(),
            "Native sandbox adapter initialized"
        );

        self.binary = Some(binary);
        self.workspace = Some(workspace);
        self.host_paths = host_paths;
        Ok(())
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecOptions,
    ) -> SandboxResult<ExecOutput> {
        let (Some(binary), Some(workspace)) = (&self.binary, &self.workspace) else {
            return Err(SandboxError::InvalidState {
                current: "uninitialized".to_string(),
                expected: "initialized".to_string(),
            });
        };
        let workspace = workspace.path();

        prepare_workspace(workspace, request).await?;

        let invocation = self.invocation(request, workspace, options);
        let spec = self.backend.wrap(binary, &invocation, &self.config)?;
        debug!(
            runtime = %self.backend.kind(),
            program = %invocation.program,
            run_id = %invocation.id,
            "Executing in sandbox"
        );

        let mut teardown = TeardownGuard::new(self.backend.teardown(binary, &invocation));
        let output = run_process(&spec, options).await;
        let teardown = teardown.disarm();
        let output = output?;
        if output.killed() {
            if let Some(spec) = teardown {
                run_teardown(spec).await;
            }
        }

        Ok(self
            .host_paths
            .iter()
            .fold(output, |output, host| output.redact(host, SANDBOX_WORKDIR)))
    }

    async fn cleanup(&mut self) -> SandboxResult<()> {
        self.binary = None;
        self.host_paths.clear();
        if let Some(workspace) = self.workspace.take() {
            debug!(workspace = %workspace.path().display(), "Removing sandbox workspace");
            workspace.close()?;
        }
        Ok(())
    }
}

/// Empty the workspace, then write the request's files into it
async fn prepare_workspace(workspace: &Path, request: &ExecutionRequest) -> SandboxResult<()> {
    let mut entries = tokio::fs::read_dir(workspace).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }

    if let ExecutionRequest::Code(code) = request {
        for (relative, content) in &code.files {
            let path = workspace.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
    }

    if let ExecutionRequest::Command(command) = request {
        if let Some(cwd) = &command.cwd {
            tokio::fs::create_dir_all(workspace.join(cwd)).await?;
        }
    }
    Ok(())
}

/// Runs a backend teardown when the execution future is dropped mid-run
struct TeardownGuard {
    spec: Option<ProcessSpec>,
}

impl TeardownGuard {
    fn new(spec: Option<ProcessSpec>) -> Self {
        Self { spec }
    }

    /// The run ended on its own; hand the teardown back to the caller
    fn disarm(&mut self) -> Option<ProcessSpec> {
        self.spec.take()
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(spec) = self.spec.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(program = %spec.program, "Execution dropped mid-run, scheduling teardown");
                handle.spawn(run_teardown(spec));
            }
            Err(_) => warn!(program = %spec.program, "No runtime left to run sandbox teardown"),
        }
    }
}

async fn run_teardown(spec: ProcessSpec) {
    let options = ExecOptions::new().with_timeout(Duration::from_millis(SANDBOX_KILL_GRACE_MS));
    match run_process(&spec, &options).await {
        Ok(output) if output.is_success() => debug!(args = ?spec.args, "Sandbox torn down"),
        Ok(output) if output.timed_out => warn!(args = ?spec.args, "Timed out tearing down sandbox"),
        Ok(output) => warn!(
            args = ?spec.args,
            exit_code = output.status.code,
            stderr = %output.stderr_string().trim_end(),
            "Sandbox teardown failed"
        ),
        Err(e) => warn!(args = ?spec.args, error = %e, "Failed to run sandbox teardown"),
    }
}

/// rlimits standing in for a missing native memory/cpu mechanism
///
/// Memory caps the data segment. CPU becomes a cpu-seconds budget: the run's
/// timeout times the cpu share, plus one second of slack. Shares below 1.0
/// get the 1.0 budget since the budget is a backstop behind the wall-clock
/// timeout, not a throttle.
pub fn fallback_limits(config: &SandboxConfig, timeout_ms: u64) -> SandboxResult<ProcessLimits> {
    let timeout_secs = Duration::from_millis(timeout_ms).as_secs_f64();
    let cpu_seconds = (timeout_secs * config.cpu.max(1.0)).ceil() as u64 + 1;
    Ok(ProcessLimits {
        data_bytes: Some(config.memory_bytes()?),
        cpu_seconds: Some(cpu_seconds),
    })
}

/// Default adapter factory: mock plus one native adapter per technology
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAdapterFactory;

impl NativeAdapterFactory {
    pub fn new() -> Self {
        Self
    }
}

impl AdapterFactory for NativeAdapterFactory {
    fn create(
        &self,
        kind: RuntimeKind,
        config: &SandboxConfig,
    ) -> SandboxResult<Box<dyn RuntimeAdapter>> {
        let config = config.clone();
        let adapter: Box<dyn RuntimeAdapter> = match kind {
            RuntimeKind::Mock => Box::new(MockAdapter::new()),
            RuntimeKind::Gvisor => Box::new(NativeAdapter::new(GvisorBackend, config)),
            RuntimeKind::Nsjail => Box::new(NativeAdapter::new(NsjailBackend, config)),
            RuntimeKind::Bubblewrap => Box::new(NativeAdapter::new(BubblewrapBackend, config)),
            RuntimeKind::Firejail => Box::new(NativeAdapter::new(FirejailBackend, config)),
            RuntimeKind::Docker => Box::new(NativeAdapter::new(ContainerBackend::docker(), config)),
            RuntimeKind::Podman => Box::new(NativeAdapter::new(ContainerBackend::podman(), config)),
            RuntimeKind::Macos => Box::new(NativeAdapter::new(MacosBackend, config)),
            RuntimeKind::Auto => {
                return Err(SandboxError::ConfigError {
                    reason: "runtime 'auto' must be resolved before building an adapter"
                        .to_string(),
                })
            }
        };
        Ok(adapter)
    }
}
