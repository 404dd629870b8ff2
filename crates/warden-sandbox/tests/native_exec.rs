//! End-to-end execution through the native adapter on the host
//!
//! TigerStyle: Real processes, real workspace, no isolation tool required.
//!
//! A passthrough backend runs the invocation directly on the host under the
//! same rlimits the rlimit-only runtimes apply, exercising workspace
//! preparation, path redaction, output capture and process-tree termination
//! exactly as the wrapped runtimes use them.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_sandbox::runtimes::{fallback_limits, Backend, Invocation, SANDBOX_PATH};
use warden_sandbox::{
    AdapterFactory, CancelSignal, ExecutionContext, ExecutionRequest, NativeAdapter, ProcessSpec,
    RuntimeAdapter, RuntimeKind, SandboxConfig, SandboxExecutor, SandboxResult,
    StaticRuntimeDetector,
};

/// Runs the program as-is with the workspace as its working directory
#[derive(Clone, Default)]
struct PassthroughBackend {
    /// Teardown writes this file, standing in for a container kill
    teardown_marker: Option<PathBuf>,
}

impl Backend for PassthroughBackend {
    fn kind(&self) -> RuntimeKind {
        // Stands in for a rlimit-only runtime.
        RuntimeKind::Bubblewrap
    }

    fn binary(&self) -> &'static str {
        "sh"
    }

    fn workdir(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }

    fn wrap(
        &self,
        _binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec> {
        Ok(ProcessSpec::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .cwd(&invocation.cwd)
            .limits(fallback_limits(config, invocation.timeout_ms)?))
    }

    fn teardown(&self, binary: &Path, _invocation: &Invocation) -> Option<ProcessSpec> {
        self.teardown_marker.as_ref().map(|marker| {
            ProcessSpec::new(binary.display().to_string())
                .arg("-c")
                .arg(format!("echo torn-down > {}", marker.display()))
                .env("PATH", SANDBOX_PATH)
        })
    }
}

struct PassthroughFactory(PassthroughBackend);

impl AdapterFactory for PassthroughFactory {
    fn create(
        &self,
        _kind: RuntimeKind,
        config: &SandboxConfig,
    ) -> SandboxResult<Box<dyn RuntimeAdapter>> {
        Ok(Box::new(NativeAdapter::new(self.0.clone(), config.clone())))
    }
}

fn host_executor(config: SandboxConfig) -> SandboxExecutor {
    executor_with(config, PassthroughBackend::default())
}

fn executor_with(config: SandboxConfig, backend: PassthroughBackend) -> SandboxExecutor {
    SandboxExecutor::new(config)
        .unwrap()
        .with_detector(Arc::new(StaticRuntimeDetector::available(&[
            RuntimeKind::Bubblewrap,
        ])))
        .with_factory(Arc::new(PassthroughFactory(backend)))
}

/// Interpreter reachable on the sandbox PATH, if installed
fn sandbox_binary(name: &str) -> Option<PathBuf> {
    which::which_in(name, Some(SANDBOX_PATH), "/").ok()
}

async fn wait_until(mut done: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

/// Live process, not a zombie waiting for a reaper
#[cfg(target_os = "linux")]
fn alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

// =============================================================================
// WORKSPACE
// =============================================================================

#[tokio::test]
async fn test_files_written_and_paths_redacted() {
    let mut executor = host_executor(SandboxConfig::default());

    let request = ExecutionRequest::code("cat input.txt; pwd", "sh").with_file("input.txt", "payload");
    let result = executor.execute(&request, &ExecutionContext::new()).await.unwrap();

    assert!(result.success, "stderr: {}", result.stderr);
    let lines: Vec<&str> = result.stdout.lines().collect();
    assert_eq!(lines, vec!["payload", "/workspace"]);
    assert!(!result.stdout.contains("warden-"));

    executor.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_workspace_cleared_between_runs() {
    let mut executor = host_executor(SandboxConfig::default());
    let context = ExecutionContext::new();

    let first = ExecutionRequest::code("echo left-behind > scratch.txt", "sh");
    assert!(executor.execute(&first, &context).await.unwrap().success);

    let second = ExecutionRequest::code("ls", "sh");
    let result = executor.execute(&second, &context).await.unwrap();
    assert!(result.success);
    assert!(result.stdout.is_empty(), "unexpected files: {}", result.stdout);
}

#[tokio::test]
async fn test_command_env_and_cwd() {
    let mut executor = host_executor(SandboxConfig::default());

    let request = ExecutionRequest::command("sh", ["-c", "echo $GREETING; pwd"])
        .with_env("GREETING", "hello")
        .with_cwd("nested/dir");
    let result = executor.execute(&request, &ExecutionContext::new()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.stdout.trim_end(), "hello\n/workspace/nested/dir");
}

#[tokio::test]
async fn test_nonzero_exit_reported() {
    let mut executor = host_executor(SandboxConfig::default());

    let request = ExecutionRequest::code("echo oops >&2; exit 3", "sh");
    let result = executor.execute(&request, &ExecutionContext::new()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr.trim_end(), "oops");
    assert!(!result.killed);
}

// =============================================================================
// TERMINATION
// =============================================================================

#[tokio::test]
async fn test_timeout_kills_process_tree() {
    let mut executor = host_executor(SandboxConfig::default());

    let request = ExecutionRequest::code("sleep 30 & sleep 30", "sh");
    let start = Instant::now();
    let result = executor
        .execute(&request, &ExecutionContext::new().with_timeout_ms(200))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    println!("[NATIVE] timeout returned after {:?}", elapsed);
    assert!(result.timed_out);
    assert!(result.killed);
    assert!(!result.success);
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let mut executor = host_executor(SandboxConfig::default());
    let cancel = CancelSignal::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let request = ExecutionRequest::command("sleep", ["30"]);
    let start = Instant::now();
    let result = executor
        .execute(&request, &ExecutionContext::new().with_cancel(cancel))
        .await
        .unwrap();

    assert!(result.killed);
    assert!(!result.timed_out);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_output_cap_applied() {
    let config = SandboxConfig::default().with_max_output_bytes(1024);
    let mut executor = host_executor(config);

    let request = ExecutionRequest::code("yes x | head -c 100000", "sh");
    let result = executor.execute(&request, &ExecutionContext::new()).await.unwrap();

    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 1024);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropped_execution_kills_descendants_and_tears_down() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("teardown");
    let pid_file = scratch.path().join("background.pid");
    let mut executor = executor_with(
        SandboxConfig::default(),
        PassthroughBackend {
            teardown_marker: Some(marker.clone()),
        },
    );

    let script = format!(
        "sleep 41 & echo $! > {}; sleep 41",
        pid_file.display()
    );
    let request = ExecutionRequest::code(script, "sh");
    let context = ExecutionContext::new().with_timeout_ms(60_000);
    let run = executor.execute(&request, &context);
    assert!(tokio::time::timeout(Duration::from_millis(500), run)
        .await
        .is_err());

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_until(|| !alive(pid), Duration::from_secs(2)).await,
        "background sleep {} survived the dropped execution",
        pid
    );
    assert!(
        wait_until(|| marker.exists(), Duration::from_secs(2)).await,
        "teardown did not run after the execution was dropped"
    );
}

#[tokio::test]
async fn test_completed_execution_skips_teardown() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("teardown");
    let mut executor = executor_with(
        SandboxConfig::default(),
        PassthroughBackend {
            teardown_marker: Some(marker.clone()),
        },
    );

    let result = executor
        .execute(&ExecutionRequest::code("echo done", "sh"), &ExecutionContext::new())
        .await
        .unwrap();
    assert!(result.success);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());
}

// =============================================================================
// LIMITS
// =============================================================================

#[tokio::test]
async fn test_interpreter_starts_under_memory_limit() {
    // JIT runtimes reserve far more address space than the memory limit.
    let (code, language) = if sandbox_binary("node").is_some() {
        ("console.log('hi')", "javascript")
    } else if sandbox_binary("python3").is_some() {
        ("print('hi')", "python")
    } else {
        println!("[NATIVE] no node or python3 on the sandbox PATH, skipping");
        return;
    };
    let mut executor = host_executor(SandboxConfig::default().with_memory("256Mi"));

    let result = executor
        .execute(&ExecutionRequest::code(code, language), &ExecutionContext::new())
        .await
        .unwrap();

    assert!(result.success, "{} failed: {}", language, result.stderr);
    assert_eq!(result.stdout.trim_end(), "hi");
}

#[tokio::test]
async fn test_memory_limit_stops_large_allocation() {
    if sandbox_binary("python3").is_none() {
        println!("[NATIVE] no python3 on the sandbox PATH, skipping");
        return;
    }
    let mut executor = host_executor(SandboxConfig::default().with_memory("128Mi"));

    let request = ExecutionRequest::code("b = bytearray(512 * 1024 * 1024)\nprint(len(b))", "python");
    let result = executor.execute(&request, &ExecutionContext::new()).await.unwrap();

    assert!(!result.success);
    assert!(result.stderr.contains("MemoryError"), "stderr: {}", result.stderr);
}

#[tokio::test]
async fn test_per_call_timeout_widens_cpu_budget() {
    if sandbox_binary("bash").is_none() {
        println!("[NATIVE] no bash on the sandbox PATH, skipping");
        return;
    }
    // Configured timeout 1s; the context allows 8s for a ~3s busy loop.
    let mut executor = host_executor(SandboxConfig::default().with_timeout_ms(1_000));

    let request = ExecutionRequest::code(
        "end=$((SECONDS + 4)); while [ $SECONDS -lt $end ]; do :; done; echo finished",
        "bash",
    );
    let result = executor
        .execute(&request, &ExecutionContext::new().with_timeout_ms(8_000))
        .await
        .unwrap();

    assert!(result.success, "exit {} stderr: {}", result.exit_code, result.stderr);
    assert!(!result.killed);
    assert_eq!(result.stdout.trim_end(), "finished");
}
