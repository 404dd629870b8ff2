//! Host process runner shared by the native adapters
//!
//! TigerStyle: every child leads its own process group so timeouts and
//! cancellation kill the whole tree, output is capped while the pipes keep
//! draining, and nothing waits past `timeout + SANDBOX_KILL_GRACE_MS`.

use crate::cancel::cancelled_or_pending;
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{ExecOptions, ExecOutput, ExitStatus};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_core::constants::SANDBOX_KILL_GRACE_MS;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Kernel resource limits applied to the child before exec
///
/// Used by runtimes that have no native memory or cpu flag. Memory is capped
/// with `RLIMIT_DATA` (heap and private writable mappings), not
/// `RLIMIT_AS`: JIT runtimes reserve gigabytes of address space they never
/// touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    pub data_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
}

impl ProcessLimits {
    pub fn is_empty(&self) -> bool {
        self.data_bytes.is_none() && self.cpu_seconds.is_none()
    }
}

/// A fully resolved host invocation
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// The child sees exactly this environment
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub limits: ProcessLimits,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn limits(mut self, limits: ProcessLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Default)]
struct Capture {
    data: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run a process to completion, timeout, or cancellation
pub async fn run_process(spec: &ProcessSpec, options: &ExecOptions) -> SandboxResult<ExecOutput> {
    let start = Instant::now();
    let timeout = options.timeout();
    let grace = Duration::from_millis(SANDBOX_KILL_GRACE_MS);
    let max_output = usize::try_from(options.max_output_bytes).unwrap_or(usize::MAX);

    if options.is_cancelled() {
        return Ok(ExecOutput::cancelled(0));
    }

    let mut child = spawn(spec)?;
    let pid = child.id();
    // Declared after `child` so it drops first, while the leader is unreaped.
    let group = GroupGuard::new(pid);

    let stdout = Arc::new(Mutex::new(Capture::default()));
    let stderr = Arc::new(Mutex::new(Capture::default()));
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(tokio::spawn(drain(pipe, stdout.clone(), max_output)));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(tokio::spawn(drain(pipe, stderr.clone(), max_output)));
    }

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status?),
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        _ = cancelled_or_pending(options.cancel.as_ref()) => Outcome::Cancelled,
    };

    // Reap anything the command left behind in its group.
    kill_tree(&mut child, pid);
    let status = match &outcome {
        Outcome::Exited(status) => Some(*status),
        Outcome::TimedOut | Outcome::Cancelled => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => {
                    warn!(program = %spec.program, pid, "Process did not exit after SIGKILL");
                    None
                }
            }
        }
    };

    group.disarm();
    join_readers(readers, grace).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (stdout, stdout_truncated) = take_capture(&stdout);
    let (stderr, stderr_truncated) = take_capture(&stderr);

    let mut output = match outcome {
        Outcome::Exited(_) => {
            ExecOutput::exited(status.map(ExitStatus::from).unwrap_or_default())
                .with_stdout(stdout)
                .with_stderr(stderr)
                .with_duration(duration_ms)
        }
        Outcome::TimedOut => {
            debug!(program = %spec.program, timeout_ms = options.timeout_ms, "Process timed out");
            ExecOutput::timed_out(duration_ms)
                .with_stdout(stdout)
                .with_stderr(stderr)
        }
        Outcome::Cancelled => {
            debug!(program = %spec.program, "Process cancelled");
            ExecOutput::cancelled(duration_ms)
                .with_stdout(stdout)
                .with_stderr(stderr)
        }
    };
    output.stdout_truncated = stdout_truncated;
    output.stderr_truncated = stderr_truncated;
    Ok(output)
}

fn spawn(spec: &ProcessSpec) -> SandboxResult<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
        if !spec.limits.is_empty() {
            let limits = spec.limits;
            // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_limits(limits));
            }
        }
    }

    cmd.spawn().map_err(|e| SandboxError::IoError {
        reason: format!("failed to spawn '{}': {}", spec.program, e),
    })
}

#[cfg(unix)]
fn apply_limits(limits: ProcessLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = limits.data_bytes {
        setrlimit(Resource::RLIMIT_DATA, bytes, bytes).map_err(std::io::Error::from)?;
    }
    if let Some(seconds) = limits.cpu_seconds {
        setrlimit(Resource::RLIMIT_CPU, seconds, seconds).map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[cfg(unix)]
fn kill_tree(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = kill_group(pid) {
        debug!(pid, error = %e, "killpg failed, killing direct child");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// SIGKILL the process group led by `pid`; a group that is already gone is fine
#[cfg(unix)]
fn kill_group(pid: Option<u32>) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match pid.and_then(|p| i32::try_from(p).ok()) {
        Some(pid) => match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        },
        None => Ok(()),
    }
}

/// Kills the whole group when `run_process` is dropped mid-run
///
/// `kill_on_drop` only reaches the group leader.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// The run finished normally and the group was already handled
    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        debug!(pid, "Execution dropped mid-run, killing process group");
        #[cfg(unix)]
        if let Err(e) = kill_group(Some(pid)) {
            warn!(pid, error = %e, "Failed to kill process group on drop");
        }
    }
}

async fn drain<R>(mut pipe: R, capture: SharedCapture, max_output: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut capture = capture.lock().unwrap_or_else(|e| e.into_inner());
        let room = max_output.saturating_sub(capture.data.len());
        if n > room {
            capture.truncated = true;
        }
        capture.data.extend_from_slice(&buf[..n.min(room)]);
    }
}

/// Pipes held open by escaped descendants must not hold us hostage
async fn join_readers(readers: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn take_capture(capture: &SharedCapture) -> (Bytes, bool) {
    let mut capture = capture.lock().unwrap_or_else(|e| e.into_inner());
    let data = std::mem::take(&mut capture.data);
    (Bytes::from(data), capture.truncated)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh")
            .arg("-c")
            .arg(script)
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = run_process(&sh("echo hello; echo oops >&2"), &ExecOptions::new())
            .await
            .unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout_string(), "hello\n");
        assert_eq!(output.stderr_string(), "oops\n");
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let output = run_process(&sh("exit 3"), &ExecOptions::new()).await.unwrap();
        assert_eq!(output.status.code, 3);
        assert!(!output.killed());
    }

    #[tokio::test]
    async fn test_env_is_exact() {
        let spec = sh("echo \"${SECRET:-unset} $GREETING\"").env("GREETING", "hi");
        let output = run_process(&spec, &ExecOptions::new()).await.unwrap();
        assert_eq!(output.stdout_string(), "unset hi\n");
    }

    #[tokio::test]
    async fn test_output_cap_keeps_draining() {
        let options = ExecOptions::new().with_max_output(10);
        let output = run_process(&sh("yes | head -c 100000"), &options)
            .await
            .unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout.len(), 10);
        assert!(output.stdout_truncated);
        assert!(!output.stderr_truncated);
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let options = ExecOptions::new().with_timeout(Duration::from_millis(200));
        let start = Instant::now();
        // The background sleep holds stdout open; only a group kill ends it.
        let output = run_process(&sh("sleep 30 & sleep 30"), &options)
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(output.killed());
        assert_eq!(output.status.code, 137);
        assert!(start.elapsed() < Duration::from_millis(200 + SANDBOX_KILL_GRACE_MS));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let cancel = CancelSignal::new();
        let options = ExecOptions::new()
            .with_timeout(Duration::from_secs(10))
            .with_cancel(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let output = run_process(&sh("sleep 30"), &options).await.unwrap();
        trigger.await.unwrap();

        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(output.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let spec = ProcessSpec::new("/nonexistent/warden-test-binary");
        let err = run_process(&spec, &ExecOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[tokio::test]
    async fn test_cpu_limit_applies() {
        let spec = sh("ulimit -t").limits(ProcessLimits {
            data_bytes: None,
            cpu_seconds: Some(7),
        });
        let output = run_process(&spec, &ExecOptions::new()).await.unwrap();
        assert_eq!(output.stdout_string().trim(), "7");
    }

    #[tokio::test]
    async fn test_memory_limit_caps_data_segment_only() {
        let spec = sh("ulimit -d; ulimit -v").limits(ProcessLimits {
            data_bytes: Some(64 * 1024 * 1024),
            cpu_seconds: None,
        });
        let output = run_process(&spec, &ExecOptions::new()).await.unwrap();
        let stdout = output.stdout_string();
        let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
        // ulimit reports KiB; the address space stays unlimited.
        assert_eq!(lines, vec!["65536", "unlimited"]);
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

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_run_kills_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("background.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let options = ExecOptions::new().with_timeout(Duration::from_secs(30));

        let command = sh(&script);
        let run = run_process(&command, &options);
        assert!(tokio::time::timeout(Duration::from_millis(300), run)
            .await
            .is_err());

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive(pid), "background child {} outlived the dropped run", pid);
    }
}
