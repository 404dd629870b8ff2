//! nsjail
//!
//! Fresh namespaces over a read-only view of the host root, with the
//! workspace bind-mounted at `/workspace`. Memory and cpu are enforced with
//! nsjail's cgroup v2 limits. Its address-space rlimit is lifted to the hard
//! limit since the memory cgroup already bounds resident memory.

use super::{fallback_limits, Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::Path;
use warden_core::constants::SANDBOX_PIDS_COUNT_MAX;

const NOBODY_ID: u32 = 65534;

#[derive(Debug, Clone, Copy, Default)]
pub struct NsjailBackend;

impl Backend for NsjailBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Nsjail
    }

    fn binary(&self) -> &'static str {
        "nsjail"
    }

    fn wrap(
        &self,
        binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec> {
        let memory_bytes = config.memory_bytes()?;
        // Wall-clock backstop one second past the run's own deadline.
        let time_limit_secs = invocation.timeout_ms.div_ceil(1000) + 1;
        let cpu_seconds = fallback_limits(config, invocation.timeout_ms)?
            .cpu_seconds
            .unwrap_or(time_limit_secs);
        let cpu_ms_per_sec = (config.cpu * 1000.0).round().max(1.0) as u64;

        let mut spec = ProcessSpec::new(binary.display().to_string())
            .args(["--mode", "o", "--quiet", "--use_cgroupv2"])
            .arg("--time_limit")
            .arg(time_limit_secs.to_string())
            .arg("--cgroup_mem_max")
            .arg(memory_bytes.to_string())
            .arg("--cgroup_cpu_ms_per_sec")
            .arg(cpu_ms_per_sec.to_string())
            .arg("--cgroup_pids_max")
            .arg(SANDBOX_PIDS_COUNT_MAX.to_string())
            .args(["--rlimit_as", "hard"])
            .arg("--rlimit_cpu")
            .arg(cpu_seconds.to_string())
            .arg("--user")
            .arg(NOBODY_ID.to_string())
            .arg("--group")
            .arg(NOBODY_ID.to_string())
            .args(["--chroot", "/"]);

        if !config.read_only_fs {
            spec = spec.arg("--rw");
        }
        if config.network.is_enabled() {
            spec = spec.arg("--disable_clone_newnet");
        }

        spec = spec
            .arg("--bindmount")
            .arg(format!(
                "{}:{}",
                invocation.workspace.display(),
                invocation.workdir.display()
            ))
            .arg("--cwd")
            .arg(invocation.cwd.display().to_string());

        for (key, value) in &invocation.env {
            spec = spec.arg("--env").arg(format!("{}={}", key, value));
        }

        // nsjail execs its argument verbatim; env does the PATH lookup.
        let spec = spec
            .args(["--", "/usr/bin/env"])
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned());
        Ok(spec)
    }
}
