//! firejail
//!
//! Seccomp, dropped capabilities and a read-only host view with only the
//! workspace writable. The workspace keeps its host path; output is
//! redacted by the adapter.
//!
//! firejail has no cgroup flags. Memory and cpu come from rlimits set on the
//! firejail process itself, which the sandboxed program inherits. Memory caps
//! the data segment since firejail only offers an address-space rlimit.

use super::{fallback_limits, Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::{Path, PathBuf};
use warden_core::constants::SANDBOX_PIDS_COUNT_MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct FirejailBackend;

impl Backend for FirejailBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Firejail
    }

    fn binary(&self) -> &'static str {
        "firejail"
    }

    fn workdir(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }

    fn wrap(
        &self,
        binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec> {
        let mut spec = ProcessSpec::new(binary.display().to_string()).args([
            "--quiet",
            "--noprofile",
            "--seccomp",
            "--caps.drop=all",
            "--nonewprivs",
            "--noroot",
            "--private-tmp",
            "--private-dev",
        ]);
        if !config.network.is_enabled() {
            spec = spec.arg("--net=none");
        }
        if config.read_only_fs {
            spec = spec
                .arg("--read-only=/")
                .arg(format!("--read-write={}", invocation.workspace.display()));
        }

        let spec = spec
            .arg(format!("--rlimit-nproc={}", SANDBOX_PIDS_COUNT_MAX))
            .arg("--")
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned())
            .envs(&invocation.env)
            .cwd(&invocation.cwd)
            .limits(fallback_limits(config, invocation.timeout_ms)?);
        Ok(spec)
    }
}
