//! bubblewrap (`bwrap`)
//!
//! Unshares every namespace (network too, unless host networking was asked
//! for) and builds a minimal root from the host's system directories. bwrap
//! has no resource flags, so memory and cpu fall back to rlimits.

use super::{fallback_limits, Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::Path;

/// Host directories mounted into the sandbox root
const SYSTEM_DIRS: [&str; 7] = ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt"];

#[derive(Debug, Clone, Copy, Default)]
pub struct BubblewrapBackend;

impl Backend for BubblewrapBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Bubblewrap
    }

    fn binary(&self) -> &'static str {
        "bwrap"
    }

    fn wrap(
        &self,
        binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec> {
        let mut spec = ProcessSpec::new(binary.display().to_string())
            .args(["--unshare-all", "--die-with-parent", "--new-session"]);
        if config.network.is_enabled() {
            spec = spec.arg("--share-net");
        }

        let bind = if config.read_only_fs {
            "--ro-bind-try"
        } else {
            "--bind-try"
        };
        for dir in SYSTEM_DIRS {
            spec = spec.args([bind, dir, dir]);
        }

        spec = spec
            .args(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"])
            .arg("--bind")
            .arg(invocation.workspace.display().to_string())
            .arg(invocation.workdir.display().to_string())
            .arg("--chdir")
            .arg(invocation.cwd.display().to_string())
            .arg("--clearenv");

        for (key, value) in &invocation.env {
            spec = spec.arg("--setenv").arg(key).arg(value);
        }

        let spec = spec
            .arg("--")
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned())
            .env("PATH", super::SANDBOX_PATH)
            .cwd(&invocation.workspace)
            .limits(fallback_limits(config, invocation.timeout_ms)?);
        Ok(spec)
    }
}
