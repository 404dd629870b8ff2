//! gVisor (`runsc do`)
//!
//! Runs the command in a rootless gVisor sandbox over an overlay of the host
//! root, so the workspace keeps its host path. `runsc do` has no memory or
//! cpu flags; limits come from rlimits on the `runsc` process.

use super::{fallback_limits, Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct GvisorBackend;

impl Backend for GvisorBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Gvisor
    }

    fn binary(&self) -> &'static str {
        "runsc"
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
        let spec = ProcessSpec::new(binary.display().to_string())
            .arg("--rootless")
            .arg("--ignore-cgroups")
            .arg(format!("--network={}", config.network.as_str()))
            .arg("do")
            .arg("--cwd")
            .arg(invocation.cwd.display().to_string())
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned())
            .envs(&invocation.env)
            .cwd(&invocation.cwd)
            .limits(fallback_limits(config, invocation.timeout_ms)?);
        Ok(spec)
    }
}
