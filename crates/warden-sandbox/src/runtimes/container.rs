//! Docker and Podman
//!
//! One throwaway container per run. The engine CLI is the process we
//! supervise; killing it does not stop the container, so a killed or dropped
//! run is followed by an explicit `kill` of the named container.

use super::{Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::Path;
use warden_core::constants::SANDBOX_PIDS_COUNT_MAX;

/// Image for command requests when the config pins none
pub const CONTAINER_IMAGE_DEFAULT: &str = "alpine:3.20";

/// Container name prefix; the run id completes it
pub const CONTAINER_NAME_PREFIX: &str = "warden-";

#[derive(Debug, Clone, Copy)]
pub struct ContainerBackend {
    engine: RuntimeKind,
}

impl ContainerBackend {
    pub fn docker() -> Self {
        Self {
            engine: RuntimeKind::Docker,
        }
    }

    pub fn podman() -> Self {
        Self {
            engine: RuntimeKind::Podman,
        }
    }

    fn container_name(invocation: &Invocation) -> String {
        format!("{}{}", CONTAINER_NAME_PREFIX, invocation.id)
    }

    /// Engine CLI invocation that can reach the daemon
    fn engine(binary: &Path) -> ProcessSpec {
        let spec = ProcessSpec::new(binary.display().to_string()).env("PATH", super::SANDBOX_PATH);
        // The engine CLI locates its socket through these.
        ["HOME", "DOCKER_HOST", "XDG_RUNTIME_DIR", "CONTAINER_HOST"]
            .into_iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
            .fold(spec, |spec, (key, value)| spec.env(key, value))
    }
}

impl Backend for ContainerBackend {
    fn kind(&self) -> RuntimeKind {
        self.engine
    }

    fn binary(&self) -> &'static str {
        match self.engine {
            RuntimeKind::Podman => "podman",
            _ => "docker",
        }
    }

    fn wrap(
        &self,
        binary: &Path,
        invocation: &Invocation,
        config: &SandboxConfig,
    ) -> SandboxResult<ProcessSpec> {
        let memory_bytes = config.memory_bytes()?;
        let image = config.image.clone().unwrap_or_else(|| {
            invocation
                .language
                .map(|l| l.default_image())
                .unwrap_or(CONTAINER_IMAGE_DEFAULT)
                .to_string()
        });

        let mut spec = Self::engine(binary)
            .args(["run", "--rm", "-i"])
            .arg("--name")
            .arg(Self::container_name(invocation))
            .arg(format!("--network={}", config.network.as_str()))
            .arg(format!("--memory={}", memory_bytes))
            // Equal to --memory: no swap on top of the limit.
            .arg(format!("--memory-swap={}", memory_bytes))
            .arg(format!("--cpus={}", config.cpu))
            .arg(format!("--pids-limit={}", SANDBOX_PIDS_COUNT_MAX))
            .args(["--security-opt", "no-new-privileges", "--cap-drop", "ALL"]);

        if config.read_only_fs {
            spec = spec.args(["--read-only", "--tmpfs", "/tmp"]);
        }

        spec = spec
            .arg("-v")
            .arg(format!(
                "{}:{}",
                invocation.workspace.display(),
                invocation.workdir.display()
            ))
            .arg("-w")
            .arg(invocation.cwd.display().to_string());

        for (key, value) in &invocation.env {
            spec = spec.arg("-e").arg(format!("{}={}", key, value));
        }

        Ok(spec
            .arg(image)
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned())
            .cwd(&invocation.workspace))
    }

    fn teardown(&self, binary: &Path, invocation: &Invocation) -> Option<ProcessSpec> {
        Some(
            Self::engine(binary)
                .arg("kill")
                .arg(Self::container_name(invocation)),
        )
    }
}
