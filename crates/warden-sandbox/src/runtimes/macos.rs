//! macOS Seatbelt (`sandbox-exec`)
//!
//! Generates an SBPL profile per run. Reads are allowed, writes only inside
//! the workspace (unless the filesystem is writable), network per config.
//! Seatbelt has no resource limits; rlimits cover memory and cpu.

use super::{fallback_limits, Backend, Invocation};
use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::SandboxResult;
use crate::process::ProcessSpec;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct MacosBackend;

impl Backend for MacosBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Macos
    }

    fn binary(&self) -> &'static str {
        "sandbox-exec"
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
            .arg("-p")
            .arg(profile(&invocation.workspace, config))
            .arg(&invocation.program)
            .args(invocation.args.iter().cloned())
            .envs(&invocation.env)
            .cwd(&invocation.cwd)
            .limits(fallback_limits(config, invocation.timeout_ms)?);
        Ok(spec)
    }
}

fn profile(workspace: &Path, config: &SandboxConfig) -> String {
    let workspace = sbpl_string(&workspace.display().to_string());
    let mut rules = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process-fork)".to_string(),
        "(allow process-exec)".to_string(),
        "(allow signal (target same-sandbox))".to_string(),
        "(allow sysctl-read)".to_string(),
        "(allow mach-lookup)".to_string(),
        "(allow file-read*)".to_string(),
    ];

    if config.read_only_fs {
        rules.push(format!(
            "(allow file-write* (subpath {}) (literal \"/dev/null\"))",
            workspace
        ));
    } else {
        rules.push("(allow file-write*)".to_string());
    }

    if config.network.is_enabled() {
        rules.push("(allow network*)".to_string());
    } else {
        rules.push("(deny network*)".to_string());
    }
    rules.join("\n")
}

/// Quote a path as an SBPL string literal
fn sbpl_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMode;
    use crate::request::ExecutionRequest;
    use crate::runtimes::tests::invocation;

    #[test]
    fn test_profile_confines_writes_and_network() {
        let profile = profile(Path::new("/private/tmp/warden-x"), &SandboxConfig::default());
        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains("(allow file-write* (subpath \"/private/tmp/warden-x\")"));
        assert!(profile.contains("(deny network*)"));
        assert!(!profile.contains("(allow network*)"));
    }

    #[test]
    fn test_profile_open_network_and_writes() {
        let config = SandboxConfig::default()
            .with_network(NetworkMode::Host)
            .with_read_only_fs(false);
        let profile = profile(Path::new("/tmp/w"), &config);
        assert!(profile.contains("(allow network*)"));
        assert!(profile.contains("(allow file-write*)\n"));
    }

    #[test]
    fn test_wrap_sandbox_exec() {
        let inv = invocation(MacosBackend, &ExecutionRequest::code("print 1", "perl"));
        let spec = MacosBackend
            .wrap(Path::new("/usr/bin/sandbox-exec"), &inv, &SandboxConfig::default())
            .unwrap();

        assert_eq!(spec.args[0], "-p");
        assert_eq!(&spec.args[2..], ["perl", "-e", "print 1"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp/warden-test")));
        assert!(spec.limits.data_bytes.is_some());
    }

    #[test]
    fn test_sbpl_string_escapes() {
        assert_eq!(sbpl_string("a\"b"), "\"a\\\"b\"");
    }
}
