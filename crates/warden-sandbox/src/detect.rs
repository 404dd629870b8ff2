//! Runtime detection and selection
//!
//! Probing the host never fails: a missing tool is reported as unavailable.
//! Selection walks [`RuntimeKind::PRIORITY`], never the order probes finished.

use crate::config::RuntimeKind;
use crate::error::{SandboxError, SandboxResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use warden_core::constants::DETECT_PROBE_TIMEOUT_MS;

/// Availability of one runtime on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub name: RuntimeKind,
    pub available: bool,
}

impl RuntimeDescriptor {
    pub fn new(name: RuntimeKind, available: bool) -> Self {
        Self { name, available }
    }
}

/// Reports which runtimes are usable
#[async_trait]
pub trait RuntimeDetector: Send + Sync {
    /// Availability list, one entry per runtime in priority order
    async fn detect(&self) -> Vec<RuntimeDescriptor>;
}

/// Probes the host once and caches the answer
#[derive(Debug, Default)]
pub struct HostRuntimeDetector {
    cache: OnceCell<Vec<RuntimeDescriptor>>,
    probe_timeout_ms: Option<u64>,
}

impl HostRuntimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(DETECT_PROBE_TIMEOUT_MS))
    }

    async fn probe_all(&self) -> Vec<RuntimeDescriptor> {
        let timeout = self.probe_timeout();
        let probes = RuntimeKind::PRIORITY
            .iter()
            .map(|&kind| async move { RuntimeDescriptor::new(kind, probe(kind, timeout).await) });
        let descriptors = futures::future::join_all(probes).await;

        for descriptor in &descriptors {
            debug!(
                runtime = %descriptor.name,
                available = descriptor.available,
                "Probed sandbox runtime"
            );
        }
        descriptors
    }
}

#[async_trait]
impl RuntimeDetector for HostRuntimeDetector {
    async fn detect(&self) -> Vec<RuntimeDescriptor> {
        self.cache.get_or_init(|| self.probe_all()).await.clone()
    }
}

async fn probe(kind: RuntimeKind, timeout: Duration) -> bool {
    match kind {
        RuntimeKind::Gvisor => on_path("runsc"),
        RuntimeKind::Nsjail => cfg!(target_os = "linux") && on_path("nsjail"),
        RuntimeKind::Bubblewrap => cfg!(target_os = "linux") && on_path("bwrap"),
        RuntimeKind::Firejail => cfg!(target_os = "linux") && on_path("firejail"),
        RuntimeKind::Docker => daemon_reachable("docker", timeout).await,
        RuntimeKind::Podman => daemon_reachable("podman", timeout).await,
        RuntimeKind::Macos => {
            cfg!(target_os = "macos") && std::path::Path::new("/usr/bin/sandbox-exec").exists()
        }
        RuntimeKind::Mock | RuntimeKind::Auto => false,
    }
}

fn on_path(binary: &str) -> bool {
    which::which(binary).is_ok()
}

/// Container engines count only when the binary answers `info`
async fn daemon_reachable(binary: &str, timeout: Duration) -> bool {
    let Ok(path) = which::which(binary) else {
        return false;
    };

    let mut cmd = Command::new(path);
    cmd.arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!(binary, error = %e, "Runtime probe failed to spawn");
            false
        }
        Err(_) => {
            debug!(binary, timeout_ms = timeout.as_millis() as u64, "Runtime probe timed out");
            false
        }
    }
}

/// Detector with a fixed answer
#[derive(Debug, Clone, Default)]
pub struct StaticRuntimeDetector {
    descriptors: Vec<RuntimeDescriptor>,
}

impl StaticRuntimeDetector {
    pub fn new(descriptors: Vec<RuntimeDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Only the listed runtimes are available
    pub fn available(kinds: &[RuntimeKind]) -> Self {
        let descriptors = RuntimeKind::PRIORITY
            .iter()
            .map(|kind| RuntimeDescriptor::new(*kind, kinds.contains(kind)))
            .collect();
        Self::new(descriptors)
    }

    /// Nothing is available
    pub fn none() -> Self {
        Self::available(&[])
    }
}

#[async_trait]
impl RuntimeDetector for StaticRuntimeDetector {
    async fn detect(&self) -> Vec<RuntimeDescriptor> {
        self.descriptors.clone()
    }
}

/// Resolve the runtime to use from a request and an availability list
///
/// `auto` takes the highest-priority available runtime. An explicit runtime is
/// used when available; otherwise it falls back the same way when
/// `fallback_enabled`, and fails with `NotAvailable` when not.
pub fn select_runtime(
    requested: RuntimeKind,
    fallback_enabled: bool,
    descriptors: &[RuntimeDescriptor],
) -> SandboxResult<RuntimeKind> {
    let is_available = |kind: RuntimeKind| {
        descriptors
            .iter()
            .any(|d| d.name == kind && d.available)
    };
    let best = RuntimeKind::PRIORITY
        .iter()
        .copied()
        .find(|kind| is_available(*kind));

    match requested {
        RuntimeKind::Mock => Ok(RuntimeKind::Mock),
        RuntimeKind::Auto => best.ok_or_else(|| SandboxError::NotAvailable {
            requested,
            reason: "no sandbox runtime detected on this host".to_string(),
        }),
        kind if is_available(kind) => Ok(kind),
        kind if !fallback_enabled => Err(SandboxError::NotAvailable {
            requested: kind,
            reason: "requested runtime is unavailable and fallback is disabled".to_string(),
        }),
        kind => match best {
            Some(fallback) => {
                warn!(
                    requested = %kind,
                    selected = %fallback,
                    "Requested sandbox runtime unavailable, falling back"
                );
                Ok(fallback)
            }
            None => Err(SandboxError::NotAvailable {
                requested: kind,
                reason: "requested runtime is unavailable and no fallback was detected"
                    .to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_picks_highest_priority() {
        let descriptors = vec![
            RuntimeDescriptor::new(RuntimeKind::Podman, true),
            RuntimeDescriptor::new(RuntimeKind::Docker, true),
            RuntimeDescriptor::new(RuntimeKind::Gvisor, false),
        ];
        let selected = select_runtime(RuntimeKind::Auto, true, &descriptors).unwrap();
        assert_eq!(selected, RuntimeKind::Docker);
    }

    #[test]
    fn test_explicit_available_runtime_wins() {
        let detector = StaticRuntimeDetector::available(&[RuntimeKind::Gvisor, RuntimeKind::Podman]);
        let selected = select_runtime(RuntimeKind::Podman, true, &detector.descriptors).unwrap();
        assert_eq!(selected, RuntimeKind::Podman);
    }

    #[test]
    fn test_fallback_enabled() {
        let detector = StaticRuntimeDetector::available(&[RuntimeKind::Firejail, RuntimeKind::Docker]);
        let selected = select_runtime(RuntimeKind::Gvisor, true, &detector.descriptors).unwrap();
        assert_eq!(selected, RuntimeKind::Firejail);
    }

    #[test]
    fn test_fallback_disabled() {
        let detector = StaticRuntimeDetector::available(&[RuntimeKind::Docker]);
        let err = select_runtime(RuntimeKind::Gvisor, false, &detector.descriptors).unwrap_err();
        assert_eq!(err.code(), "NOT_AVAILABLE");
    }

    #[test]
    fn test_nothing_available() {
        let detector = StaticRuntimeDetector::none();
        assert!(matches!(
            select_runtime(RuntimeKind::Auto, true, &detector.descriptors),
            Err(SandboxError::NotAvailable { .. })
        ));
        assert!(matches!(
            select_runtime(RuntimeKind::Nsjail, true, &detector.descriptors),
            Err(SandboxError::NotAvailable { .. })
        ));
    }

    #[test]
    fn test_mock_needs_no_detection() {
        let selected = select_runtime(RuntimeKind::Mock, false, &[]).unwrap();
        assert_eq!(selected, RuntimeKind::Mock);
    }

    #[tokio::test]
    async fn test_host_detector_lists_every_runtime_once() {
        let detector = HostRuntimeDetector::new().with_probe_timeout(Duration::from_millis(500));
        let first = detector.detect().await;
        let second = detector.detect().await;

        assert_eq!(first.len(), RuntimeKind::PRIORITY.len());
        assert_eq!(first, second);
        for (descriptor, kind) in first.iter().zip(RuntimeKind::PRIORITY) {
            assert_eq!(descriptor.name, kind);
        }
    }
}
