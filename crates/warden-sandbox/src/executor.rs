//! Sandbox executor
//!
//! TigerStyle: Explicit state machine with clear transitions.
//!
//! `uninitialized -> initializing -> ready -> (execute)* -> uninitialized`.
//! The executor owns exactly one adapter, chosen once at `initialize()` and
//! reused for every request until `cleanup()`.

use crate::config::{RuntimeKind, SandboxConfig, SandboxConfigInput};
use crate::detect::{select_runtime, HostRuntimeDetector, RuntimeDetector};
use crate::error::{SandboxError, SandboxResult};
use crate::exec::ExecOptions;
use crate::request::{ExecutionContext, ExecutionRequest};
use crate::result::ExecutionResult;
use crate::runtimes::NativeAdapterFactory;
use crate::traits::{AdapterFactory, ExecutorState, RuntimeAdapter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::audit::{AuditDetails, AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
use warden_core::constants::SANDBOX_EXEC_TIMEOUT_MS_MAX;

/// Runs requests through one selected runtime adapter
pub struct SandboxExecutor {
    id: String,
    config: SandboxConfig,
    state: ExecutorState,
    adapter: Option<Box<dyn RuntimeAdapter>>,
    detector: Arc<dyn RuntimeDetector>,
    factory: Arc<dyn AdapterFactory>,
    audit: Arc<dyn AuditSink>,
    /// Pool generation this executor belongs to
    pub(crate) generation: u64,
}

impl SandboxExecutor {
    /// Create an executor; the adapter is chosen on first use
    pub fn new(config: SandboxConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            state: ExecutorState::Uninitialized,
            adapter: None,
            detector: Arc::new(HostRuntimeDetector::new()),
            factory: Arc::new(NativeAdapterFactory::new()),
            audit: Arc::new(TracingAuditSink),
            generation: 0,
        })
    }

    /// Create from caller input in either the canonical or simplified shape
    pub fn from_input(input: &SandboxConfigInput) -> SandboxResult<Self> {
        Self::new(input.normalize())
    }

    pub fn with_detector(mut self, detector: Arc<dyn RuntimeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runtime in use, once initialized
    pub fn runtime(&self) -> Option<RuntimeKind> {
        self.adapter.as_ref().map(|adapter| adapter.kind())
    }

    /// Select a runtime and prepare its adapter; idempotent once ready
    ///
    /// Fails with `NotAvailable` when no runtime can be selected, leaving the
    /// executor uninitialized.
    pub async fn initialize(&mut self) -> SandboxResult<()> {
        if self.state == ExecutorState::Ready {
            return Ok(());
        }

        self.state = ExecutorState::Initializing;
        match self.build_adapter().await {
            Ok(adapter) => {
                info!(
                    executor_id = %self.id,
                    runtime = %adapter.kind(),
                    "Sandbox executor ready"
                );
                self.adapter = Some(adapter);
                self.state = ExecutorState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = ExecutorState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn build_adapter(&self) -> SandboxResult<Box<dyn RuntimeAdapter>> {
        let kind = if self.config.runtime == RuntimeKind::Mock {
            RuntimeKind::Mock
        } else {
            let descriptors = self.detector.detect().await;
            select_runtime(self.config.runtime, self.config.fallback_enabled, &descriptors)?
        };

        let mut adapter = self.factory.create(kind, &self.config)?;
        adapter.initialize().await?;
        Ok(adapter)
    }

    /// Execute one request
    ///
    /// Timeouts and cancellation come back as failed results. An error is
    /// returned only for invalid requests, runtime selection failures and
    /// adapter failures (`ExecutionFailed`).
    pub async fn execute(
        &mut self,
        request: &ExecutionRequest,
        context: &ExecutionContext,
    ) -> SandboxResult<ExecutionResult> {
        request.validate()?;
        let timeout_ms = context.timeout_ms.unwrap_or(self.config.timeout_ms);
        if timeout_ms == 0 || timeout_ms > SANDBOX_EXEC_TIMEOUT_MS_MAX {
            return Err(SandboxError::validation(
                "timeout_ms",
                format!("must be between 1 and {}", SANDBOX_EXEC_TIMEOUT_MS_MAX),
            ));
        }

        if !self.state.can_execute() {
            self.initialize().await?;
        }
        let Some(adapter) = self.adapter.as_ref() else {
            return Err(SandboxError::InvalidState {
                current: self.state.to_string(),
                expected: ExecutorState::Ready.to_string(),
            });
        };
        let runtime = adapter.kind();

        let options = ExecOptions {
            timeout_ms,
            max_output_bytes: self.config.max_output_bytes,
            cancel: context.cancel.clone(),
        };

        let start = Instant::now();
        let outcome = match adapter.execute(request, &options).await {
            Ok(output) => Ok(ExecutionResult::from_output(output, timeout_ms)),
            Err(SandboxError::ExecTimeout { .. }) => Ok(ExecutionResult::timed_out(
                timeout_ms,
                start.elapsed().as_millis() as u64,
            )),
            Err(e @ SandboxError::ExecutionFailed { .. }) => Err(e),
            Err(e) => Err(SandboxError::ExecutionFailed {
                runtime,
                reason: e.to_string(),
            }),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Ok(result) if result.timed_out => warn!(
                executor_id = %self.id,
                runtime = %runtime,
                timeout_ms,
                "Sandbox execution timed out"
            ),
            Ok(result) => debug!(
                executor_id = %self.id,
                runtime = %runtime,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                killed = result.killed,
                "Sandbox execution completed"
            ),
            Err(e) => warn!(
                executor_id = %self.id,
                runtime = %runtime,
                error = %e,
                "Sandbox execution failed"
            ),
        }

        self.record_audit(request, context, runtime, &outcome, duration_ms);
        outcome
    }

    fn record_audit(
        &self,
        request: &ExecutionRequest,
        context: &ExecutionContext,
        runtime: RuntimeKind,
        outcome: &SandboxResult<ExecutionResult>,
        duration_ms: u64,
    ) {
        let Some(user_id) = context.user_id.as_deref() else {
            return;
        };

        let (outcome, details) = match outcome {
            Ok(result) => {
                let outcome = if result.timed_out {
                    AuditOutcome::Timeout
                } else if result.success {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                };
                let details = AuditDetails {
                    exit_code: Some(result.exit_code),
                    timed_out: result.timed_out,
                    duration_ms: result.duration_ms,
                    runtime: Some(runtime.to_string()),
                    error_code: None,
                };
                (outcome, details)
            }
            Err(e) => {
                let details = AuditDetails {
                    exit_code: None,
                    timed_out: false,
                    duration_ms,
                    runtime: Some(runtime.to_string()),
                    error_code: Some(e.code().to_string()),
                };
                (AuditOutcome::Error, details)
            }
        };

        self.audit.record(AuditRecord::sandbox_execution(
            user_id,
            request.resource_name(),
            outcome,
            details,
        ));
    }

    /// Release the adapter and return to `uninitialized`
    pub async fn cleanup(&mut self) -> SandboxResult<()> {
        let result = match self.adapter.take() {
            Some(mut adapter) => adapter.cleanup().await,
            None => Ok(()),
        };
        self.state = ExecutorState::Uninitialized;
        debug!(executor_id = %self.id, "Sandbox executor cleaned up");
        result
    }
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("runtime", &self.runtime())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::detect::StaticRuntimeDetector;
    use crate::exec::ExecOutput;
    use crate::mock::MockAdapter;
    use std::time::Duration;
    use warden_core::audit::{AuditSeverity, MemoryAuditSink};

    fn mock_executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::default().with_runtime(RuntimeKind::Mock)).unwrap()
    }

    /// Mock adapters whose `crash` command fails inside the adapter
    struct FailingFactory;

    impl AdapterFactory for FailingFactory {
        fn create(
            &self,
            _kind: RuntimeKind,
            _config: &SandboxConfig,
        ) -> SandboxResult<Box<dyn RuntimeAdapter>> {
            let adapter = MockAdapter::new().with_handler(
                "crash",
                Box::new(|_: &[String], _: &ExecOptions| -> SandboxResult<ExecOutput> {
                    Err(SandboxError::IoError {
                        reason: "pipe closed".to_string(),
                    })
                }),
            );
            Ok(Box::new(adapter))
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut executor = mock_executor();
        assert_eq!(executor.state(), ExecutorState::Uninitialized);
        assert!(executor.runtime().is_none());

        executor.initialize().await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Ready);
        assert_eq!(executor.runtime(), Some(RuntimeKind::Mock));

        // idempotent
        executor.initialize().await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Ready);

        executor.cleanup().await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Uninitialized);
        assert!(executor.runtime().is_none());
    }

    #[tokio::test]
    async fn test_execute_initializes_lazily() {
        let mut executor = mock_executor();
        let result = executor
            .execute(
                &ExecutionRequest::code("console.log('hi')", "javascript"),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.output, "hi");
        assert_eq!(executor.state(), ExecutorState::Ready);
    }

    #[tokio::test]
    async fn test_timeout_is_a_result() {
        let mut executor = mock_executor();
        let start = Instant::now();
        let result = executor
            .execute(
                &ExecutionRequest::code("while(true){}", "javascript"),
                &ExecutionContext::new().with_timeout_ms(100),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.killed);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_cancel_is_a_result() {
        let mut executor = mock_executor();
        let cancel = CancelSignal::new();
        cancel.cancel();
        let result = executor
            .execute(
                &ExecutionRequest::code("while(true){}", "js"),
                &ExecutionContext::new().with_cancel(cancel),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.killed);
        assert!(!result.timed_out);
        assert_eq!(result.error.as_deref(), Some("execution cancelled"));
    }

    #[tokio::test]
    async fn test_adapter_error_wrapped() {
        let mut executor = mock_executor().with_factory(Arc::new(FailingFactory));
        let err = executor
            .execute(
                &ExecutionRequest::command("crash", Vec::<String>::new()),
                &ExecutionContext::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "EXECUTION_FAILED");
        assert!(err.to_string().contains("pipe closed"));
        // The executor stays usable after an adapter failure.
        assert_eq!(executor.state(), ExecutorState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_initialize() {
        let mut executor = mock_executor();
        let err = executor
            .execute(&ExecutionRequest::code("", "js"), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(executor.state(), ExecutorState::Uninitialized);

        let err = executor
            .execute(
                &ExecutionRequest::code("1", "js"),
                &ExecutionContext::new().with_timeout_ms(0),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_not_available_leaves_uninitialized() {
        let mut executor = SandboxExecutor::new(SandboxConfig::default())
            .unwrap()
            .with_detector(Arc::new(StaticRuntimeDetector::none()));

        let err = executor.initialize().await.unwrap_err();
        assert!(matches!(err, SandboxError::NotAvailable { .. }));
        assert_eq!(executor.state(), ExecutorState::Uninitialized);
        assert!(executor.runtime().is_none());
    }

    #[tokio::test]
    async fn test_audit_records() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut executor = mock_executor()
            .with_factory(Arc::new(FailingFactory))
            .with_audit_sink(sink.clone());

        // No user, no record.
        executor
            .execute(&ExecutionRequest::code("print('x')", "python"), &ExecutionContext::new())
            .await
            .unwrap();
        assert!(sink.is_empty());

        let context = ExecutionContext::new().with_user("user-1");
        executor
            .execute(&ExecutionRequest::code("print('x')", "python"), &context)
            .await
            .unwrap();
        executor
            .execute(&ExecutionRequest::command("false", Vec::<String>::new()), &context)
            .await
            .unwrap();
        executor
            .execute(
                &ExecutionRequest::code("while True: pass", "python"),
                &ExecutionContext::new().with_user("user-1").with_timeout_ms(20),
            )
            .await
            .unwrap();
        executor
            .execute(&ExecutionRequest::command("crash", Vec::<String>::new()), &context)
            .await
            .unwrap_err();

        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert_eq!(records[0].severity, AuditSeverity::Info);
        assert_eq!(records[0].resource.name, "python");
        assert_eq!(records[0].actor.user_id, "user-1");
        assert_eq!(records[0].details.exit_code, Some(0));
        assert_eq!(records[0].details.runtime.as_deref(), Some("mock"));

        assert_eq!(records[1].outcome, AuditOutcome::Failure);
        assert_eq!(records[1].severity, AuditSeverity::Warning);
        assert_eq!(records[1].resource.name, "false");

        assert_eq!(records[2].outcome, AuditOutcome::Timeout);
        assert!(records[2].details.timed_out);

        assert_eq!(records[3].outcome, AuditOutcome::Error);
        assert_eq!(records[3].severity, AuditSeverity::Error);
        assert_eq!(records[3].details.error_code.as_deref(), Some("EXECUTION_FAILED"));
    }
}
