//! Sandbox pool with FIFO hand-off
//!
//! TigerStyle: Fixed pool size, one critical section per acquire/release.
//!
//! The free list and wait queue live behind a single mutex that is never held
//! across an await. A release goes straight to the oldest live waiter when
//! there is one. Once initialized, `free + held + promised = pool_size`.

use crate::config::{SandboxConfigInput, SandboxPoolConfig};
use crate::detect::{HostRuntimeDetector, RuntimeDetector};
use crate::error::{SandboxError, SandboxResult};
use crate::executor::SandboxExecutor;
use crate::request::{ExecutionContext, ExecutionRequest};
use crate::result::ExecutionResult;
use crate::runtimes::NativeAdapterFactory;
use crate::traits::AdapterFactory;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use warden_core::audit::{AuditSink, TracingAuditSink};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Configured capacity
    pub total: usize,
    /// Executors free right now (all of them before initialization)
    pub available: usize,
    /// Executors actually created; 0 before initialization
    pub pool_size: usize,
    /// Callers queued in `acquire()`
    pub waiting: usize,
    /// Executors held by callers or promised to a waiter
    pub in_use: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    /// Acquisitions that had to queue
    pub total_waited: u64,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<SandboxExecutor>,
    waiters: VecDeque<oneshot::Sender<SandboxExecutor>>,
    in_use: usize,
    initialized: bool,
    /// Bumped by shutdown; executors from older generations are discarded
    generation: u64,
    total_acquired: u64,
    total_released: u64,
    total_waited: u64,
}

enum Slot {
    Free(SandboxExecutor),
    Queued(oneshot::Receiver<SandboxExecutor>),
    Uninitialized,
}

struct PoolShared {
    config: SandboxPoolConfig,
    detector: Arc<dyn RuntimeDetector>,
    factory: Arc<dyn AdapterFactory>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<PoolState>,
    /// Serializes initialization and shutdown
    lifecycle: tokio::sync::Mutex<()>,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builder for [`SandboxPool`]
pub struct SandboxPoolBuilder {
    config: SandboxPoolConfig,
    detector: Option<Arc<dyn RuntimeDetector>>,
    factory: Option<Arc<dyn AdapterFactory>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl SandboxPoolBuilder {
    /// Detector shared by every executor in the pool
    pub fn with_detector(mut self, detector: Arc<dyn RuntimeDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> SandboxResult<SandboxPool> {
        self.config.validate()?;
        Ok(SandboxPool {
            shared: Arc::new(PoolShared {
                config: self.config,
                detector: self
                    .detector
                    .unwrap_or_else(|| Arc::new(HostRuntimeDetector::new())),
                factory: self
                    .factory
                    .unwrap_or_else(|| Arc::new(NativeAdapterFactory::new())),
                audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
                state: Mutex::new(PoolState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

/// A fixed-size set of reusable sandbox executors
///
/// Cheap to clone; clones share the same executors.
#[derive(Clone)]
pub struct SandboxPool {
    shared: Arc<PoolShared>,
}

impl SandboxPool {
    /// Create a pool; executors are created on first `acquire()`
    pub fn new(config: SandboxPoolConfig) -> SandboxResult<Self> {
        Self::builder(config).build()
    }

    /// Create from caller input in either the canonical or simplified shape
    pub fn from_input(input: &SandboxConfigInput) -> SandboxResult<Self> {
        Self::new(input.normalize_pool())
    }

    pub fn builder(config: SandboxPoolConfig) -> SandboxPoolBuilder {
        SandboxPoolBuilder {
            config,
            detector: None,
            factory: None,
            audit: None,
        }
    }

    pub fn config(&self) -> &SandboxPoolConfig {
        &self.shared.config
    }

    /// Take an executor, waiting in FIFO order when none is free
    ///
    /// The first call initializes the whole pool. Fails with `NotAvailable`
    /// when no runtime can be selected, and with `PoolShutDown` when the pool
    /// is shut down while waiting.
    pub async fn acquire(&self) -> SandboxResult<SandboxExecutor> {
        loop {
            self.ensure_initialized().await?;
            match self.take_or_enqueue() {
                Slot::Free(executor) => return Ok(executor),
                Slot::Queued(rx) => {
                    let ticket = WaitTicket {
                        rx,
                        pool: self.clone(),
                        done: false,
                    };
                    return ticket.wait().await;
                }
                // Shut down between initialization and here; start over.
                Slot::Uninitialized => continue,
            }
        }
    }

    fn take_or_enqueue(&self) -> Slot {
        let mut state = self.shared.lock_state();
        if !state.initialized {
            return Slot::Uninitialized;
        }
        if let Some(executor) = state.free.pop_front() {
            state.in_use += 1;
            state.total_acquired += 1;
            return Slot::Free(executor);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        state.total_waited += 1;
        debug!(waiting = state.waiters.len(), "Pool exhausted, queued for executor");
        Slot::Queued(rx)
    }

    /// Return an executor taken with [`Self::acquire`]
    pub async fn release(&self, executor: SandboxExecutor) {
        if let Some(mut stale) = self.return_executor(executor) {
            cleanup_stale(&mut stale).await;
        }
    }

    /// Acquire an executor wrapped in a guard that always returns it
    pub async fn lease(&self) -> SandboxResult<PooledExecutor> {
        let executor = self.acquire().await?;
        Ok(PooledExecutor {
            executor: Some(executor),
            pool: self.clone(),
        })
    }

    /// Acquire, execute, release; the executor comes back even on error
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        context: &ExecutionContext,
    ) -> SandboxResult<ExecutionResult> {
        let mut lease = self.lease().await?;
        let result = lease.execute(request, context).await;
        lease.release().await;
        result
    }

    /// Clean up every pooled executor and reset the pool
    ///
    /// Queued callers fail with `PoolShutDown`. Executors still held are
    /// cleaned up when released. A later `acquire()` starts from scratch.
    pub async fn shutdown(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let (executors, rejected) = {
            let mut state = self.shared.lock_state();
            let rejected = state.waiters.len();
            // Dropping the senders wakes every waiter with PoolShutDown.
            state.waiters.clear();
            let executors = std::mem::take(&mut state.free);
            let generation = state.generation + 1;
            *state = PoolState {
                generation,
                ..PoolState::default()
            };
            (executors, rejected)
        };

        let count = executors.len();
        futures::future::join_all(executors.into_iter().map(|mut executor| async move {
            if let Err(e) = executor.cleanup().await {
                warn!(executor_id = %executor.id(), error = %e, "Executor cleanup failed");
            }
        }))
        .await;

        info!(executors = count, waiters_rejected = rejected, "Sandbox pool shut down");
    }

    /// Alias for [`Self::shutdown`]
    pub async fn destroy(&self) {
        self.shutdown().await;
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut state = self.shared.lock_state();
        let configured = self.shared.config.pool_size;

        if !state.initialized {
            return PoolStats {
                total: configured,
                available: configured,
                ..PoolStats::default()
            };
        }

        state.waiters.retain(|waiter| !waiter.is_closed());
        PoolStats {
            total: configured,
            available: state.free.len(),
            pool_size: state.free.len() + state.in_use,
            waiting: state.waiters.len(),
            in_use: state.in_use,
            total_acquired: state.total_acquired,
            total_released: state.total_released,
            total_waited: state.total_waited,
        }
    }

    async fn ensure_initialized(&self) -> SandboxResult<()> {
        if self.shared.lock_state().initialized {
            return Ok(());
        }

        let _lifecycle = self.shared.lifecycle.lock().await;
        let generation = {
            let state = self.shared.lock_state();
            if state.initialized {
                return Ok(());
            }
            state.generation
        };

        let size = self.shared.config.pool_size;
        let mut executors = (0..size)
            .map(|_| self.new_executor(generation))
            .collect::<SandboxResult<Vec<_>>>()?;

        let results =
            futures::future::join_all(executors.iter_mut().map(|executor| executor.initialize()))
                .await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            for executor in &mut executors {
                if let Err(e) = executor.cleanup().await {
                    debug!(executor_id = %executor.id(), error = %e, "Cleanup after failed init");
                }
            }
            warn!(error = %err, "Sandbox pool initialization failed");
            return Err(err);
        }

        let runtime = executors.first().and_then(|e| e.runtime());
        let mut state = self.shared.lock_state();
        state.free = executors.into();
        state.in_use = 0;
        state.initialized = true;
        info!(
            pool_size = size,
            runtime = ?runtime,
            "Sandbox pool initialized"
        );
        Ok(())
    }

    fn new_executor(&self, generation: u64) -> SandboxResult<SandboxExecutor> {
        let mut executor = SandboxExecutor::new(self.shared.config.sandbox.clone())?
            .with_detector(self.shared.detector.clone())
            .with_factory(self.shared.factory.clone())
            .with_audit_sink(self.shared.audit.clone());
        executor.generation = generation;
        Ok(executor)
    }

    /// Hand an executor to the oldest live waiter or the free list
    ///
    /// Returns the executor when it belongs to a previous generation and
    /// must be cleaned up instead.
    fn return_executor(&self, executor: SandboxExecutor) -> Option<SandboxExecutor> {
        let mut state = self.shared.lock_state();
        if !state.initialized || executor.generation != state.generation {
            return Some(executor);
        }

        state.total_released += 1;
        let mut executor = executor;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(executor) {
                Ok(()) => {
                    state.total_acquired += 1;
                    return None;
                }
                // Waiter gave up; try the next one.
                Err(returned) => executor = returned,
            }
        }

        state.in_use = state.in_use.saturating_sub(1);
        state.free.push_back(executor);
        None
    }

    /// Synchronous return path for guards and abandoned waits
    fn return_from_drop(&self, executor: SandboxExecutor) {
        if let Some(mut stale) = self.return_executor(executor) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { cleanup_stale(&mut stale).await });
                }
                Err(_) => warn!(
                    executor_id = %stale.id(),
                    "No runtime to clean up stale executor; dropping it"
                ),
            }
        }
    }
}

async fn cleanup_stale(executor: &mut SandboxExecutor) {
    debug!(executor_id = %executor.id(), "Cleaning up executor from a previous pool generation");
    if let Err(e) = executor.cleanup().await {
        warn!(executor_id = %executor.id(), error = %e, "Executor cleanup failed");
    }
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A queued `acquire()`; if dropped mid-wait, any executor already sent to
/// it goes back through the pool.
struct WaitTicket {
    rx: oneshot::Receiver<SandboxExecutor>,
    pool: SandboxPool,
    done: bool,
}

impl WaitTicket {
    async fn wait(mut self) -> SandboxResult<SandboxExecutor> {
        let received = (&mut self.rx).await;
        self.done = true;
        received.map_err(|_| SandboxError::PoolShutDown)
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(executor) = self.rx.try_recv() {
            self.pool.return_from_drop(executor);
        }
    }
}

/// Scoped lease on a pooled executor
///
/// Returned to the pool by [`Self::release`], or on drop.
pub struct PooledExecutor {
    executor: Option<SandboxExecutor>,
    pool: SandboxPool,
}

impl PooledExecutor {
    pub fn executor(&self) -> Option<&SandboxExecutor> {
        self.executor.as_ref()
    }

    pub async fn execute(
        &mut self,
        request: &ExecutionRequest,
        context: &ExecutionContext,
    ) -> SandboxResult<ExecutionResult> {
        match self.executor.as_mut() {
            Some(executor) => executor.execute(request, context).await,
            None => Err(SandboxError::InvalidState {
                current: "released".to_string(),
                expected: "leased".to_string(),
            }),
        }
    }

    pub async fn release(mut self) {
        if let Some(executor) = self.executor.take() {
            self.pool.release(executor).await;
        }
    }
}

impl Drop for PooledExecutor {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            self.pool.return_from_drop(executor);
        }
    }
}

impl std::fmt::Debug for PooledExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledExecutor")
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeKind, SandboxConfig};
    use crate::detect::StaticRuntimeDetector;
    use std::time::Duration;

    fn mock_pool(size: usize) -> SandboxPool {
        let sandbox = SandboxConfig::default().with_runtime(RuntimeKind::Mock);
        SandboxPool::new(SandboxPoolConfig::new(sandbox).with_pool_size(size)).unwrap()
    }

    fn assert_invariant(pool: &SandboxPool) {
        let stats = pool.stats();
        assert_eq!(stats.available + stats.in_use, stats.pool_size);
        assert_eq!(stats.pool_size, pool.config().pool_size);
    }

    #[tokio::test]
    async fn test_stats_before_initialization() {
        let pool = mock_pool(3);
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.pool_size, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = mock_pool(2);
        let executor = pool.acquire().await.unwrap();
        assert_eq!(executor.runtime(), Some(RuntimeKind::Mock));

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_use, 1);
        assert_invariant(&pool);

        pool.release(executor).await;
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);
        assert_invariant(&pool);
    }

    #[tokio::test]
    async fn test_executors_are_reused() {
        let pool = mock_pool(1);
        let first = pool.acquire().await.unwrap();
        let id = first.id().to_string();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn test_release_hands_off_to_waiter() {
        let pool = mock_pool(1);
        let held = pool.acquire().await.unwrap();
        let held_id = held.id().to_string();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }
        assert_invariant(&pool);

        pool.release(held).await;
        let handed = waiter.await.unwrap().unwrap();
        assert_eq!(handed.id(), held_id);

        // Handed over directly: the free list never saw it.
        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total_waited, 1);
        pool.release(handed).await;
    }

    #[tokio::test]
    async fn test_abandoned_wait_does_not_leak() {
        let pool = mock_pool(1);
        let held = pool.acquire().await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(gave_up.is_err());
        assert_eq!(pool.stats().waiting, 0);

        pool.release(held).await;
        let stats = pool.stats();
        assert_eq!(stats.available, 1);
        assert_invariant(&pool);
    }

    #[tokio::test]
    async fn test_lease_drop_returns_executor() {
        let pool = mock_pool(1);
        {
            let lease = pool.lease().await.unwrap();
            assert!(lease.executor().is_some());
            assert_eq!(pool.stats().available, 0);
        }
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_initialization_failure_propagates() {
        let config = SandboxPoolConfig::new(SandboxConfig::default()).with_pool_size(2);
        let pool = SandboxPool::builder(config)
            .with_detector(Arc::new(StaticRuntimeDetector::none()))
            .build()
            .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SandboxError::NotAvailable { .. }));
        assert_eq!(pool.stats().pool_size, 0);
    }

    #[tokio::test]
    async fn test_shutdown_resets_and_reinitializes() {
        let pool = mock_pool(2);
        let executor = pool.acquire().await.unwrap();
        let old_id = executor.id().to_string();
        pool.release(executor).await;

        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 0);
        assert_eq!(stats.available, 2);

        let executor = pool.acquire().await.unwrap();
        assert_ne!(executor.id(), old_id);
        assert_invariant(&pool);
        pool.release(executor).await;
    }

    #[tokio::test]
    async fn test_release_after_shutdown_discards_executor() {
        let pool = mock_pool(1);
        let executor = pool.acquire().await.unwrap();
        pool.shutdown().await;

        pool.release(executor).await;
        assert_eq!(pool.stats().pool_size, 0);

        let fresh = pool.acquire().await.unwrap();
        assert_invariant(&pool);
        pool.release(fresh).await;
        assert_eq!(pool.stats().available, 1);
    }
}
