//! Caller-driven cancellation
//!
//! A cloneable signal the caller keeps while an execution runs. Cancelling it
//! makes the adapter kill the whole process tree and return a killed result.

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation signal shared between a caller and a running execution
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Self::cancel`] has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on an optional signal; pending forever when absent
pub(crate) async fn cancelled_or_pending(signal: Option<&CancelSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}
