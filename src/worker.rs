//! Cancellable, observable background tasks.
//!
//! Every long-running loop (accept loop, dial loop, per-connection receive
//! and send loops) runs inside a [`BackgroundWorker`]. The worker owns a
//! [`CancellationToken`] handed to the task body and publishes a
//! [`WorkerState`] through a `watch` channel so callers can wait for it to
//! finish with a bound.
//!
//! # Example
//!
//! ```ignore
//! let worker = BackgroundWorker::spawn("ticker", |cancel| async move {
//!     cancel.cancelled().await;
//!     Ok(())
//! });
//! worker.cancel();
//! assert!(worker.wait(Duration::from_secs(1)).await);
//! ```

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PipeplexError, Result};

/// Lifecycle of a background worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// The task body is still running.
    Running,
    /// The task body returned `Ok(())` without being cancelled.
    Completed,
    /// The task body returned an error.
    Failed(String),
    /// The task body returned after cancellation was requested.
    Cancelled,
}

impl WorkerState {
    /// True once the task body has returned.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerState::Running)
    }
}

/// A spawned task with cooperative cancellation and an observable state.
pub struct BackgroundWorker {
    label: String,
    cancel: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    /// Spawn `task` with a fresh cancellation token.
    pub fn spawn<F, Fut>(label: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::spawn_with_token(label, CancellationToken::new(), task)
    }

    /// Spawn `task` driven by an existing token (e.g. a child token).
    pub fn spawn_with_token<F, Fut>(label: impl Into<String>, cancel: CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = watch::channel(WorkerState::Running);
        let body = task(cancel.clone());
        let token = cancel.clone();
        let task_label = label.clone();

        let handle = tokio::spawn(async move {
            let state = match body.await {
                Ok(()) if token.is_cancelled() => WorkerState::Cancelled,
                Ok(()) => WorkerState::Completed,
                Err(PipeplexError::Cancelled) => WorkerState::Cancelled,
                Err(e) => {
                    tracing::error!(worker = %task_label, error = %e, "background worker failed");
                    WorkerState::Failed(e.to_string())
                }
            };
            tracing::debug!(worker = %task_label, ?state, "background worker finished");
            let _ = tx.send(state);
        });

        Self {
            label,
            cancel,
            state: rx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Name used in log output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The token observed by the task body.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current state snapshot.
    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// True once the task has ended, including by abort or panic.
    pub fn is_finished(&self) -> bool {
        if self.state.borrow().is_terminal() {
            return true;
        }
        match self.handle.lock() {
            Ok(slot) => slot.as_ref().map_or(true, |h| h.is_finished()),
            Err(_) => false,
        }
    }

    /// Wait up to `timeout` for the task to end. Returns `true` if it did.
    ///
    /// Must not be called from inside the worker's own task body.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let done = tokio::time::timeout(timeout, rx.wait_for(WorkerState::is_terminal))
            .await
            .is_ok();
        done || self.is_finished()
    }

    /// Cancel and wait up to `timeout`; abort the task if it is still running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.cancel();
        if self.wait(timeout).await {
            return true;
        }
        tracing::warn!(worker = %self.label, ?timeout, "worker did not stop in time, aborting");
        self.abort();
        false
    }

    /// Abort the underlying task immediately.
    pub fn abort(&self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
