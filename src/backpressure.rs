//! Outbound queue accounting.
//!
//! Each connection's send queue is unbounded by default: `push_message` is
//! fire-and-forget and never waits. A [`BackpressureController`] tracks how
//! many messages are queued but not yet written, and when a limit is
//! configured it refuses new messages once the limit is reached (drop-newest).
//!
//! The controller is lock-free and shared between the pushing side and the
//! writer task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PipeplexError, Result};

/// Tracks pending outbound messages against an optional limit.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    /// Current pending message count.
    pending: Arc<AtomicUsize>,
    /// Maximum allowed pending messages (`None` = unbounded).
    max_pending: Option<usize>,
}

impl BackpressureController {
    /// Create an unbounded controller.
    pub fn unbounded() -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: None,
        }
    }

    /// Create a controller with an optional limit.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Check if the limit is currently reached.
    #[inline]
    pub fn is_active(&self) -> bool {
        match self.max_pending {
            Some(max) => self.pending.load(Ordering::Acquire) >= max,
            None => false,
        }
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserve a slot without blocking.
    ///
    /// Returns `Err(QueueFull)` if at capacity.
    pub fn try_reserve(&self) -> Result<()> {
        let max = match self.max_pending {
            Some(max) => max,
            None => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        };

        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| PipeplexError::QueueFull)
    }

    /// Release a slot (message written or discarded).
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release multiple slots at once (for batch writes).
    #[inline]
    pub fn release_many(&self, count: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_active() {
        let ctrl = BackpressureController::unbounded();
        for _ in 0..10_000 {
            ctrl.try_reserve().unwrap();
        }
        assert_eq!(ctrl.pending_count(), 10_000);
        assert!(!ctrl.is_active());
    }

    #[test]
    fn test_try_reserve_at_capacity() {
        let ctrl = BackpressureController::new(Some(5));

        for _ in 0..5 {
            ctrl.try_reserve().unwrap();
        }
        assert!(ctrl.is_active());

        let result = ctrl.try_reserve();
        assert!(matches!(result, Err(PipeplexError::QueueFull)));
        assert_eq!(ctrl.pending_count(), 5);
    }

    #[test]
    fn test_release_many() {
        let ctrl = BackpressureController::new(Some(100));

        for _ in 0..50 {
            ctrl.try_reserve().unwrap();
        }
        ctrl.release_many(30);
        assert_eq!(ctrl.pending_count(), 20);

        ctrl.release();
        assert_eq!(ctrl.pending_count(), 19);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let ctrl = BackpressureController::new(Some(2));
        ctrl.release_many(5);
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::new(Some(10));
        let ctrl2 = ctrl1.clone();

        ctrl1.try_reserve().unwrap();
        assert_eq!(ctrl2.pending_count(), 1);

        ctrl2.try_reserve().unwrap();
        assert_eq!(ctrl1.pending_count(), 2);
    }
}
