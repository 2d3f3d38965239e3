//! The requeue signal threaded through reconcile layers.

use std::time::Duration;

/// Outcome of one reconcile pass. Merging keeps the strongest signal:
/// `requeue` is OR-ed, `requeue_after` takes the smallest positive delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn requeue() -> Self {
        ReconcileResult {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn after(delay: Duration) -> Self {
        ReconcileResult {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.requeue && self.requeue_after.is_none()
    }

    pub fn merge(self, other: ReconcileResult) -> ReconcileResult {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        ReconcileResult {
            requeue: self.requeue || other.requeue,
            requeue_after,
        }
    }
}
