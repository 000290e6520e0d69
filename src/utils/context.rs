use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::IngestError;

/// Deadline and cancellation flag shared by every stage of one request.
///
/// Clones share the same flag, so a caller can keep one handle and cancel a
/// request that is running on another thread.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    /// A timeout too large to represent as an `Instant` means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The earlier of this request's deadline and `now + limit`; `None` when
    /// neither is representable.
    pub fn deadline_within(&self, limit: Duration) -> Option<Instant> {
        match (self.deadline, Instant::now().checked_add(limit)) {
            (Some(d), Some(local)) => Some(d.min(local)),
            (d, local) => d.or(local),
        }
    }

    /// Called between stages. Cancellation wins over an expired deadline.
    pub fn checkpoint(&self) -> Result<(), IngestError> {
        if self.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if self.is_expired() {
            return Err(IngestError::DeadlineExceeded);
        }
        Ok(())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::unbounded()
    }
}
