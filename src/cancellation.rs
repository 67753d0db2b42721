//! Cooperative cancellation for provider operations.
//!
//! Callers hand one handle per request into the facade. Operations observe
//! it only at suspension points: the facade checks the flag on entry, and
//! the lock protocol checks it before each script attempt and cuts its retry
//! back-off short when the flag flips. Once an acquisition's optimistic
//! insert has succeeded the operation runs to completion, so a cancelled
//! request can never strand a lock beyond what the lock TTL already heals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct Shared {
    flag: AtomicBool,
    notify: Notify,
}

/// Cancellation signal for one request's provider operations.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    shared: Arc<Shared>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; wakes any back-off currently
    /// sleeping on this handle.
    pub fn cancel(&self) {
        if !self.shared.flag.swap(true, Ordering::SeqCst) {
            self.shared.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested; immediately if it already
    /// was.
    pub async fn cancelled(&self) {
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        // Register as a waiter before checking the flag; a cancel landing
        // between the check and the await cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
