//! Cooperative cancellation shared between the engine and handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Cooperative cancellation token.
///
/// Firing the token never interrupts anything by itself; holders poll
/// [`is_cancelled`](Self::is_cancelled) or await [`cancelled`](Self::cancelled).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled and wakes pending waiters.
    pub fn cancel(&self) {
        self.cancel_inner(None);
    }

    /// Like [`cancel`](Self::cancel), recording why. Only the first reason sticks.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.cancel_inner(Some(reason.into()));
    }

    fn cancel_inner(&self, reason: Option<String>) {
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return;
            }
            *slot = reason;
            self.inner.cancelled.store(true, Ordering::SeqCst);
        }
        self.inner.notify.notify_waiters();
    }

    /// Returns true when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// True when both handles refer to the same token.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        // Registered before the flag check so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
