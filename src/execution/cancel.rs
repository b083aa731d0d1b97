//! Cooperative Cancellation
//!
//! A single cancellation signal threads through each run. The scheduler
//! checks it at round boundaries and before sequential steps; step
//! implementations receive it and are expected to return early once it
//! fires. Nothing is ever killed forcibly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to a cancellation flag.
///
/// Supports both polling (`is_cancelled`) and awaiting (`cancelled`).
/// All clones observe the same flag.
///
/// # Example
///
/// ```
/// use flowrunner::CancelSignal;
///
/// let signal = CancelSignal::new();
/// let observer = signal.clone();
///
/// assert!(!observer.is_cancelled());
/// signal.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and wakes every waiter.
    ///
    /// Firing more than once is harmless.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Completes once the signal fires.
    ///
    /// Returns immediately if it already has.
    pub async fn cancelled(&self) {
        loop {
            // Register the waiter before re-checking the flag, so a
            // cancel between check and await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
