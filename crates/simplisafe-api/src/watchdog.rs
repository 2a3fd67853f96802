//! Reset-on-activity timer.
//!
//! The event stream calls [`Watchdog::trigger`] every time it hears from
//! the server. If nothing arrives for `timeout`, the action runs once. At
//! most one expiry task exists at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::callbacks::Callback;

struct Pending {
    cycle: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    timeout: Duration,
    action: Callback<()>,
    cycle: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for `cycle`. Fails if the cycle was reset or
    /// canceled while the timer slept.
    fn claim(&self, cycle: u64) -> bool {
        let mut pending = self.lock();
        if pending.as_ref().is_some_and(|p| p.cycle == cycle) {
            pending.take();
            true
        } else {
            false
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pending) = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.handle.abort();
        }
    }
}

/// Liveness timer for the event stream.
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new(timeout: Duration, action: Callback<()>) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                action,
                cycle: AtomicU64::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Arm the timer, replacing any pending expiry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger(&self) {
        let mut pending = self.inner.lock();
        if let Some(previous) = pending.take() {
            previous.handle.abort();
        }

        let cycle = self.inner.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.claim(cycle) {
                return;
            }

            info!(timeout_secs = timeout.as_secs(), "watchdog expired");
            let action = inner.action.clone();
            drop(inner);
            action.invoke(()).await;
        });

        *pending = Some(Pending { cycle, handle });
        debug!(cycle, "watchdog triggered");
    }

    /// Disarm the timer. A canceled cycle never fires.
    pub fn cancel(&self) {
        if let Some(pending) = self.inner.lock().take() {
            pending.handle.abort();
            debug!(cycle = pending.cycle, "watchdog canceled");
        }
    }

    /// Whether an expiry is currently scheduled.
    pub fn is_armed(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.inner.timeout)
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}
