//! Callback registries keyed by generated ids.
//!
//! Every `add_*_callback` method in this crate hands back a
//! [`CallbackHandle`]. Dropping the handle keeps the callback registered;
//! calling [`CallbackHandle::remove`] unregisters it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// A sync or async callback taking a `T`.
///
/// Sync callbacks run inline on the dispatching task. Async callbacks are
/// spawned by [`dispatch`](Self::dispatch) so they never block it, or
/// awaited by [`invoke`](Self::invoke).
pub enum Callback<T> {
    Sync(Arc<dyn Fn(&T) + Send + Sync>),
    Async(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Callback::Sync"),
            Self::Async(_) => f.write_str("Callback::Async"),
        }
    }
}

impl<T: Clone + Send + 'static> Callback<T> {
    pub fn from_fn(f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |value| f(value).boxed()))
    }

    /// Run a sync callback inline; spawn an async one onto the runtime.
    pub(crate) fn dispatch(&self, value: &T) {
        match self {
            Self::Sync(f) => f(value),
            Self::Async(f) => {
                tokio::spawn(f(value.clone()));
            }
        }
    }

    /// Run the callback to completion.
    pub(crate) async fn invoke(&self, value: T) {
        match self {
            Self::Sync(f) => f(&value),
            Self::Async(f) => f(value).await,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

trait Deregister: Send + Sync {
    fn deregister(&self, id: CallbackId) -> bool;
}

struct RegistryInner<C> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(CallbackId, C)>>,
}

impl<C: Send> Deregister for RegistryInner<C> {
    fn deregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

/// Ordered collection of callbacks; invocation order is registration order.
pub(crate) struct CallbackRegistry<C> {
    inner: Arc<RegistryInner<C>>,
}

impl<C> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<C: Clone + Send + 'static> CallbackRegistry<C> {
    pub(crate) fn add(&self, callback: C) -> CallbackHandle {
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));

        let registry: Arc<dyn Deregister> = self.inner.clone();
        CallbackHandle {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Clone out the current callbacks so none are invoked under the lock.
    pub(crate) fn snapshot(&self) -> Vec<C> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }
}

/// De-registration handle returned by every `add_*` call.
#[derive(Clone)]
pub struct CallbackHandle {
    id: CallbackId,
    registry: Weak<dyn Deregister>,
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

impl CallbackHandle {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Unregister the callback. Returns `false` if it was already removed
    /// or its owner has been dropped.
    pub fn remove(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.deregister(self.id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn callbacks_keep_registration_order() {
        let registry: CallbackRegistry<&'static str> = CallbackRegistry::default();
        registry.add("first");
        registry.add("second");
        registry.add("third");

        assert_eq!(registry.snapshot(), vec!["first", "second", "third"]);
    }

    #[test]
    fn remove_by_handle() {
        let registry: CallbackRegistry<u8> = CallbackRegistry::default();
        let keep = registry.add(1);
        let drop_me = registry.add(2);

        assert_ne!(keep.id(), drop_me.id());
        assert!(drop_me.clone().remove());
        assert!(!drop_me.remove(), "second removal must be a no-op");
        assert_eq!(registry.snapshot(), vec![1]);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry: CallbackRegistry<u8> = CallbackRegistry::default();
        let handle = registry.add(7);
        drop(registry);
        assert!(!handle.remove());
    }

    #[tokio::test]
    async fn sync_callback_dispatches_inline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cb = Callback::from_fn(move |n: &usize| {
            counter.fetch_add(*n, Ordering::SeqCst);
        });

        cb.dispatch(&2);
        cb.invoke(3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
