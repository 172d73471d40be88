//! Listener registries with explicit unsubscribe handles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback<T>>>,
}

/// Set of callbacks notified in subscription order.
///
/// Cloning shares the same registry.
pub struct Listeners<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned handle is
    /// unsubscribed.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.callbacks.lock().insert(id, Arc::new(callback));

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Box::new(move || {
                registry
                    .upgrade()
                    .is_some_and(|registry| registry.callbacks.lock().remove(&id).is_some())
            }),
        }
    }

    /// Invoke every registered callback with `event`.
    pub fn notify(&self, event: &T) {
        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
        let callbacks: Vec<Callback<T>> = self.registry.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registry.callbacks.lock().clear();
    }
}

/// Handle returned by [`Listeners::subscribe`].
#[must_use = "dropping the handle keeps the callback registered forever"]
pub struct Subscription {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl Subscription {
    /// Remove the callback. Returns false when it was already gone.
    pub fn unsubscribe(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notify_reaches_all_subscribers() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&total);
        let _a = listeners.subscribe(move |value| {
            first.fetch_add(*value as usize, Ordering::SeqCst);
        });
        let second = Arc::clone(&total);
        let _b = listeners.subscribe(move |value| {
            second.fetch_add(*value as usize, Ordering::SeqCst);
        });

        listeners.notify(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let listeners = Listeners::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = listeners.subscribe(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.notify(&());
        assert!(handle.unsubscribe());
        listeners.notify(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_noop() {
        let listeners = Listeners::<()>::new();
        let handle = listeners.subscribe(|()| {});
        drop(listeners);
        assert!(!handle.unsubscribe());
    }
}
