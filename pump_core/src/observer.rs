//! Subscriber registry for status and state change notifications.
//!
//! Observers are held weakly: dropping the last strong reference is enough
//! to stop notifications, and explicit removal by [`ObserverId`] is
//! idempotent. Notification iterates a snapshot, so observers may add or
//! remove subscriptions from inside a callback.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use uuid::Uuid;

use crate::{PumpManagerState, PumpStatus};

/// Receives every [`PumpStatus`] assignment
pub trait StatusObserver: Send + Sync {
    fn pump_status_did_change(&self, status: &PumpStatus);
}

/// Receives the full manager state after every change
pub trait StateObserver: Send + Sync {
    fn pump_state_did_change(&self, state: &PumpManagerState);
}

/// Stable handle returned on registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct Entry<T: ?Sized> {
    id: ObserverId,
    observer: Weak<T>,
}

impl<T: ?Sized> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            observer: self.observer.clone(),
        }
    }
}

/// Ordered subscriber lists, one per observer kind
#[derive(Default)]
pub struct ObserverRegistry {
    status: Mutex<Vec<Entry<dyn StatusObserver>>>,
    state: Mutex<Vec<Entry<dyn StateObserver>>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("status_observers", &lock(&self.status).len())
            .field("state_observers", &lock(&self.state).len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_status_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: StatusObserver + 'static,
    {
        let id = ObserverId::new();
        let weak: Weak<O> = Arc::downgrade(observer);
        let observer: Weak<dyn StatusObserver> = weak;
        lock(&self.status).push(Entry { id, observer });
        id
    }

    pub fn add_state_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: StateObserver + 'static,
    {
        let id = ObserverId::new();
        let weak: Weak<O> = Arc::downgrade(observer);
        let observer: Weak<dyn StateObserver> = weak;
        lock(&self.state).push(Entry { id, observer });
        id
    }

    /// Remove a subscription of either kind. Returns whether it was present.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut removed = false;
        lock(&self.status).retain(|e| {
            let keep = e.id != id;
            removed |= !keep;
            keep
        });
        lock(&self.state).retain(|e| {
            let keep = e.id != id;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        let status = lock(&self.status)
            .iter()
            .filter(|e| e.observer.strong_count() > 0)
            .count();
        let state = lock(&self.state)
            .iter()
            .filter(|e| e.observer.strong_count() > 0)
            .count();
        status + state
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_status(&self, status: &PumpStatus) {
        let snapshot = lock(&self.status).clone();
        let mut dead = false;
        for entry in &snapshot {
            match entry.observer.upgrade() {
                Some(observer) => observer.pump_status_did_change(status),
                None => dead = true,
            }
        }
        if dead {
            lock(&self.status).retain(|e| e.observer.strong_count() > 0);
        }
    }

    pub fn notify_state(&self, state: &PumpManagerState) {
        let snapshot = lock(&self.state).clone();
        let mut dead = false;
        for entry in &snapshot {
            match entry.observer.upgrade() {
                Some(observer) => observer.pump_state_did_change(state),
                None => dead = true,
            }
        }
        if dead {
            lock(&self.state).retain(|e| e.observer.strong_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl StatusObserver for Counter {
        fn pump_status_did_change(&self, _status: &PumpStatus) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StateObserver for Counter {
        fn pump_state_did_change(&self, _state: &PumpManagerState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_each_observer_notified_once() {
        let registry = ObserverRegistry::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        registry.add_status_observer(&a);
        registry.add_status_observer(&b);

        registry.notify_status(&PumpStatus::default());

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());
        let id = registry.add_state_observer(&counter);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.notify_state(&PumpManagerState::new(100.0));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let registry = ObserverRegistry::new();
        let observer = Arc::new(Counter::default());
        registry.add_status_observer(&observer);
        assert_eq!(registry.len(), 1);

        drop(observer);
        registry.notify_status(&PumpStatus::default());
        assert!(registry.is_empty());
    }

    struct Unsubscriber {
        registry: Arc<ObserverRegistry>,
        id: Mutex<Option<ObserverId>>,
        calls: AtomicUsize,
    }

    impl StatusObserver for Unsubscriber {
        fn pump_status_did_change(&self, _status: &PumpStatus) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = lock(&self.id).take() {
                self.registry.remove(id);
            }
        }
    }

    #[test]
    fn test_unsubscribe_during_notification() {
        let registry = Arc::new(ObserverRegistry::new());
        let unsubscriber = Arc::new(Unsubscriber {
            registry: registry.clone(),
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let id = registry.add_status_observer(&unsubscriber);
        *lock(&unsubscriber.id) = Some(id);

        registry.notify_status(&PumpStatus::default());
        registry.notify_status(&PumpStatus::default());

        assert_eq!(unsubscriber.calls.load(Ordering::SeqCst), 1);
    }
}
