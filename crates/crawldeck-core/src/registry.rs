//! Active Selection Registry: the single in-memory source of truth for the active profile.
//!
//! Consumers read it with [`ActiveSelectionRegistry::get`], change it with
//! [`ActiveSelectionRegistry::set`] and observe it through [`ActiveSelectionRegistry::subscribe`].
//! Fan-out is synchronous: every listener has seen a change before `set`/`clear` returns.
//! No operation awaits; the value lock is never held while listeners run.

use crate::profile::Profile;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Change listener. Receives the new selection (`None` after a clear).
pub type Listener = Arc<dyn Fn(Option<&Profile>) + Send + Sync>;

struct Inner {
    current: RwLock<Option<Profile>>,
    revision: AtomicU64,
    listeners: DashMap<u64, Listener>,
    next_listener_id: AtomicU64,
}

/// Process-scoped registry handle. Clones share the same state.
#[derive(Clone)]
pub struct ActiveSelectionRegistry {
    inner: Arc<Inner>,
}

impl Default for ActiveSelectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActiveSelectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSelectionRegistry")
            .field("current", &self.get().map(|p| p.id))
            .field("revision", &self.revision())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl ActiveSelectionRegistry {
    /// Empty registry; call once at process start.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(None),
                revision: AtomicU64::new(0),
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn get(&self) -> Option<Profile> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Id of the current selection, if any.
    pub fn current_id(&self) -> Option<i64> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|p| p.id)
    }

    /// Monotonic counter bumped by every effective `set`/`clear`.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Last write wins. Setting an identical profile is a no-op and notifies nobody.
    pub fn set(&self, profile: Profile) {
        self.replace(Some(profile));
    }

    /// Drops the selection (empty remote set, logout).
    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, next: Option<Profile>) {
        {
            let mut current = self
                .inner
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == next {
                return;
            }
            *current = next.clone();
            self.inner.revision.fetch_add(1, Ordering::SeqCst);
        }
        tracing::debug!(profile_id = ?next.as_ref().map(|p| p.id), "active selection changed");
        self.notify(next.as_ref());
    }

    fn notify(&self, value: Option<&Profile>) {
        // Snapshot first so listeners may subscribe or unsubscribe while being called.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Registers a change listener. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Profile>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.insert(id, Arc::new(listener));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Teardown (logout): clears the selection, notifying current listeners, then detaches them.
    pub fn reset(&self) {
        self.clear();
        self.inner.listeners.clear();
    }
}

/// Handle returned by [`ActiveSelectionRegistry::subscribe`].
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keeps the listener registered for the registry's whole lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(registry: &ActiveSelectionRegistry) -> (Subscription, Arc<Mutex<Vec<Option<i64>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = registry.subscribe(move |p| sink.lock().unwrap().push(p.map(|p| p.id)));
        (sub, seen)
    }

    #[test]
    fn set_is_visible_to_subscribers_before_return() {
        let registry = ActiveSelectionRegistry::new();
        let (_sub, seen) = recorder(&registry);
        registry.set(Profile::new(1, "Alpha"));
        assert_eq!(*seen.lock().unwrap(), vec![Some(1)]);
        assert_eq!(registry.current_id(), Some(1));
    }

    #[test]
    fn identical_set_is_idempotent() {
        let registry = ActiveSelectionRegistry::new();
        let (_sub, seen) = recorder(&registry);
        registry.set(Profile::new(1, "Alpha"));
        let rev = registry.revision();
        registry.set(Profile::new(1, "Alpha"));
        assert_eq!(registry.revision(), rev);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn last_write_wins() {
        let registry = ActiveSelectionRegistry::new();
        registry.set(Profile::new(1, "Alpha"));
        registry.set(Profile::new(2, "Beta"));
        assert_eq!(registry.current_id(), Some(2));
        registry.clear();
        assert!(registry.get().is_none());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let registry = ActiveSelectionRegistry::new();
        let (sub, seen) = recorder(&registry);
        assert_eq!(registry.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(registry.subscriber_count(), 0);
        registry.set(Profile::new(1, "Alpha"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn listener_may_read_registry() {
        let registry = ActiveSelectionRegistry::new();
        let reader = registry.clone();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let _sub = registry.subscribe(move |_| *sink.lock().unwrap() = reader.current_id());
        registry.set(Profile::new(7, "Seven"));
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn reset_notifies_then_detaches() {
        let registry = ActiveSelectionRegistry::new();
        let (sub, seen) = recorder(&registry);
        sub.detach();
        registry.set(Profile::new(1, "Alpha"));
        registry.reset();
        assert_eq!(*seen.lock().unwrap(), vec![Some(1), None]);
        assert_eq!(registry.subscriber_count(), 0);
    }
}
