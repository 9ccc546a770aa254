//! Subscription handles.
//!
//! A handle keeps its subscriber attached until it is dropped or explicitly
//! unsubscribed. Handles only hold a weak reference to the store, so they
//! never keep a dropped store alive.
//!
//! Dropping a handle takes the store lock. Do not drop one from inside a
//! query, command or event function.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::{Inner, Store};

/// Unique identifier for a subscriber.
///
/// Every subscription (from a caller or from a running effect) gets its own
/// id, so one callback may be attached to the same node twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber attached to a query or an event.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    store: Weak<Inner>,
    domain: Arc<str>,
    key: Arc<str>,
    id: SubscriberId,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(store: &Store, domain: Arc<str>, key: Arc<str>, id: SubscriberId) -> Self {
        Self {
            store: Arc::downgrade(&store.inner),
            domain,
            key,
            id,
            active: true,
        }
    }

    /// Canonical key of the subscribed node.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Detach the subscriber now. The node and its domain are collected if
    /// nothing else observes them.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            let (domain, key, id) = (self.domain.clone(), self.key.clone(), self.id);
            Store { inner }.release(move |rt| rt.unsubscribe(&domain, &key, id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

/// A direct reference on a domain, as taken by `Store::subscribe_domain`.
#[must_use = "dropping a domain subscription releases the domain"]
pub struct DomainSubscription {
    store: Weak<Inner>,
    key: Arc<str>,
    active: bool,
}

impl DomainSubscription {
    pub(crate) fn new(store: &Store, key: Arc<str>) -> Self {
        Self {
            store: Arc::downgrade(&store.inner),
            key,
            active: true,
        }
    }

    /// Canonical key of the domain.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the domain now; it is torn down if nothing else holds it.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            let key = self.key.clone();
            Store { inner }.release(move |rt| rt.release_domain(&key));
        }
    }
}

impl Drop for DomainSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DomainSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSubscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }
}
