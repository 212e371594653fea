//! Subscription registry: the registers currently watched on behalf of the
//! cloud side, keyed by `"{analyzerId}-{address}"`.
//!
//! Shared between the cloud link (watch/unwatch, value filtering) and the
//! realtime link (re-subscribe after reconnect). Clones share one map.

use bridge_protocol::{RegisterKey, RegisterWatchDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<RegisterKey, RegisterWatchDescriptor>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The map is never left half-updated, so a poisoned lock is still usable.
    fn map(&self) -> MutexGuard<'_, HashMap<RegisterKey, RegisterWatchDescriptor>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace the entry for the descriptor's key.
    /// Returns `true` when the key was not watched before.
    pub fn put(&self, descriptor: RegisterWatchDescriptor) -> bool {
        self.map().insert(descriptor.key(), descriptor).is_none()
    }

    pub fn remove(&self, key: &RegisterKey) -> Option<RegisterWatchDescriptor> {
        self.map().remove(key)
    }

    pub fn has(&self, key: &RegisterKey) -> bool {
        self.map().contains_key(key)
    }

    /// Snapshot of all watched descriptors, ordered by key.
    pub fn values(&self) -> Vec<RegisterWatchDescriptor> {
        let map = self.map();
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Remove every entry, returning what was watched.
    pub fn clear(&self) -> Vec<RegisterWatchDescriptor> {
        self.map().drain().map(|(_, d)| d).collect()
    }
}
