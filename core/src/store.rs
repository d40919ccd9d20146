use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::{clock::Clock, ids::CacheKey};

/// Expiring key/value map. Expiry is lazy: an entry past its deadline is
/// removed by the `get` that observes it, never by a background sweep. The
/// store is the sole owner of cached values; callers get clones and re-read
/// rather than holding references.
pub struct TtlStore<V> {
    entries: DashMap<CacheKey, StoredEntry<V>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct StoredEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V: Clone> TtlStore<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        {
            let entry = self.entries.get(key)?;
            if self.clock.now() < entry.expires_at {
                return Some(entry.value.clone());
            }
        }

        // Expired at read time; reap unless a fresh write raced in.
        self.entries
            .remove_if(key, |_, entry| self.clock.now() >= entry.expires_at);
        None
    }

    /// Write `value` under `key`, resetting the entry deadline to `now + ttl`.
    pub fn insert(&self, key: CacheKey, value: V, ttl: Duration) {
        let entry = StoredEntry {
            value,
            expires_at: self.clock.now() + ttl,
        };
        self.entries.insert(key, entry);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .map(|entry| self.clock.now() < entry.expires_at)
            .unwrap_or(false)
    }

    /// Live entries only; expired ones are skipped (and left for their next
    /// reader to reap).
    pub fn entries(&self) -> Vec<(CacheKey, V)> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| now < entry.expires_at)
            .map(|entry| (entry.key().clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| now < entry.expires_at)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
