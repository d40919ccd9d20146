use dashmap::DashMap;

use crate::{
    ids::{CacheKey, RecordId},
    record::Message,
};

/// Records accumulated for one key between flushes, plus ids that the next
/// flush must drop from the stored collection (stale optimistic copies whose
/// replacement could not take the lock in time).
#[derive(Debug, Default)]
pub struct PendingSet {
    pub records: Vec<Message>,
    pub discards: Vec<RecordId>,
}

impl PendingSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.discards.is_empty()
    }
}

/// Per-key holding area for updates awaiting the next flush walk. Purely a
/// data structure: the flush timer and the walk itself belong to the cache,
/// which drains each key with `take` inside that key's critical section.
///
/// Invariant: an entry present in the map is non-empty. Mutators that empty
/// a set remove it, so `keys` and `has_any_pending` never report drained keys.
#[derive(Default)]
pub struct BatchCollector {
    pending: DashMap<CacheKey, PendingSet>,
}

impl BatchCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: CacheKey, record: Message) {
        self.pending.entry(key).or_default().records.push(record);
    }

    /// Note an id whose stored copy must not survive the next flush of `key`.
    pub fn mark_discard(&self, key: CacheKey, id: RecordId) {
        self.pending.entry(key).or_default().discards.push(id);
    }

    /// Drop any pending copies of `id` for `key`. Returns whether a copy was
    /// actually removed.
    pub fn remove_record(&self, key: &CacheKey, id: &RecordId) -> bool {
        let Some(mut set) = self.pending.get_mut(key) else {
            return false;
        };
        let before = set.records.len();
        set.records.retain(|record| record.id != *id);
        let removed = set.records.len() != before;
        let now_empty = set.is_empty();
        drop(set);
        if now_empty {
            self.pending.remove_if(key, |_, set| set.is_empty());
        }
        removed
    }

    /// Atomically remove and return everything pending for `key`.
    pub fn take(&self, key: &CacheKey) -> Option<PendingSet> {
        self.pending.remove(key).map(|(_, set)| set)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.pending.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn pending_len(&self, key: &CacheKey) -> usize {
        self.pending
            .get(key)
            .map(|set| set.records.len())
            .unwrap_or(0)
    }

    pub fn has_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn has_any_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
