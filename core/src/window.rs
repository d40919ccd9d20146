use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{clock::Clock, merge::is_likely_duplicate, record::Message};

struct SentEntry {
    record: Message,
    expires_at: Instant,
}

/// Bounded, time-limited list of just-sent optimistic records, kept solely to
/// recognize the push-channel echo of a write this client performed. Entries
/// age out after `ttl` or are evicted oldest-first past `capacity`.
///
/// The window never feeds the merge algorithm; it only answers `suppresses`.
pub struct RecentlySentWindow {
    entries: Mutex<VecDeque<SentEntry>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl RecentlySentWindow {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn record_sent(&self, record: Message) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.push_back(SentEntry {
            record,
            expires_at: now + self.ttl,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Whether `incoming` looks like an echo of a recent send: either its id
    /// matches a windowed entry outright, or the near-duplicate heuristic
    /// (same sender and content, timestamps within `collision_window`) does.
    pub fn suppresses(&self, incoming: &Message, collision_window: Duration) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.iter().any(|entry| {
            entry.record.id == incoming.id
                || is_likely_duplicate(&entry.record, incoming, collision_window)
        })
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Entries are appended in send order with a constant ttl, so expiry is
    // monotone from the front.
    fn prune(entries: &mut VecDeque<SentEntry>, now: Instant) {
        while entries.front().is_some_and(|entry| entry.expires_at <= now) {
            entries.pop_front();
        }
    }
}
