use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::ids::CacheKey;

const CHANNEL_CAPACITY: usize = 128;

/// What happened to a cached entry. Events carry only the key; consumers
/// re-read through the cache so the store stays the single owner of the data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Updated(CacheKey),
    Invalidated(CacheKey),
}

impl ChangeEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            ChangeEvent::Updated(key) | ChangeEvent::Invalidated(key) => key,
        }
    }
}

/// Per-key broadcast channels announcing committed writes and invalidations.
/// Channels are created lazily on first use; sends with no receivers are
/// dropped on the floor.
#[derive(Clone, Default)]
pub struct ChangeHub {
    channels: Arc<DashMap<CacheKey, broadcast::Sender<ChangeEvent>>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self, key: &CacheKey) -> broadcast::Receiver<ChangeEvent> {
        self.ensure_sender(key).subscribe()
    }

    pub fn publish_updated(&self, key: &CacheKey) {
        let sender = self.ensure_sender(key);
        let _ = sender.send(ChangeEvent::Updated(key.clone()));
    }

    /// Announce removal of `key` and tear its channel down. Receivers observe
    /// the event followed by channel closure.
    pub fn publish_invalidated(&self, key: &CacheKey) {
        let sender = self.ensure_sender(key);
        let _ = sender.send(ChangeEvent::Invalidated(key.clone()));
        self.channels.remove(key);
    }

    fn ensure_sender(&self, key: &CacheKey) -> broadcast::Sender<ChangeEvent> {
        self.channels
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                tx
            })
            .clone()
    }
}

#[cfg(test)]
impl ChangeHub {
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
