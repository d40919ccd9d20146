use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{sync::Mutex, time::sleep};

use crate::ids::CacheKey;

/// Result of a keyed-lock call. `TimedOut` means the retry budget ran out
/// and the action never ran; callers must decide what happens to the update
/// they were carrying (the cache re-enqueues, it never drops).
#[derive(Debug, PartialEq)]
pub enum LockOutcome<T> {
    Acquired(T),
    TimedOut,
}

impl<T> LockOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    pub fn into_acquired(self) -> Option<T> {
        match self {
            LockOutcome::Acquired(value) => Some(value),
            LockOutcome::TimedOut => None,
        }
    }
}

/// Per-key mutual exclusion with bounded exponential-backoff retry.
///
/// Calls for the same key are serialized; calls for different keys proceed
/// fully concurrently. Each failed attempt backs off at `base_backoff * 2^n`
/// before retrying, up to `attempts` tries. The guard drops on every exit
/// path, so the key is released even when the action panics. A key's slot is
/// reaped once the last caller for it drops out.
pub struct KeyedLock {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    attempts: u32,
    base_backoff: Duration,
}

impl KeyedLock {
    pub fn new(attempts: u32, base_backoff: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            attempts: attempts.max(1),
            base_backoff,
        }
    }

    pub async fn with_lock<T, F, Fut>(&self, key: &CacheKey, action: F) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let mut action = Some(action);
        let mut backoff = self.base_backoff;
        let mut outcome = LockOutcome::TimedOut;
        for _ in 0..self.attempts {
            if let Ok(guard) = mutex.try_lock() {
                let Some(action) = action.take() else { break };
                let value = action().await;
                drop(guard);
                outcome = LockOutcome::Acquired(value);
                break;
            }

            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }

        drop(mutex);
        // Strong count 1 means the map holds the only handle: no holder and
        // no waiter backing off with a clone of its own.
        self.locks
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        outcome
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.locks.len()
    }
}
