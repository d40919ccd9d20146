use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::time::sleep;

use crate::ids::CacheKey;

/// Trailing-edge, per-key debounce: the action runs once, `delay` after the
/// *last* `schedule` call for its key, and a newer call supersedes an older
/// not-yet-fired one. Scheduling is last-write-wins; payload accumulation is
/// the batch collector's job, not this one's.
///
/// Supersession is generation-based. Every timer task is left to fire; a
/// stale one finds its generation gone and drops its action unpolled.
pub struct Debouncer {
    generations: Arc<DashMap<CacheKey, u64>>,
    counter: AtomicU64,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debouncer {
    pub fn new() -> Self {
        Self {
            generations: Arc::new(DashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn schedule<F>(&self, key: CacheKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.generations.insert(key.clone(), generation);

        let generations = Arc::clone(&self.generations);
        tokio::spawn(async move {
            sleep(delay).await;
            if generations
                .remove_if(&key, |_, current| *current == generation)
                .is_some()
            {
                action.await;
            }
        });
    }

    /// Drop the pending call for `key`, if any.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        self.generations.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &CacheKey) -> bool {
        self.generations.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key() -> CacheKey {
        CacheKey::new("messages", "c1")
    }

    #[tokio::test]
    async fn rapid_reschedules_run_the_action_once() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            debouncer.schedule(key(), Duration::from_millis(60), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        sleep(Duration::from_millis(35)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(105)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_scheduled(&key()));
    }

    #[tokio::test]
    async fn delay_restarts_from_the_last_call() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            debouncer.schedule(key(), Duration::from_millis(60), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        sleep(Duration::from_millis(30)).await;
        {
            let fired = fired.clone();
            debouncer.schedule(key(), Duration::from_millis(60), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Past the first deadline, before the rescheduled one.
        sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(70)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keys_debounce_independently() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for id in ["c1", "c2"] {
            let fired = fired.clone();
            debouncer.schedule(
                CacheKey::new("messages", id),
                Duration::from_millis(30),
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_drops_the_pending_call() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            debouncer.schedule(key(), Duration::from_millis(30), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debouncer.cancel(&key()));
        assert!(!debouncer.is_scheduled(&key()));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
