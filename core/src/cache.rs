use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use dashmap::DashSet;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::{sync::OnceCell, time::sleep};
use tracing::{debug, warn};

use crate::{
    batch::BatchCollector,
    clock::{Clock, SystemClock},
    config::SyncConfig,
    debounce::Debouncer,
    hub::{ChangeEvent, ChangeHub},
    ids::{CacheKey, CollectionId, CollectionKind, RecordId},
    lock::{KeyedLock, LockOutcome},
    merge::merge_records,
    record::Message,
    snapshot::{CacheSnapshot, JsonFileSnapshotStore, SnapshotEntry, SnapshotStoreRef},
    store::TtlStore,
};

pub type SyncResult<T> = anyhow::Result<T>;

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

#[derive(Debug, Default)]
struct SyncMetricsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    merges: AtomicU64,
    flush_success: AtomicU64,
    flush_duration_ms: AtomicU64,
    lock_timeouts: AtomicU64,
    suppressed_duplicates: AtomicU64,
    sends: AtomicU64,
    send_failures: AtomicU64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            inner: Arc::new(SyncMetricsInner::default()),
        }
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.inner.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_success(&self, duration: Duration) {
        self.inner.flush_success.fetch_add(1, Ordering::Relaxed);
        self.inner
            .flush_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.inner.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed_duplicate(&self) {
        self.inner
            .suppressed_duplicates
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self) {
        self.inner.sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.inner.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    pub fn merges(&self) -> u64 {
        self.inner.merges.load(Ordering::Relaxed)
    }

    pub fn flush_success_count(&self) -> u64 {
        self.inner.flush_success.load(Ordering::Relaxed)
    }

    pub fn total_flush_duration_ms(&self) -> u64 {
        self.inner.flush_duration_ms.load(Ordering::Relaxed)
    }

    pub fn avg_flush_duration_ms(&self) -> f64 {
        let success = self.flush_success_count();
        if success == 0 {
            0.0
        } else {
            self.total_flush_duration_ms() as f64 / success as f64
        }
    }

    pub fn lock_timeouts(&self) -> u64 {
        self.inner.lock_timeouts.load(Ordering::Relaxed)
    }

    pub fn suppressed_duplicates(&self) -> u64 {
        self.inner.suppressed_duplicates.load(Ordering::Relaxed)
    }

    pub fn sends(&self) -> u64 {
        self.inner.sends.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.inner.send_failures.load(Ordering::Relaxed)
    }

    /// Point-in-time view of every counter.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            merges: self.merges(),
            flush_successes: self.flush_success_count(),
            total_flush_duration_ms: self.total_flush_duration_ms(),
            lock_timeouts: self.lock_timeouts(),
            suppressed_duplicates: self.suppressed_duplicates(),
            sends: self.sends(),
            send_failures: self.send_failures(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub merges: u64,
    pub flush_successes: u64,
    pub total_flush_duration_ms: u64,
    pub lock_timeouts: u64,
    pub suppressed_duplicates: u64,
    pub sends: u64,
    pub send_failures: u64,
}

pub struct SyncCacheBuilder {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<SyncMetrics>,
    snapshot_store: Option<SnapshotStoreRef>,
}

impl Default for SyncCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCacheBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
            snapshot_store: None,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.config.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_debounce_delay(mut self, delay: Duration) -> Self {
        self.config.debounce_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.config.lock_attempts = attempts;
        self
    }

    pub fn with_lock_backoff(mut self, backoff: Duration) -> Self {
        self.config.lock_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_recently_sent_window(mut self, ttl: Duration, capacity: usize) -> Self {
        self.config.recently_sent_ttl_ms = ttl.as_millis() as u64;
        self.config.recently_sent_capacity = capacity;
        self
    }

    pub fn with_collision_window(mut self, window: Duration) -> Self {
        self.config.collision_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStoreRef) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn build(self) -> Arc<SyncCache> {
        let metrics = self.metrics.unwrap_or_default();
        let snapshot_store = self.snapshot_store.or_else(|| {
            self.config
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(JsonFileSnapshotStore::new(path.clone())) as SnapshotStoreRef)
        });

        Arc::new(SyncCache {
            store: TtlStore::new(self.clock.clone()),
            locks: KeyedLock::new(self.config.lock_attempts, self.config.lock_backoff()),
            debouncer: Debouncer::new(),
            collector: BatchCollector::new(),
            hub: ChangeHub::new(),
            deferred_invalidations: DashSet::new(),
            flush_timer_armed: AtomicBool::new(false),
            seeded: OnceCell::new(),
            snapshot_store,
            metrics,
            clock: self.clock,
            config: self.config,
        })
    }
}

/// Client-side record cache: a TTL store fronted by per-key locking,
/// debounced writes, and a shared batch-flush timer. Collections are merged,
/// never blindly overwritten, so concurrent producers (debounced sets, batch
/// flushes, the send path) converge on one canonical sequence per key.
pub struct SyncCache {
    store: TtlStore<Vec<Message>>,
    locks: KeyedLock,
    debouncer: Debouncer,
    collector: BatchCollector,
    hub: ChangeHub,
    deferred_invalidations: DashSet<CacheKey>,
    flush_timer_armed: AtomicBool,
    seeded: OnceCell<usize>,
    snapshot_store: Option<SnapshotStoreRef>,
    metrics: SyncMetrics,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

enum FlushApplied {
    Merged(usize),
    Invalidated,
    Skipped,
}

impl SyncCache {
    pub fn new() -> Arc<Self> {
        SyncCacheBuilder::new().build()
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The time source every expiry decision runs on; collaborators that keep
    /// their own time-limited state share it.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Read the cached collection. Absent covers both never-written and
    /// expired entries.
    pub fn get(
        &self,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
    ) -> Option<Vec<Message>> {
        let key = CacheKey::new(kind, id);
        match self.store.get(&key) {
            Some(records) => {
                self.metrics.record_hit();
                Some(records)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Debounced write. The merge runs once, `debounce_delay` after the last
    /// `set` for this key; an earlier not-yet-run `set` for the same key is
    /// superseded, payload included.
    pub fn set(
        self: &Arc<Self>,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
        records: Vec<Message>,
        ttl: Option<Duration>,
    ) {
        let key = CacheKey::new(kind, id);
        let cache = Arc::clone(self);
        let action_key = key.clone();
        self.debouncer
            .schedule(key, self.config.debounce_delay(), async move {
                cache.merge_into_entry(action_key, records, ttl).await;
            });
    }

    /// Immediate lock-merge-store of `records` into the key's collection.
    /// On lock timeout the records are re-enqueued for the next flush.
    pub async fn apply_records(
        self: &Arc<Self>,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
        records: Vec<Message>,
    ) {
        let key = CacheKey::new(kind, id);
        self.merge_into_entry(key, records, None).await;
    }

    /// Add `record` to the key's pending batch; the shared flush timer is
    /// armed if it is not already running.
    pub fn enqueue(
        self: &Arc<Self>,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
        record: Message,
    ) {
        let key = CacheKey::new(kind, id);
        self.collector.enqueue(key, record);
        self.arm_flush_timer();
    }

    /// Swap one record's identity inside the stored collection: the record
    /// with `previous_id` is dropped (from the entry and from any pending
    /// batch copy) and `replacement` is merged in. If stripping the pending
    /// copy drains the key's batch, an invalidation deferred behind that
    /// batch completes here instead. On lock timeout the swap is deferred to
    /// the next flush via a discard marker plus re-enqueue.
    pub async fn replace_record(
        self: &Arc<Self>,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
        previous_id: &RecordId,
        replacement: Message,
    ) {
        let key = CacheKey::new(kind, id);
        let outcome = self
            .locks
            .with_lock(&key, || async {
                self.collector.remove_record(&key, previous_id);
                if !self.collector.has_pending(&key)
                    && self.deferred_invalidations.remove(&key).is_some()
                {
                    self.store.remove(&key);
                    return true;
                }

                let mut current = self.store.get(&key).unwrap_or_default();
                current.retain(|record| record.id != *previous_id);
                let merged = merge_records(&current, std::slice::from_ref(&replacement));
                self.store.insert(key.clone(), merged, self.config.ttl());
                false
            })
            .await;

        match outcome {
            LockOutcome::Acquired(true) => {
                self.hub.publish_invalidated(&key);
                debug!(
                    key = %key,
                    previous_id = %previous_id,
                    "completed deferred invalidation during identity swap",
                );
            }
            LockOutcome::Acquired(false) => {
                self.metrics.record_merge();
                self.hub.publish_updated(&key);
                debug!(key = %key, previous_id = %previous_id, "replaced record identity");
            }
            LockOutcome::TimedOut => {
                self.metrics.record_lock_timeout();
                warn!(
                    key = %key,
                    previous_id = %previous_id,
                    "lock not acquired for record replacement; deferring to next flush",
                );
                self.collector.mark_discard(key.clone(), previous_id.clone());
                self.collector.enqueue(key.clone(), replacement);
                self.arm_flush_timer();
            }
        }
    }

    /// Remove the entry, under the key's lock. If a pending batch exists for
    /// the key, removal is deferred to the flush that drains it so queued
    /// records are not lost; a removal that cannot take the lock falls back
    /// to the same deferred path.
    pub async fn invalidate(
        self: &Arc<Self>,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
    ) {
        let key = CacheKey::new(kind, id);
        // A debounced set still in flight would resurrect the entry.
        self.debouncer.cancel(&key);

        if self.collector.has_pending(&key) {
            self.deferred_invalidations.insert(key.clone());
            // The mark may race the drain of the batch that justified it.
            if self.collector.has_pending(&key) {
                debug!(key = %key, "invalidation deferred until pending batch drains");
                return;
            }
            // Drained in that window. Whoever consumed the mark completed
            // the removal with it; otherwise reclaim it and remove here.
            if self.deferred_invalidations.remove(&key).is_none() {
                return;
            }
        }

        let outcome = self
            .locks
            .with_lock(&key, || async {
                self.deferred_invalidations.remove(&key);
                self.store.remove(&key);
            })
            .await;

        match outcome {
            LockOutcome::Acquired(()) => {
                self.hub.publish_invalidated(&key);
                debug!(key = %key, "invalidated cache entry");
            }
            LockOutcome::TimedOut => {
                self.metrics.record_lock_timeout();
                self.deferred_invalidations.insert(key.clone());
                self.arm_flush_timer();
                warn!(key = %key, "lock not acquired for invalidation; deferring to next flush");
            }
        }
    }

    /// Drain every pending batch now, without waiting for the timer. Same
    /// walk the timer performs.
    pub async fn flush_now(self: &Arc<Self>) {
        self.run_flush_cycle().await;
    }

    pub fn subscribe(
        &self,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
    ) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.hub.subscribe(&CacheKey::new(kind, id))
    }

    /// Persist the live entries through the configured snapshot store. A no-op
    /// when none is configured; never invoked automatically.
    pub async fn snapshot_now(&self) -> SyncResult<()> {
        let Some(store) = &self.snapshot_store else {
            return Ok(());
        };

        let entries = self
            .store
            .entries()
            .into_iter()
            .map(|(key, records)| SnapshotEntry {
                kind: key.kind,
                id: key.id,
                records,
            })
            .collect();
        store
            .persist(&CacheSnapshot::new(entries))
            .await
            .context("failed to persist cache snapshot")?;
        debug!(entry_count = self.store.len(), "captured cache snapshot");
        Ok(())
    }

    /// Cold-start seed from the durable snapshot. Runs the load at most once
    /// per cache instance, never overwrites a live key, and reports how many
    /// entries were restored. Zero when no snapshot store is configured.
    pub async fn seed_from_snapshot(&self) -> SyncResult<usize> {
        let Some(store) = &self.snapshot_store else {
            return Ok(0);
        };

        let seeded = self
            .seeded
            .get_or_try_init(|| async {
                let Some(snapshot) = store
                    .load()
                    .await
                    .context("failed to load cache snapshot")?
                else {
                    return Ok::<_, anyhow::Error>(0);
                };

                let mut restored = 0usize;
                for entry in snapshot.entries {
                    let key = CacheKey {
                        kind: entry.kind,
                        id: entry.id,
                    };
                    if self.store.contains(&key) {
                        continue;
                    }
                    self.store.insert(key, entry.records, self.config.ttl());
                    restored += 1;
                }
                debug!(restored, "seeded cache from snapshot");
                Ok(restored)
            })
            .await?;
        Ok(*seeded)
    }

    pub fn pending_len(
        &self,
        kind: impl Into<CollectionKind>,
        id: impl Into<CollectionId>,
    ) -> usize {
        self.collector.pending_len(&CacheKey::new(kind, id))
    }

    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    async fn merge_into_entry(
        self: &Arc<Self>,
        key: CacheKey,
        records: Vec<Message>,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());
        let outcome = self
            .locks
            .with_lock(&key, || async {
                let current = self.store.get(&key).unwrap_or_default();
                let merged = merge_records(&current, &records);
                self.store.insert(key.clone(), merged, ttl);
            })
            .await;

        match outcome {
            LockOutcome::Acquired(()) => {
                self.metrics.record_merge();
                self.hub.publish_updated(&key);
                debug!(key = %key, count = records.len(), "merged records into entry");
            }
            LockOutcome::TimedOut => {
                self.metrics.record_lock_timeout();
                warn!(
                    key = %key,
                    count = records.len(),
                    "lock not acquired for merge; re-enqueueing records",
                );
                for record in records {
                    self.collector.enqueue(key.clone(), record);
                }
                self.arm_flush_timer();
            }
        }
    }

    fn arm_flush_timer(self: &Arc<Self>) {
        if self
            .flush_timer_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let cache = Arc::clone(self);
        let interval = self.config.flush_interval();
        tokio::spawn(async move {
            sleep(interval).await;
            cache.run_flush_cycle().await;
        });
    }

    async fn run_flush_cycle(self: &Arc<Self>) {
        // Disarm before the walk so an enqueue racing with this flush arms a
        // fresh timer instead of stranding its record.
        self.flush_timer_armed.store(false, Ordering::SeqCst);

        // Marked keys ride along even when their batch has already drained;
        // a deferred removal must not wait for another enqueue.
        let mut keys = self.collector.keys();
        for marked in self.deferred_invalidations.iter() {
            if !keys.contains(marked.key()) {
                keys.push(marked.key().clone());
            }
        }
        if keys.is_empty() {
            return;
        }

        let started = Instant::now();
        join_all(keys.into_iter().map(|key| self.flush_key(key))).await;
        self.metrics.record_flush_success(started.elapsed());

        // Keys whose lock timed out keep their batches and marks; retry
        // without requiring another enqueue.
        if self.collector.has_any_pending() || !self.deferred_invalidations.is_empty() {
            self.arm_flush_timer();
        }
    }

    async fn flush_key(&self, key: CacheKey) {
        let outcome = self
            .locks
            .with_lock(&key, || async {
                let taken = self.collector.take(&key);
                let deferred = self.deferred_invalidations.remove(&key).is_some();
                if deferred {
                    // Pending records are superseded by the removal; the
                    // batch is drained either way.
                    self.store.remove(&key);
                    return FlushApplied::Invalidated;
                }
                let Some(set) = taken else {
                    return FlushApplied::Skipped;
                };

                let mut incoming = set.records;
                if !set.discards.is_empty() {
                    incoming.retain(|record| !set.discards.contains(&record.id));
                }
                let mut current = self.store.get(&key).unwrap_or_default();
                if !set.discards.is_empty() {
                    current.retain(|record| !set.discards.contains(&record.id));
                }

                let count = incoming.len();
                let merged = merge_records(&current, &incoming);
                self.store.insert(key.clone(), merged, self.config.ttl());
                FlushApplied::Merged(count)
            })
            .await;

        match outcome {
            LockOutcome::Acquired(FlushApplied::Merged(count)) => {
                self.metrics.record_merge();
                self.hub.publish_updated(&key);
                debug!(key = %key, count, "flushed pending batch");
            }
            LockOutcome::Acquired(FlushApplied::Invalidated) => {
                self.hub.publish_invalidated(&key);
                debug!(key = %key, "completed deferred invalidation");
            }
            LockOutcome::Acquired(FlushApplied::Skipped) => {}
            LockOutcome::TimedOut => {
                self.metrics.record_lock_timeout();
                warn!(key = %key, "lock not acquired during flush; batch left pending");
            }
        }
    }
}
