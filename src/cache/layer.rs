//! Bounded, TTL-aware key/value layer.
//!
//! A layer enforces two caps at once, entry count and aggregate bytes. Every
//! insert first makes room by evicting through the configured policy; each
//! victim is handed to a demotion callback before it is removed, so a reader
//! probing the next layer down never sees a gap. Expired entries are removed
//! lazily on read and by a periodic sweep.
//!
//! All mutation of a layer happens under one lock. Lock order across layers
//! is always hot → warm, never the reverse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::cache::entry::{CacheEntry, EntryMetadata, Layer};
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::eviction::Evictor;
use crate::cache::tracker::AccessTracker;
use crate::config::LayerConfig;

struct Slot<V> {
    entry: CacheEntry<V>,
    /// Insertion order, used to break eviction ties.
    seq: u64,
}

struct LayerState<V> {
    entries: HashMap<String, Slot<V>>,
    size_bytes: usize,
    next_seq: u64,
}

impl<V> LayerState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    /// Drop expired entries, returning their keys.
    fn purge_expired(&mut self, now: Instant) -> Vec<String> {
        let mut purged = Vec::new();
        let mut freed = 0;
        self.entries.retain(|key, slot| {
            let keep = !slot.entry.is_expired(now);
            if !keep {
                freed += slot.entry.size_bytes;
                purged.push(key.clone());
            }
            keep
        });
        self.size_bytes = self.size_bytes.saturating_sub(freed);
        purged
    }
}

/// Result of a successful call to [`LayerStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was stored after evicting `evicted` others.
    Stored { evicted: usize },
    /// The commit guard refused the write.
    Skipped,
}

pub struct LayerStore<V> {
    layer: Layer,
    config: LayerConfig,
    evictor: Evictor,
    tracker: Arc<AccessTracker>,
    stopped: Arc<AtomicBool>,
    state: Mutex<LayerState<V>>,
}

impl<V: Clone> LayerStore<V> {
    pub fn new(
        layer: Layer,
        config: LayerConfig,
        evictor: Evictor,
        tracker: Arc<AccessTracker>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            layer,
            config,
            evictor,
            tracker,
            stopped,
            state: Mutex::new(LayerState {
                entries: HashMap::new(),
                size_bytes: 0,
                next_seq: 0,
            }),
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Look up a live entry, recording the access on it.
    ///
    /// An expired entry is deleted on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.entries.get_mut(key) {
            None => return None,
            Some(slot) if !slot.entry.is_expired(now) => {
                slot.entry.touch(now);
                return Some(slot.entry.clone());
            }
            Some(_) => {}
        }

        state.remove(key);
        debug!(layer = %self.layer, key, "Expired entry removed on read");
        None
    }

    /// Look up a live entry without touching it.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Store `entry`, evicting until both caps hold.
    ///
    /// `commit_guard` runs under the layer lock right before anything changes;
    /// returning `false` abandons the write. `on_evict` sees every victim
    /// while it is still present in this layer.
    pub fn insert(
        &self,
        entry: CacheEntry<V>,
        commit_guard: impl FnOnce() -> bool,
        on_evict: &mut dyn FnMut(&CacheEntry<V>),
    ) -> CacheResult<InsertOutcome> {
        let mut state = self.state.lock();

        self.ensure_running()?;
        if !commit_guard() {
            debug!(layer = %self.layer, key = %entry.key, "Write abandoned by commit guard");
            return Ok(InsertOutcome::Skipped);
        }
        if entry.size_bytes > self.config.max_memory_bytes || self.config.max_entries == 0 {
            error!(
                layer = %self.layer,
                key = %entry.key,
                size = entry.size_bytes,
                max_bytes = self.config.max_memory_bytes,
                "Entry can never fit in layer"
            );
            return Err(self.capacity_error(&entry));
        }

        state.remove(&entry.key);
        let evicted = self.ensure_capacity(&mut state, entry.size_bytes, on_evict)?;

        let seq = state.next_seq;
        state.next_seq += 1;
        state.size_bytes += entry.size_bytes;
        state.entries.insert(entry.key.clone(), Slot { entry, seq });

        Ok(InsertOutcome::Stored { evicted })
    }

    /// Evict until one more entry of `incoming_bytes` fits under both caps.
    fn ensure_capacity(
        &self,
        state: &mut LayerState<V>,
        incoming_bytes: usize,
        on_evict: &mut dyn FnMut(&CacheEntry<V>),
    ) -> CacheResult<usize> {
        let fits = |s: &LayerState<V>| {
            s.entries.len() < self.config.max_entries
                && s.size_bytes + incoming_bytes <= self.config.max_memory_bytes
        };
        if fits(state) {
            return Ok(0);
        }

        let now = Instant::now();
        let purged = state.purge_expired(now);
        if !purged.is_empty() {
            debug!(layer = %self.layer, purged = purged.len(), "Dropped expired entries to make room");
        }

        let mut evicted = 0;
        while !fits(state) {
            // At least enough victims for the entry cap; the byte cap may ask for another round.
            let wanted = (state.entries.len() + 1)
                .saturating_sub(self.config.max_entries)
                .max(1);
            let victims = self.evictor.select_victims(
                state.entries.values().map(|slot| (slot.seq, &slot.entry)),
                &self.tracker,
                wanted,
                now,
            );
            if victims.is_empty() {
                error!(
                    layer = %self.layer,
                    entries = state.entries.len(),
                    size = state.size_bytes,
                    "No eviction victim while over capacity"
                );
                return Err(CacheError::CapacityExceeded {
                    layer: self.layer,
                    key: String::new(),
                    size_bytes: incoming_bytes,
                });
            }

            for victim in victims {
                if fits(state) {
                    break;
                }
                if let Some(slot) = state.entries.get(&victim.key) {
                    on_evict(&slot.entry);
                }
                state.remove(&victim.key);
                evicted += 1;

                debug!(
                    layer = %self.layer,
                    key = %victim.key,
                    score = victim.score,
                    policy = %self.evictor.policy(),
                    "Evicted entry"
                );
            }
        }

        Ok(evicted)
    }

    fn capacity_error(&self, entry: &CacheEntry<V>) -> CacheError {
        CacheError::CapacityExceeded {
            layer: self.layer,
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
        }
    }

    fn ensure_running(&self) -> CacheResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CacheError::Stopped);
        }
        Ok(())
    }

    /// Remove `key`; fails once the owning manager has stopped.
    pub fn remove(&self, key: &str) -> CacheResult<Option<CacheEntry<V>>> {
        let mut state = self.state.lock();
        self.ensure_running()?;
        Ok(state.remove(key))
    }

    /// Keys of live entries whose metadata satisfies `pred`.
    pub fn keys_matching(&self, pred: impl Fn(&EntryMetadata) -> bool) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|slot| !slot.entry.is_expired(now) && pred(&slot.entry.metadata))
            .map(|slot| slot.entry.key.clone())
            .collect()
    }

    /// Remove every entry, returning how many were dropped.
    pub fn clear(&self) -> CacheResult<usize> {
        let mut state = self.state.lock();
        self.ensure_running()?;
        let removed = state.entries.len();
        state.entries.clear();
        state.size_bytes = 0;
        Ok(removed)
    }

    /// Remove every expired entry, returning the dropped keys.
    pub fn purge_expired(&self) -> Vec<String> {
        let mut state = self.state.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Vec::new();
        }
        state.purge_expired(Instant::now())
    }

    /// `(entry count, aggregate bytes)`, expired-but-unswept entries included.
    pub fn occupancy(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.entries.len(), state.size_bytes)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::entry::Priority;
    use crate::cache::eviction::EvictionPolicy;

    fn test_store(max_entries: usize, max_bytes: usize, policy: EvictionPolicy) -> LayerStore<u32> {
        let config = LayerConfig {
            enabled: true,
            max_entries,
            max_memory_bytes: max_bytes,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 1_000,
        };
        LayerStore::new(
            Layer::Hot,
            config,
            Evictor::new(policy),
            Arc::new(AccessTracker::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn entry(key: &str, value: u32, size: usize, ttl: Duration) -> CacheEntry<u32> {
        let metadata = EntryMetadata {
            tags: [format!("tag-{value}")].into_iter().collect(),
            priority: Priority::Normal,
            source: Layer::Hot,
        };
        CacheEntry::new(key, value, ttl, size, metadata)
    }

    fn put(store: &LayerStore<u32>, e: CacheEntry<u32>) -> InsertOutcome {
        store.insert(e, || true, &mut |_| {}).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_and_occupancy() {
        let store = test_store(10, 1000, EvictionPolicy::Lru);
        put(&store, entry("a", 1, 100, Duration::from_secs(10)));
        put(&store, entry("b", 2, 50, Duration::from_secs(10)));
        assert_eq!(store.occupancy(), (2, 150));

        // Overwrite recomputes the size.
        put(&store, entry("a", 3, 10, Duration::from_secs(10)));
        assert_eq!(store.occupancy(), (2, 60));
        assert_eq!(store.get("a").unwrap().value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_cap_evicts_through_callback() {
        let store = test_store(2, 1000, EvictionPolicy::Lru);
        put(&store, entry("a", 1, 1, Duration::from_secs(10)));
        tokio::time::advance(Duration::from_millis(10)).await;
        put(&store, entry("b", 2, 1, Duration::from_secs(10)));
        tokio::time::advance(Duration::from_millis(10)).await;

        let mut demoted = Vec::new();
        let outcome = store
            .insert(entry("c", 3, 1, Duration::from_secs(10)), || true, &mut |victim| {
                demoted.push(victim.key.clone())
            })
            .unwrap();

        assert_eq!(outcome, InsertOutcome::Stored { evicted: 1 });
        assert_eq!(demoted, vec!["a".to_string()]);
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_cap_evicts_several() {
        let store = test_store(100, 100, EvictionPolicy::Lru);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            put(&store, entry(key, i as u32, 25, Duration::from_secs(10)));
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        let outcome = put(&store, entry("big", 9, 60, Duration::from_secs(10)));
        assert_eq!(outcome, InsertOutcome::Stored { evicted: 3 });
        let (count, bytes) = store.occupancy();
        assert_eq!(count, 2);
        assert!(bytes <= 100);
        assert!(store.contains("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_entry_rejected() {
        let store = test_store(10, 100, EvictionPolicy::Lru);
        put(&store, entry("a", 1, 10, Duration::from_secs(10)));

        let err = store
            .insert(entry("huge", 2, 101, Duration::from_secs(10)), || true, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { layer: Layer::Hot, .. }));
        // Existing entries are untouched.
        assert!(store.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_read() {
        let store = test_store(10, 1000, EvictionPolicy::Ttl);
        put(&store, entry("a", 1, 10, Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
        assert!(store.peek("a").is_none());
        assert!(store.get("a").is_none());
        assert_eq!(store.occupancy(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged_before_eviction() {
        let store = test_store(2, 1000, EvictionPolicy::Lru);
        put(&store, entry("short", 1, 1, Duration::from_secs(1)));
        put(&store, entry("long", 2, 1, Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(2)).await;

        let outcome = put(&store, entry("new", 3, 1, Duration::from_secs(60)));
        assert_eq!(outcome, InsertOutcome::Stored { evicted: 0 });
        assert!(store.contains("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_guard_and_stop() {
        let store = test_store(10, 1000, EvictionPolicy::Lru);
        let outcome = store
            .insert(entry("a", 1, 1, Duration::from_secs(1)), || false, &mut |_| {})
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Skipped);
        assert!(store.is_empty());

        store.stopped.store(true, Ordering::Release);
        let err = store
            .insert(entry("a", 1, 1, Duration::from_secs(1)), || true, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, CacheError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_tag_scan() {
        let store = test_store(10, 1000, EvictionPolicy::Lru);
        put(&store, entry("a", 1, 1, Duration::from_secs(1)));
        put(&store, entry("b", 2, 1, Duration::from_secs(60)));
        put(&store, entry("c", 3, 1, Duration::from_secs(60)));

        let tagged = store.keys_matching(|m| m.tags.contains("tag-2"));
        assert_eq!(tagged, vec!["b".to_string()]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), vec!["a".to_string()]);
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.occupancy(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_clear_refused_after_stop() {
        let store = test_store(10, 1000, EvictionPolicy::Lru);
        put(&store, entry("a", 1, 1, Duration::from_secs(60)));
        assert!(store.remove("missing").unwrap().is_none());

        store.stopped.store(true, Ordering::Release);
        assert!(matches!(store.remove("a"), Err(CacheError::Stopped)));
        assert!(matches!(store.clear(), Err(CacheError::Stopped)));
        assert!(store.purge_expired().is_empty());
        assert!(store.contains("a"));
    }
}
