//! Cache manager: orchestrates the layers behind the public API.
//!
//! The manager is the central coordinator of the cache. It:
//! - Probes hot → warm → cold on reads and promotes hits upward
//! - Fans writes out to every requested layer and joins them
//! - Demotes eviction victims one layer down instead of dropping them
//! - Owns the per-layer expiry sweeps and the metrics refresh task
//!
//! Promotions never undo a concurrent mutation: every set/delete/clear bumps
//! a striped per-key epoch, and a promotion only commits if the epoch it saw
//! before reading is still current under the destination layer's lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::backend::{BackendError, ColdRecord, ExternalBackend, MemoryBackend};
use crate::cache::codec::Codec;
use crate::cache::entry::{CacheEntry, EntryMetadata, Layer, Priority, SetOptions};
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::events::{CacheEvent, EventBus};
use crate::cache::eviction::Evictor;
use crate::cache::layer::{InsertOutcome, LayerStore};
use crate::cache::tracker::AccessTracker;
use crate::config::{Config, MEMORY_PROVIDER};
use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Number of epoch stripes keys are hashed onto.
const EPOCH_STRIPES: usize = 64;

/// Values a manager can hold.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Callback run when a key misses every layer and prefetching is enabled.
pub type MissHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Where a key currently lives and what it carries.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub layer: Layer,
    pub metadata: EntryMetadata,
    pub size_bytes: usize,
    pub access_count: u64,
    #[serde(serialize_with = "duration_ms")]
    pub remaining_ttl: Duration,
}

fn duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of [`CacheManager::prefetch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub stored: usize,
    pub already_cached: usize,
    pub failed: Vec<String>,
}

enum PrefetchOutcome {
    Stored,
    Cached,
    Failed(String),
}

/// Striped mutation counters; see the module docs.
struct MutationEpochs {
    stripes: Vec<AtomicU64>,
}

impl MutationEpochs {
    fn new() -> Self {
        Self {
            stripes: (0..EPOCH_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % self.stripes.len()]
    }

    fn current(&self, key: &str) -> u64 {
        self.stripe(key).load(Ordering::Acquire)
    }

    fn bump(&self, key: &str) {
        self.stripe(key).fetch_add(1, Ordering::AcqRel);
    }

    fn bump_all(&self) {
        for stripe in &self.stripes {
            stripe.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// An eviction victim waiting to be written to the cold layer.
struct PendingDemotion<V> {
    entry: CacheEntry<V>,
    ttl: Duration,
    epoch: u64,
}

struct Inner<V> {
    config: Arc<Config>,
    hot: Option<LayerStore<V>>,
    warm: Option<LayerStore<V>>,
    cold: Option<Arc<dyn ExternalBackend>>,
    codec: Codec,
    tracker: Arc<AccessTracker>,
    metrics: MetricsCollector,
    events: EventBus,
    stopped: Arc<AtomicBool>,
    epochs: MutationEpochs,
    miss_hook: RwLock<Option<MissHook>>,
}

/// Multi-layer cache over values of type `V`.
///
/// Must be created inside a Tokio runtime: construction spawns one expiry
/// sweep per in-process layer and one metrics refresh task. Call
/// [`CacheManager::stop`] to cancel them and release the cold layer.
pub struct CacheManager<V: CacheValue> {
    inner: Arc<Inner<V>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: CacheValue> CacheManager<V> {
    /// Create a manager, using the built-in memory backend when the cold layer is enabled.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: Arc<Config>) -> CacheResult<Self> {
        let cold = &config.layers.cold;
        let backend: Option<Arc<dyn ExternalBackend>> = match (cold.enabled, cold.provider.as_str()) {
            (false, _) => None,
            (true, MEMORY_PROVIDER) => Some(Arc::new(MemoryBackend::new())),
            (true, other) => {
                return Err(CacheError::Config(format!(
                    "cold provider `{other}` is not built in; pass it to CacheManager::with_backend"
                )))
            }
        };
        Self::build(config, backend)
    }

    /// Create a manager whose cold layer is served by `backend`.
    ///
    /// The backend is only used when `layers.cold.enabled` is set.
    pub fn with_backend(config: Arc<Config>, backend: Arc<dyn ExternalBackend>) -> CacheResult<Self> {
        let backend = config.layers.cold.enabled.then_some(backend);
        Self::build(config, backend)
    }

    fn build(config: Arc<Config>, cold: Option<Arc<dyn ExternalBackend>>) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;

        let tracker = Arc::new(AccessTracker::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let evictor = Evictor::new(config.eviction_policy);
        let make_store = |layer: Layer| {
            config.layer(layer).filter(|c| c.enabled).map(|c| {
                LayerStore::new(layer, c.clone(), evictor.clone(), tracker.clone(), stopped.clone())
            })
        };

        let inner = Arc::new(Inner {
            hot: make_store(Layer::Hot),
            warm: make_store(Layer::Warm),
            cold,
            codec: Codec::new(
                config.compression_enabled,
                config.layers.cold.compression_threshold,
                config.zstd_level,
            ),
            tracker: tracker.clone(),
            metrics: MetricsCollector::new()?,
            events: EventBus::new(),
            stopped: stopped.clone(),
            epochs: MutationEpochs::new(),
            miss_hook: RwLock::new(None),
            config,
        });

        let mut tasks = Vec::new();
        for store in [&inner.hot, &inner.warm].into_iter().flatten() {
            tasks.push(spawn_cleanup(&handle, inner.clone(), store.layer(), store.config().cleanup_interval()));
        }
        if inner.cold.is_some() {
            let period = inner.config.layers.cold.cleanup_interval();
            tasks.push(spawn_cleanup(&handle, inner.clone(), Layer::Cold, period));
        }
        tasks.push(spawn_metrics_refresh(&handle, inner.clone()));

        info!(
            hot = inner.hot.is_some(),
            warm = inner.warm.is_some(),
            cold = ?inner.cold.as_ref().map(|b| b.name()),
            policy = %inner.config.eviction_policy,
            "Cache manager started"
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    /// Read a value, probing hot, warm, then cold.
    ///
    /// A hit below the hot layer is copied into every enabled layer above it
    /// with its remaining TTL. Never fails: internal errors degrade to `None`.
    pub async fn get(&self, key: &str) -> Option<V> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return None;
        }
        let epoch = inner.epochs.current(key);

        for store in [&inner.hot, &inner.warm].into_iter().flatten() {
            let layer = store.layer();
            let started = std::time::Instant::now();
            match store.get(key) {
                Some(entry) => {
                    inner.metrics.record_hit(layer, started.elapsed());
                    inner.tracker.record(key);
                    if layer != Layer::Hot {
                        inner.promote(&entry, layer, epoch);
                    }
                    return Some(entry.value);
                }
                None => {
                    inner.metrics.record_miss(layer, started.elapsed());
                    inner.update_occupancy(layer);
                }
            }
        }

        if let Some(value) = inner.get_cold(key, epoch).await {
            return Some(value);
        }

        inner.on_miss(key);
        None
    }

    /// Write a value to every requested, enabled layer.
    ///
    /// Writes are joined; the first failure is returned after all layers
    /// settle. Layers that succeeded keep the value.
    pub async fn set(&self, key: &str, value: V, options: SetOptions) -> CacheResult<()> {
        self.inner.set(key, value, options).await
    }

    /// Remove a key from every layer. Removing an absent key succeeds.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner.delete(key).await
    }

    /// Empty the given layers, or all of them.
    ///
    /// Access history is reset only when every enabled layer is cleared.
    pub async fn clear(&self, layers: Option<&[Layer]>) -> CacheResult<()> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(CacheError::Stopped);
        }
        let targets: Vec<Layer> = match layers {
            Some(requested) => Layer::ALL
                .into_iter()
                .filter(|l| requested.contains(l) && inner.is_enabled(*l))
                .collect(),
            None => Layer::ALL.into_iter().filter(|l| inner.is_enabled(*l)).collect(),
        };

        inner.epochs.bump_all();

        let mut first_error = None;
        for &layer in &targets {
            match layer {
                Layer::Hot | Layer::Warm => {
                    if let Some(store) = inner.store(layer) {
                        let removed = store.clear()?;
                        inner.update_occupancy(layer);
                        debug!(layer = %layer, removed, "Layer cleared");
                    }
                }
                Layer::Cold => {
                    if let Err(e) = inner.cold_clear().await {
                        inner.events.error("clear", None, &e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        let all_cleared = Layer::ALL
            .into_iter()
            .filter(|l| inner.is_enabled(*l))
            .all(|l| targets.contains(&l));
        if all_cleared {
            inner.tracker.reset();
        }

        info!(layers = ?targets, "Cache cleared");
        inner.events.publish(CacheEvent::Cleared { layers: targets });

        first_error.map_or(Ok(()), Err)
    }

    /// Delete every key carrying any of `tags`, returning how many were removed.
    ///
    /// Only in-process layers are scanned; matched keys are then deleted from
    /// every layer.
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> CacheResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(CacheError::Stopped);
        }
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();

        let mut keys: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for store in [&inner.hot, &inner.warm].into_iter().flatten() {
            for key in store.keys_matching(|m| m.has_any_tag(&tags)) {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        let mut first_error = None;
        for key in &keys {
            if let Err(e) = inner.delete(key).await {
                first_error.get_or_insert(e);
            }
        }

        info!(tags = ?tags, removed = keys.len(), "Invalidated by tags");
        inner.events.publish(CacheEvent::Invalidated {
            tags,
            removed: keys.len(),
        });

        first_error.map_or(Ok(keys.len()), Err)
    }

    /// Load every key that is not cached yet from `provider`, storing at low priority.
    ///
    /// Keys are fetched concurrently; one failing key does not affect the others.
    pub async fn prefetch<K, F, Fut, E>(&self, keys: K, provider: F) -> PrefetchReport
    where
        K: IntoIterator<Item = String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::fmt::Display,
    {
        let provider = &provider;
        let fetches = keys.into_iter().map(|key| async move {
            if self.contains(&key).await {
                return PrefetchOutcome::Cached;
            }
            let value = match provider(key.clone()).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %key, error = %e, "Prefetch provider failed");
                    self.inner.events.error("prefetch", Some(&key), &e);
                    return PrefetchOutcome::Failed(key);
                }
            };
            let options = SetOptions::default().priority(Priority::Low);
            match self.set(&key, value, options).await {
                Ok(()) => PrefetchOutcome::Stored,
                Err(_) => PrefetchOutcome::Failed(key),
            }
        });

        let mut report = PrefetchReport::default();
        for outcome in join_all(fetches).await {
            match outcome {
                PrefetchOutcome::Stored => report.stored += 1,
                PrefetchOutcome::Cached => report.already_cached += 1,
                PrefetchOutcome::Failed(key) => report.failed.push(key),
            }
        }
        debug!(
            stored = report.stored,
            cached = report.already_cached,
            failed = report.failed.len(),
            "Prefetch complete"
        );
        report
    }

    /// Whether a live copy exists in any layer. Does not count as an access.
    pub async fn contains(&self, key: &str) -> bool {
        self.entry_info(key).await.is_some()
    }

    /// Describe the highest layer holding `key`, without touching it.
    pub async fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let inner = &self.inner;
        let now = Instant::now();
        for store in [&inner.hot, &inner.warm].into_iter().flatten() {
            if let Some(entry) = store.peek(key) {
                return Some(EntryInfo {
                    layer: store.layer(),
                    size_bytes: entry.size_bytes,
                    access_count: entry.access_count,
                    remaining_ttl: entry.remaining_ttl(now).unwrap_or_default(),
                    metadata: entry.metadata,
                });
            }
        }

        let backend = inner.cold.as_ref()?;
        match inner.cold_call(backend.get(key)).await {
            Ok(Some(record)) => Some(EntryInfo {
                layer: Layer::Cold,
                size_bytes: record.payload.len(),
                access_count: 0,
                remaining_ttl: record.remaining_ttl.unwrap_or_default(),
                metadata: EntryMetadata {
                    tags: record.tags,
                    priority: record.priority,
                    source: Layer::Cold,
                },
            }),
            Ok(None) => None,
            Err(e) => {
                debug!(key, error = %e, "Cold lookup failed");
                None
            }
        }
    }

    /// Snapshot of the current statistics.
    pub fn get_statistics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        for layer in Layer::IN_PROCESS {
            inner.update_occupancy(layer);
        }
        inner.metrics.snapshot(inner.tracker.tracked_keys())
    }

    /// Prometheus text exposition of the metrics.
    pub fn render_prometheus(&self) -> String {
        self.inner.metrics.render()
    }

    /// Receive every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Install the callback run on a full miss, replacing any previous one.
    pub fn set_miss_hook(&self, hook: MissHook) {
        *self.inner.miss_hook.write() = Some(hook);
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether [`CacheManager::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Cancel background tasks and close the cold layer. Idempotent.
    ///
    /// Operations already running may finish, but nothing they produce is
    /// committed after this point.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Cancellation is the expected outcome.
            let _ = task.await;
        }

        if let Some(backend) = &inner.cold {
            if let Err(e) = inner.cold_call(backend.close()).await {
                warn!(backend = backend.name(), error = %e, "Failed to close cold layer");
                inner.events.error("stop", None, &e);
            }
        }

        info!("Cache manager stopped");
        inner.events.publish(CacheEvent::Stopped);
    }
}

impl<V: CacheValue> Drop for CacheManager<V> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl<V: CacheValue> Inner<V> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn store(&self, layer: Layer) -> Option<&LayerStore<V>> {
        match layer {
            Layer::Hot => self.hot.as_ref(),
            Layer::Warm => self.warm.as_ref(),
            Layer::Cold => None,
        }
    }

    fn is_enabled(&self, layer: Layer) -> bool {
        match layer {
            Layer::Cold => self.cold.is_some(),
            _ => self.store(layer).is_some(),
        }
    }

    fn update_occupancy(&self, layer: Layer) {
        if let Some(store) = self.store(layer) {
            let (entries, bytes) = store.occupancy();
            self.metrics.set_occupancy(layer, entries, bytes);
        }
    }

    /// Encoded size of a value; falls back to its in-memory size if encoding fails.
    fn measure(&self, key: &str, value: &V) -> usize {
        match self.codec.encoded_size(value) {
            Ok(size) => size,
            Err(e) => {
                warn!(key, error = %e, "Size estimation failed, using in-memory size");
                self.events.error("measure", Some(key), &e);
                std::mem::size_of::<V>()
            }
        }
    }

    async fn set(self: &Arc<Self>, key: &str, value: V, options: SetOptions) -> CacheResult<()> {
        if self.is_stopped() {
            return Err(CacheError::Stopped);
        }
        if options.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CacheError::InvalidTtl);
        }

        let targets: Vec<Layer> = match &options.layers {
            Some(requested) => Layer::ALL
                .into_iter()
                .filter(|l| requested.contains(l) && self.is_enabled(*l))
                .collect(),
            None => Layer::IN_PROCESS
                .into_iter()
                .filter(|l| self.is_enabled(*l))
                .collect(),
        };

        self.epochs.bump(key);

        // A copy left in a layer outside the targets would shadow or outlive the new value.
        for layer in Layer::IN_PROCESS.into_iter().filter(|l| !targets.contains(l)) {
            if let Some(store) = self.store(layer) {
                if store.remove(key)?.is_some() {
                    debug!(key, layer = %layer, "Dropped stale copy outside write targets");
                    self.update_occupancy(layer);
                }
            }
        }

        let size = self.measure(key, &value);
        let mut demotions = Vec::new();

        let local_writes = async {
            let mut results = Vec::new();
            for &layer in targets.iter().filter(|l| l.is_in_process()) {
                let Some(config) = self.config.layer(layer) else { continue };
                let metadata = EntryMetadata {
                    tags: options.tags.clone(),
                    priority: options.priority,
                    source: layer,
                };
                let ttl = options.ttl.unwrap_or_else(|| config.default_ttl());
                let entry = CacheEntry::new(key, value.clone(), ttl, size, metadata);
                let result = self.insert_into(layer, entry, || true, &mut demotions);
                results.push((layer, result.map(|_| ())));
            }
            results
        };
        let cold_write = async {
            if targets.contains(&Layer::Cold) {
                Some((Layer::Cold, self.write_cold(key, &value, &options).await))
            } else {
                self.drop_stale_cold(key).await;
                None
            }
        };
        let (mut results, cold_result) = futures::join!(local_writes, cold_write);
        results.extend(cold_result);

        self.tracker.record(key);
        self.flush_demotions(demotions).await;

        let mut written = Vec::new();
        let mut first_error = None;
        for (layer, result) in results {
            match result {
                Ok(()) => written.push(layer),
                Err(e) => {
                    warn!(key, layer = %layer, error = %e, "Layer write failed");
                    self.events.error("set", Some(key), &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !written.is_empty() {
            debug!(key, layers = ?written, size, "Wrote entry");
            self.events.publish(CacheEvent::Written {
                key: key.to_string(),
                layers: written,
            });
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn write_cold(&self, key: &str, value: &V, options: &SetOptions) -> CacheResult<()> {
        let backend = self.cold.as_ref().ok_or(CacheError::Stopped)?;
        if self.is_stopped() {
            return Err(CacheError::Stopped);
        }

        let encoded = self.codec.encode(value)?;
        if let Some(e) = &encoded.compression_error {
            self.events.error("compress", Some(key), e);
        }
        let record = ColdRecord {
            payload: encoded.payload,
            compressed: encoded.compressed,
            tags: options.tags.clone(),
            priority: options.priority,
            remaining_ttl: None,
        };
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.config.layers.cold.default_ttl());

        self.cold_call(backend.set(key, record, ttl))
            .await
            .map_err(|source| CacheError::BackendUnavailable {
                layer: Layer::Cold,
                source,
            })
    }

    /// Remove an older cold copy a write did not target. Failures are reported, not returned.
    async fn drop_stale_cold(&self, key: &str) {
        let Some(backend) = &self.cold else { return };
        if let Err(e) = self.cold_call(backend.delete(key)).await {
            warn!(key, backend = backend.name(), error = %e, "Failed to drop stale cold copy");
            self.events.error("set", Some(key), &e);
        }
    }

    /// Insert into an in-process layer, demoting its victims one layer down.
    ///
    /// Victims headed for the cold layer are queued in `demotions`, since the
    /// backend cannot be awaited under a layer lock.
    fn insert_into(
        &self,
        layer: Layer,
        entry: CacheEntry<V>,
        commit_guard: impl FnOnce() -> bool,
        demotions: &mut Vec<PendingDemotion<V>>,
    ) -> CacheResult<InsertOutcome> {
        let store = self
            .store(layer)
            .ok_or_else(|| CacheError::Config(format!("{layer} layer is disabled")))?;

        let mut on_evict = |victim: &CacheEntry<V>| self.demote(layer, victim, demotions);
        let outcome = store.insert(entry, commit_guard, &mut on_evict)?;

        if let InsertOutcome::Stored { evicted } = outcome {
            self.metrics.record_evictions(layer, evicted);
        }
        self.update_occupancy(layer);
        Ok(outcome)
    }

    /// Move an eviction victim of `from` into the next enabled layer down.
    ///
    /// Runs under `from`'s lock, before the victim is removed there.
    fn demote(&self, from: Layer, victim: &CacheEntry<V>, demotions: &mut Vec<PendingDemotion<V>>) {
        let target = from.demote().filter(|l| self.is_enabled(*l));
        let remaining = victim.remaining_ttl(Instant::now());

        let demoted_to = match (target, remaining) {
            (Some(Layer::Warm), Some(ttl)) => {
                let moved = victim.relocated(Layer::Warm, ttl);
                match self.insert_into(Layer::Warm, moved, || true, demotions) {
                    Ok(_) => Some(Layer::Warm),
                    Err(e) => {
                        warn!(key = %victim.key, error = %e, "Demotion to warm layer failed");
                        self.events.error("demote", Some(&victim.key), &e);
                        None
                    }
                }
            }
            (Some(Layer::Cold), Some(ttl)) => {
                demotions.push(PendingDemotion {
                    entry: victim.clone(),
                    ttl,
                    epoch: self.epochs.current(&victim.key),
                });
                Some(Layer::Cold)
            }
            _ => None,
        };

        debug!(key = %victim.key, from = %from, to = ?demoted_to, "Eviction victim handled");
        self.events.publish(CacheEvent::Evicted {
            layer: from,
            key: victim.key.clone(),
            demoted_to,
        });
    }

    /// Write queued warm → cold demotions.
    ///
    /// A demotion raced by a mutation of the same key is dropped, or removed
    /// again if the race is only visible after the write.
    async fn flush_demotions(&self, demotions: Vec<PendingDemotion<V>>) {
        let Some(backend) = &self.cold else { return };

        for pending in demotions {
            let key = pending.entry.key.as_str();
            if self.is_stopped() || self.epochs.current(key) != pending.epoch {
                continue;
            }

            let options = SetOptions {
                ttl: Some(pending.ttl),
                tags: pending.entry.metadata.tags.clone(),
                priority: pending.entry.metadata.priority,
                layers: None,
            };
            if let Err(e) = self.write_cold(key, &pending.entry.value, &options).await {
                warn!(key, error = %e, "Demotion to cold layer failed");
                self.events.error("demote", Some(key), &e);
                continue;
            }

            if self.epochs.current(key) != pending.epoch {
                debug!(key, "Demoted entry raced a mutation, removing cold copy");
                if let Err(e) = self.cold_call(backend.delete(key)).await {
                    self.events.error("demote", Some(key), &e);
                }
            }
        }
    }

    /// Copy a hit from `found_in` into every enabled layer above it.
    fn promote(self: &Arc<Self>, entry: &CacheEntry<V>, found_in: Layer, epoch: u64) {
        let mut demotions = Vec::new();

        for layer in Layer::IN_PROCESS.into_iter().rev().filter(|l| *l < found_in) {
            if self.store(layer).is_none() {
                continue;
            }
            let Some(ttl) = entry.remaining_ttl(Instant::now()) else { break };

            let promoted = entry.relocated(layer, ttl);
            let guard = || self.epochs.current(&entry.key) == epoch;
            match self.insert_into(layer, promoted, guard, &mut demotions) {
                Ok(InsertOutcome::Stored { .. }) => {
                    debug!(key = %entry.key, from = %found_in, to = %layer, "Promoted entry");
                }
                Ok(InsertOutcome::Skipped) => break,
                Err(e) => {
                    warn!(key = %entry.key, layer = %layer, error = %e, "Promotion failed");
                    self.events.error("promote", Some(&entry.key), &e);
                }
            }
        }

        if !demotions.is_empty() {
            let inner = self.clone();
            tokio::spawn(async move { inner.flush_demotions(demotions).await });
        }
    }

    async fn get_cold(self: &Arc<Self>, key: &str, epoch: u64) -> Option<V> {
        let backend = self.cold.as_ref()?;
        let started = std::time::Instant::now();

        let record = match self.cold_call(backend.get(key)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.metrics.record_miss(Layer::Cold, started.elapsed());
                return None;
            }
            Err(e) => {
                self.metrics.record_miss(Layer::Cold, started.elapsed());
                warn!(key, backend = backend.name(), error = %e, "Cold read failed, treating as miss");
                self.events.error("get", Some(key), &e);
                return None;
            }
        };
        self.metrics.record_hit(Layer::Cold, started.elapsed());

        let value: V = match self.codec.decode(&record.payload, record.compressed) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Undecodable cold record, treating as miss");
                self.events.error("get", Some(key), &e);
                return None;
            }
        };
        self.tracker.record(key);

        if !self.is_stopped() {
            let ttl = record
                .remaining_ttl
                .unwrap_or_else(|| self.config.layers.cold.default_ttl());
            let metadata = EntryMetadata {
                tags: record.tags,
                priority: record.priority,
                source: Layer::Cold,
            };
            let size = self.measure(key, &value);
            let entry = CacheEntry::new(key, value.clone(), ttl, size, metadata);
            self.promote(&entry, Layer::Cold, epoch);
        }
        Some(value)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        if self.is_stopped() {
            return Err(CacheError::Stopped);
        }
        self.epochs.bump(key);

        // Hot first: anything promoted before the bump is removed below.
        for store in [&self.hot, &self.warm].into_iter().flatten() {
            if store.remove(key)?.is_some() {
                self.update_occupancy(store.layer());
            }
        }

        let mut result = Ok(());
        if let Some(backend) = &self.cold {
            if let Err(source) = self.cold_call(backend.delete(key)).await {
                warn!(key, error = %source, "Cold delete failed");
                self.events.error("delete", Some(key), &source);
                result = Err(CacheError::BackendUnavailable {
                    layer: Layer::Cold,
                    source,
                });
            }
        }

        self.tracker.forget(key);
        self.events.publish(CacheEvent::Deleted { key: key.to_string() });
        result
    }

    async fn cold_clear(&self) -> CacheResult<()> {
        let Some(backend) = &self.cold else { return Ok(()) };
        self.cold_call(backend.clear())
            .await
            .map_err(|source| CacheError::BackendUnavailable {
                layer: Layer::Cold,
                source,
            })
    }

    /// Run a backend call under the configured timeout.
    async fn cold_call<T>(&self, call: impl Future<Output = Result<T, BackendError>>) -> Result<T, BackendError> {
        let limit = self.config.layers.cold.operation_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    fn on_miss(&self, key: &str) {
        if !self.config.prefetch_enabled {
            return;
        }
        let Some(hook) = self.miss_hook.read().clone() else { return };
        if catch_unwind(AssertUnwindSafe(|| hook(key))).is_err() {
            warn!(key, "Miss hook panicked");
            self.events.error("prefetch_hook", Some(key), "miss hook panicked");
        }
    }

    async fn sweep(&self, layer: Layer) {
        if self.is_stopped() {
            return;
        }

        let removed = match layer {
            Layer::Cold => {
                let Some(backend) = &self.cold else { return };
                match self.cold_call(backend.sweep_expired()).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, "Cold expiry sweep failed");
                        self.events.error("cleanup", None, &e);
                        return;
                    }
                }
            }
            Layer::Hot | Layer::Warm => {
                let Some(store) = self.store(layer) else { return };
                let purged = store.purge_expired();
                self.update_occupancy(layer);
                self.prune_tracker();
                purged.len()
            }
        };

        if removed > 0 {
            debug!(layer = %layer, removed, "Expiry sweep");
            self.events.publish(CacheEvent::CleanupSwept { layer, removed });
        }
    }

    /// Forget the access history of keys no in-process layer holds any more.
    fn prune_tracker(&self) {
        let stale: Vec<String> = self
            .tracker
            .keys()
            .into_iter()
            .filter(|key| !self.is_resident(key))
            .collect();
        if !stale.is_empty() {
            debug!(pruned = stale.len(), "Pruned access history");
            self.tracker.forget_all(stale.iter().map(String::as_str));
        }
    }

    fn is_resident(&self, key: &str) -> bool {
        [&self.hot, &self.warm]
            .into_iter()
            .flatten()
            .any(|store| store.contains(key))
    }

    fn refresh_metrics(&self) {
        for layer in Layer::IN_PROCESS {
            self.update_occupancy(layer);
        }
        self.metrics.refresh_aggregate();
        let snapshot = self.metrics.snapshot(self.tracker.tracked_keys());
        self.events.publish(CacheEvent::MetricsUpdated(Box::new(snapshot)));
    }
}

fn spawn_cleanup<V: CacheValue>(
    handle: &Handle,
    inner: Arc<Inner<V>>,
    layer: Layer,
    period: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if inner.is_stopped() {
                break;
            }
            inner.sweep(layer).await;
        }
    })
}

fn spawn_metrics_refresh<V: CacheValue>(handle: &Handle, inner: Arc<Inner<V>>) -> JoinHandle<()> {
    let period = inner.config.metrics_interval();
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if inner.is_stopped() {
                break;
            }
            inner.refresh_metrics();
        }
    })
}
