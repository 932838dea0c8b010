//! Per-layer and aggregate cache metrics.
//!
//! Counters and gauges live in a per-instance prometheus [`Registry`] labelled
//! by layer, so they can be scraped as-is. The aggregate view is a sum of the
//! per-layer counters and is only recomputed by [`MetricsCollector::refresh_aggregate`],
//! which the manager calls on a fixed interval.

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::cache::entry::Layer;

/// Weight of the newest sample in the latency moving average.
pub const LATENCY_EMA_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerStats {
    pub layer: Option<Layer>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub entry_count: u64,
    pub size_bytes: u64,
    /// Exponentially smoothed access latency in microseconds.
    pub avg_latency_us: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub entry_count: u64,
    pub size_bytes: u64,
    /// Number of refreshes so far; 0 means the aggregate was never computed.
    pub refreshes: u64,
}

/// Immutable copy of the current statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub layers: Vec<LayerStats>,
    pub aggregate: AggregateStats,
    pub tracked_keys: usize,
}

impl MetricsSnapshot {
    pub fn layer(&self, layer: Layer) -> Option<&LayerStats> {
        self.layers.iter().find(|s| s.layer == Some(layer))
    }
}

pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}

pub struct MetricsCollector {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    evictions: IntCounterVec,
    entries: IntGaugeVec,
    bytes: IntGaugeVec,
    latency: GaugeVec,
    /// Serializes read-modify-write of the latency averages.
    latency_lock: Mutex<()>,
    aggregate: RwLock<AggregateStats>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tiered_cache".to_string()), None)?;

        let hits = IntCounterVec::new(Opts::new("hits_total", "Read hits per layer"), &["layer"])?;
        let misses = IntCounterVec::new(Opts::new("misses_total", "Read misses per layer"), &["layer"])?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Entries evicted per layer"),
            &["layer"],
        )?;
        let entries = IntGaugeVec::new(Opts::new("entries", "Live entries per layer"), &["layer"])?;
        let bytes = IntGaugeVec::new(Opts::new("size_bytes", "Live entry bytes per layer"), &["layer"])?;
        let latency = GaugeVec::new(
            Opts::new("access_latency_us", "Smoothed access latency per layer"),
            &["layer"],
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            entries,
            bytes,
            latency,
            latency_lock: Mutex::new(()),
            aggregate: RwLock::new(AggregateStats::default()),
        })
    }

    pub fn record_hit(&self, layer: Layer, latency: Duration) {
        self.hits.with_label_values(&[layer.as_str()]).inc();
        self.record_latency(layer, latency);
    }

    pub fn record_miss(&self, layer: Layer, latency: Duration) {
        self.misses.with_label_values(&[layer.as_str()]).inc();
        self.record_latency(layer, latency);
    }

    pub fn record_evictions(&self, layer: Layer, count: usize) {
        if count > 0 {
            self.evictions
                .with_label_values(&[layer.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn set_occupancy(&self, layer: Layer, entries: usize, bytes: usize) {
        self.entries.with_label_values(&[layer.as_str()]).set(entries as i64);
        self.bytes.with_label_values(&[layer.as_str()]).set(bytes as i64);
    }

    /// `ema = 0.9 · ema_prev + 0.1 · sample`
    fn record_latency(&self, layer: Layer, latency: Duration) {
        let sample = latency.as_secs_f64() * 1_000_000.0;
        let gauge = self.latency.with_label_values(&[layer.as_str()]);

        let _guard = self.latency_lock.lock();
        let ema = (1.0 - LATENCY_EMA_WEIGHT) * gauge.get() + LATENCY_EMA_WEIGHT * sample;
        gauge.set(ema);
    }

    pub fn layer_stats(&self, layer: Layer) -> LayerStats {
        let label = [layer.as_str()];
        let hits = self.hits.with_label_values(&label).get();
        let misses = self.misses.with_label_values(&label).get();

        LayerStats {
            layer: Some(layer),
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            evictions: self.evictions.with_label_values(&label).get(),
            entry_count: self.entries.with_label_values(&label).get().max(0) as u64,
            size_bytes: self.bytes.with_label_values(&label).get().max(0) as u64,
            avg_latency_us: self.latency.with_label_values(&label).get(),
        }
    }

    /// Recompute the aggregate view by summing every layer's counters.
    pub fn refresh_aggregate(&self) -> AggregateStats {
        let mut total = AggregateStats::default();
        for layer in Layer::ALL {
            let stats = self.layer_stats(layer);
            total.hits += stats.hits;
            total.misses += stats.misses;
            total.evictions += stats.evictions;
            total.entry_count += stats.entry_count;
            total.size_bytes += stats.size_bytes;
        }
        total.hit_rate = hit_rate(total.hits, total.misses);

        let mut aggregate = self.aggregate.write();
        total.refreshes = aggregate.refreshes + 1;
        *aggregate = total.clone();
        total
    }

    /// Live per-layer stats plus the last computed aggregate.
    pub fn snapshot(&self, tracked_keys: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            layers: Layer::ALL.iter().map(|&l| self.layer_stats(l)).collect(),
            aggregate: self.aggregate.read().clone(),
            tracked_keys,
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
