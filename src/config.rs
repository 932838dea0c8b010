//! Runtime configuration for tiered-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All layer-related knobs (capacities, TTLs, sweep intervals, eviction policy)
//! live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::entry::Layer;
use crate::cache::eviction::EvictionPolicy;

/// Provider name of the in-memory cold backend shipped with the crate.
pub const MEMORY_PROVIDER: &str = "memory";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tiered-cache", about = "Multi-layer cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-layer settings.
    pub layers: LayersConfig,

    /// Victim selection strategy used by the in-process layers.
    pub eviction_policy: EvictionPolicy,

    /// Compress encoded values above the cold layer's threshold.
    pub compression_enabled: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Invoke the miss hook when a key misses every layer.
    pub prefetch_enabled: bool,

    /// Interval of the aggregate metrics refresh.
    pub metrics_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layers: LayersConfig::default(),
            eviction_policy: EvictionPolicy::Lru,
            compression_enabled: true,
            zstd_level: 3,
            prefetch_enabled: false,
            metrics_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    pub hot: LayerConfig,
    pub warm: LayerConfig,
    pub cold: ColdLayerConfig,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            hot: LayerConfig::hot(),
            warm: LayerConfig::warm(),
            cold: ColdLayerConfig::default(),
        }
    }
}

/// Settings of one in-process layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub enabled: bool,

    /// Maximum number of live entries.
    pub max_entries: usize,

    /// Maximum aggregate size of live entries in bytes.
    pub max_memory_bytes: usize,

    /// TTL applied when `set` does not pass one.
    pub default_ttl_ms: u64,

    /// Interval of the background expiry sweep.
    pub cleanup_interval_ms: u64,
}

impl LayerConfig {
    pub fn hot() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            max_memory_bytes: 50 * 1024 * 1024, // 50 MB
            default_ttl_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        }
    }

    pub fn warm() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_memory_bytes: 200 * 1024 * 1024, // 200 MB
            default_ttl_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self::hot()
    }
}

/// Settings of the external (cold) layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdLayerConfig {
    pub enabled: bool,

    /// Backend name. Only [`MEMORY_PROVIDER`] is built in; any other name
    /// requires a backend injected through `CacheManager::with_backend`.
    pub provider: String,

    pub default_ttl_ms: u64,

    /// Encoded values larger than this are zstd-compressed.
    pub compression_threshold: usize,

    /// Upper bound on every backend call; a timeout counts as a failure.
    pub operation_timeout_ms: u64,

    /// How often expired records are purged from the backend.
    pub cleanup_interval_ms: u64,
}

impl ColdLayerConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for ColdLayerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: MEMORY_PROVIDER.to_string(),
            default_ttl_ms: 24 * 60 * 60 * 1000,
            compression_threshold: 1024,
            operation_timeout_ms: 1_000,
            cleanup_interval_ms: 10 * 60 * 1000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate().map_err(anyhow::Error::msg)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Check the bounds every enabled layer relies on.
    pub fn validate(&self) -> Result<(), String> {
        for (layer, cfg) in [(Layer::Hot, &self.layers.hot), (Layer::Warm, &self.layers.warm)] {
            if !cfg.enabled {
                continue;
            }
            if cfg.max_entries == 0 || cfg.max_memory_bytes == 0 {
                return Err(format!("{layer} layer must allow at least one entry and one byte"));
            }
            if cfg.default_ttl_ms == 0 {
                return Err(format!("{layer} layer default TTL must be positive"));
            }
            if cfg.cleanup_interval_ms == 0 {
                return Err(format!("{layer} layer cleanup interval must be positive"));
            }
        }

        let cold = &self.layers.cold;
        if cold.enabled
            && (cold.default_ttl_ms == 0 || cold.operation_timeout_ms == 0 || cold.cleanup_interval_ms == 0)
        {
            return Err("cold layer TTL, operation timeout and cleanup interval must be positive".to_string());
        }
        if self.metrics_interval_ms == 0 {
            return Err("metrics interval must be positive".to_string());
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(format!("zstd level {} out of range 1-22", self.zstd_level));
        }
        Ok(())
    }

    /// Configuration of an in-process layer; `None` for the cold layer.
    pub fn layer(&self, layer: Layer) -> Option<&LayerConfig> {
        match layer {
            Layer::Hot => Some(&self.layers.hot),
            Layer::Warm => Some(&self.layers.warm),
            Layer::Cold => None,
        }
    }

    /// Whether a layer takes part in reads and writes.
    pub fn is_enabled(&self, layer: Layer) -> bool {
        match layer {
            Layer::Hot => self.layers.hot.enabled,
            Layer::Warm => self.layers.warm.enabled,
            Layer::Cold => self.layers.cold.enabled,
        }
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}
