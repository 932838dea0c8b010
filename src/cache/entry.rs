//! Cache entry types and layer definitions.
//!
//! An entry is the unit of movement between layers: it is promoted upward on
//! a read hit and demoted downward when evicted.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifies one tier of the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Layer 0: small, fastest.
    Hot,
    /// Layer 1: larger in-process layer.
    Warm,
    /// Layer 2: external backend (optional).
    Cold,
}

impl Layer {
    /// Probe order for reads, fastest first.
    pub const ALL: [Layer; 3] = [Layer::Hot, Layer::Warm, Layer::Cold];

    /// Layers held in process memory.
    pub const IN_PROCESS: [Layer; 2] = [Layer::Hot, Layer::Warm];

    /// Returns the numeric layer level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Layer::Hot => 0,
            Layer::Warm => 1,
            Layer::Cold => 2,
        }
    }

    /// Returns the next slower layer for demotion, or None if already coldest.
    pub fn demote(&self) -> Option<Layer> {
        match self {
            Layer::Hot => Some(Layer::Warm),
            Layer::Warm => Some(Layer::Cold),
            Layer::Cold => None,
        }
    }

    /// Returns the next faster layer for promotion, or None if already hottest.
    pub fn promote(&self) -> Option<Layer> {
        match self {
            Layer::Hot => None,
            Layer::Warm => Some(Layer::Hot),
            Layer::Cold => Some(Layer::Warm),
        }
    }

    pub fn is_in_process(&self) -> bool {
        !matches!(self, Layer::Cold)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Hot => "hot",
            Layer::Warm => "warm",
            Layer::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Layer::Hot),
            "warm" => Ok(Layer::Warm),
            "cold" => Ok(Layer::Cold),
            other => Err(format!("unknown layer `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Descriptive data carried with every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub tags: HashSet<String>,
    pub priority: Priority,
    /// Layer the entry currently lives in.
    pub source: Layer,
}

impl EntryMetadata {
    /// Whether any of `tags` is attached to this entry.
    pub fn has_any_tag<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> bool {
        tags.into_iter().any(|t| self.tags.contains(t))
    }
}

/// A single cached value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    /// Always strictly after `created_at`.
    pub expires_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// Encoded size of `value`, recomputed on every write.
    pub size_bytes: usize,
    pub metadata: EntryMetadata,
}

impl<V> CacheEntry<V> {
    /// Create a fresh entry living in `layer` for `ttl`.
    ///
    /// `ttl` must be non-zero; the manager rejects zero TTLs before calling this.
    pub fn new(
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        size_bytes: usize,
        metadata: EntryMetadata,
    ) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: now + ttl.max(Duration::from_nanos(1)),
            last_accessed: now,
            access_count: 0,
            size_bytes,
            metadata,
        }
    }

    /// Record a read hit, updating timestamp and counter.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        let left = self.expires_at.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }

    pub fn age_since_access(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed)
    }
}

impl<V: Clone> CacheEntry<V> {
    /// Copy of this entry re-homed in `layer` with a fresh lifetime of `ttl`.
    ///
    /// Used for promotion and demotion, where `ttl` is the remaining lifetime
    /// so the absolute expiry is preserved across layers.
    pub fn relocated(&self, layer: Layer, ttl: Duration) -> Self {
        let now = Instant::now();
        let mut metadata = self.metadata.clone();
        metadata.source = layer;
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            created_at: now,
            expires_at: now + ttl.max(Duration::from_nanos(1)),
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size_bytes: self.size_bytes,
            metadata,
        }
    }
}

/// Per-call options for `CacheManager::set`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SetOptions {
    /// Overrides each layer's default TTL.
    #[serde(with = "opt_millis")]
    pub ttl: Option<Duration>,
    pub tags: HashSet<String>,
    pub priority: Priority,
    /// Target layers; `None` writes to every enabled in-process layer.
    pub layers: Option<Vec<Layer>>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn layers(mut self, layers: impl Into<Vec<Layer>>) -> Self {
        self.layers = Some(layers.into());
        self
    }
}

/// `Option<Duration>` as an optional integer millisecond count.
mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
