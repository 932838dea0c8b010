//! Eviction policy: decides which entry leaves a full layer.
//!
//! Every policy maps an entry to a score where higher means "evict first":
//! - LRU: seconds since last access
//! - LFU: negated access frequency
//! - TTL: negated time left before expiry
//! - Adaptive: `age_secs × size_bytes / max(frequency, 1)`
//!
//! Equal scores fall back to store order (earliest inserted first).

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::entry::CacheEntry;
use crate::cache::tracker::AccessTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Ttl,
    Adaptive,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Ttl => write!(f, "ttl"),
            EvictionPolicy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub score: f64,
    /// Store position; lower was inserted earlier.
    pub seq: u64,
}

// Higher score = higher eviction priority; on a tie the earlier entry wins.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Compute the eviction score of a single entry.
    ///
    /// ```text
    /// adaptive(entry) = secs_since_last_access × size_bytes / max(frequency, 1)
    /// ```
    pub fn compute_score<V>(&self, entry: &CacheEntry<V>, tracker: &AccessTracker, now: Instant) -> f64 {
        match self.policy {
            EvictionPolicy::Lru => entry.age_since_access(now).as_secs_f64(),
            EvictionPolicy::Lfu => -(tracker.frequency(&entry.key) as f64),
            EvictionPolicy::Ttl => -entry.expires_at.saturating_duration_since(now).as_secs_f64(),
            EvictionPolicy::Adaptive => {
                let age_secs = entry.age_since_access(now).as_secs_f64();
                let frequency = tracker.frequency(&entry.key).max(1) as f64;
                age_secs * entry.size_bytes as f64 / frequency
            }
        }
    }

    /// Select up to `count` entries to evict.
    ///
    /// Returns candidates ordered by eviction priority (highest first).
    pub fn select_victims<'a, V: 'a>(
        &self,
        entries: impl Iterator<Item = (u64, &'a CacheEntry<V>)>,
        tracker: &AccessTracker,
        count: usize,
        now: Instant,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = entries
            .map(|(seq, entry)| self.candidate(seq, entry, tracker, now))
            .collect();

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }

    fn candidate<V>(
        &self,
        seq: u64,
        entry: &CacheEntry<V>,
        tracker: &AccessTracker,
        now: Instant,
    ) -> EvictionCandidate {
        EvictionCandidate {
            key: entry.key.clone(),
            score: self.compute_score(entry, tracker, now),
            seq,
        }
    }
}
