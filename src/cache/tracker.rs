//! Global access tracking: recency order and frequency counters.
//!
//! Keyed by logical key, not by layer, so a key keeps its history while it
//! moves between layers. Entry-local `last_accessed` stays authoritative for
//! expiry; the tracker only feeds eviction ranking. The manager prunes keys
//! that no in-process layer holds any more on every expiry sweep.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

/// Recency list length that triggers truncation.
pub const MAX_RECENCY: usize = 10_000;

/// Length the recency list is cut back to on overflow.
pub const TRUNCATED_RECENCY: usize = 5_000;

#[derive(Debug, Default)]
struct KeyStats {
    frequency: u64,
    /// Position in `recency`; `None` once truncated out of it.
    stamp: Option<u64>,
}

#[derive(Debug, Default)]
struct AccessState {
    clock: u64,
    /// Stamp → key, oldest first.
    recency: BTreeMap<u64, String>,
    keys: HashMap<String, KeyStats>,
}

/// Thread-safe access tracker shared by every layer of a manager.
#[derive(Debug, Default)]
pub struct AccessTracker {
    state: RwLock<AccessState>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one access (read hit or write) of `key`.
    pub fn record(&self, key: &str) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        state.clock += 1;
        let stamp = state.clock;
        if !state.keys.contains_key(key) {
            state.keys.insert(key.to_string(), KeyStats::default());
        }
        let Some(stats) = state.keys.get_mut(key) else { return };
        stats.frequency += 1;
        if let Some(previous) = stats.stamp.replace(stamp) {
            state.recency.remove(&previous);
        }
        state.recency.insert(stamp, key.to_string());

        if state.recency.len() > MAX_RECENCY {
            while state.recency.len() > TRUNCATED_RECENCY {
                let Some((_, dropped)) = state.recency.pop_first() else { break };
                if let Some(stats) = state.keys.get_mut(&dropped) {
                    stats.stamp = None;
                }
            }
        }
    }

    /// Drop every trace of `key`.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.write();
        if let Some(stamp) = state.keys.remove(key).and_then(|stats| stats.stamp) {
            state.recency.remove(&stamp);
        }
    }

    /// Drop every trace of each key in `keys`.
    pub fn forget_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for key in keys {
            if let Some(stamp) = state.keys.remove(key).and_then(|stats| stats.stamp) {
                state.recency.remove(&stamp);
            }
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.write();
        state.recency.clear();
        state.keys.clear();
    }

    /// Recorded access count; unseen keys report 0.
    pub fn frequency(&self, key: &str) -> u64 {
        self.state.read().keys.get(key).map_or(0, |stats| stats.frequency)
    }

    /// Position in the recency list (0 = most recent), if still tracked.
    pub fn recency_rank(&self, key: &str) -> Option<usize> {
        let state = self.state.read();
        let stamp = state.keys.get(key)?.stamp?;
        Some(state.recency.range(stamp + 1..).count())
    }

    /// Up to `n` keys, most recent first.
    pub fn most_recent(&self, n: usize) -> Vec<String> {
        self.state.read().recency.values().rev().take(n).cloned().collect()
    }

    /// Every key with a recorded frequency.
    pub fn keys(&self) -> Vec<String> {
        self.state.read().keys.keys().cloned().collect()
    }

    pub fn tracked_keys(&self) -> usize {
        self.state.read().keys.len()
    }

    pub fn recency_len(&self) -> usize {
        self.state.read().recency.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_moves_to_front() {
        let tracker = AccessTracker::new();
        tracker.record("a");
        tracker.record("b");
        tracker.record("a");

        assert_eq!(tracker.most_recent(2), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.frequency("a"), 2);
        assert_eq!(tracker.frequency("b"), 1);
        assert_eq!(tracker.frequency("never"), 0);
        assert_eq!(tracker.recency_len(), 2);
    }

    #[test]
    fn test_recency_truncated_on_overflow() {
        let tracker = AccessTracker::new();
        for i in 0..=MAX_RECENCY {
            tracker.record(&format!("k{i}"));
        }

        assert_eq!(tracker.recency_len(), TRUNCATED_RECENCY);
        // The newest key survives, the oldest is gone from the recency list.
        assert_eq!(tracker.recency_rank(&format!("k{MAX_RECENCY}")), Some(0));
        assert_eq!(tracker.recency_rank("k0"), None);
        // Frequencies are kept.
        assert_eq!(tracker.frequency("k0"), 1);
    }

    #[test]
    fn test_forget_and_reset() {
        let tracker = AccessTracker::new();
        tracker.record("a");
        tracker.record("b");

        tracker.forget("a");
        assert_eq!(tracker.frequency("a"), 0);
        assert_eq!(tracker.recency_rank("a"), None);
        assert_eq!(tracker.tracked_keys(), 1);

        tracker.reset();
        assert_eq!(tracker.tracked_keys(), 0);
        assert_eq!(tracker.recency_len(), 0);
    }

    #[test]
    fn test_repeated_access_keeps_one_recency_slot() {
        let tracker = AccessTracker::new();
        for _ in 0..100 {
            tracker.record("a");
            tracker.record("b");
        }
        tracker.record("c");

        assert_eq!(tracker.recency_len(), 3);
        assert_eq!(tracker.recency_rank("c"), Some(0));
        assert_eq!(tracker.recency_rank("b"), Some(1));
        assert_eq!(tracker.recency_rank("a"), Some(2));
        assert_eq!(tracker.frequency("a"), 100);
    }

    #[test]
    fn test_forget_all() {
        let tracker = AccessTracker::new();
        for key in ["a", "b", "c"] {
            tracker.record(key);
        }

        tracker.forget_all(["a", "c", "never"]);
        assert_eq!(tracker.keys(), vec!["b".to_string()]);
        assert_eq!(tracker.most_recent(5), vec!["b".to_string()]);
    }
}
