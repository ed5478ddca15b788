//! Sliding-window threshold state
//!
//! Counter map keyed by `(rule_id, aggregation key)`, shared across
//! cycles. Every key holds its own lock: the evict-then-compare-then-
//! reset sequence must never race for a single key, while distinct keys
//! stay independent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;

/// State held for one `(rule, aggregation key)` pair
#[derive(Debug, Default)]
struct KeyWindow {
    /// Timestamps of qualifying events, oldest first
    timestamps: VecDeque<DateTime<Utc>>,
    /// When this key last fired, if ever
    last_fire_at: Option<DateTime<Utc>>,
}

/// Result of recording one event against a key's window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowOutcome {
    /// Event counted; threshold not yet reached
    Accumulated { count: u32 },
    /// Threshold reached; the counter was reset and a new window starts
    /// accumulating from zero
    Fired { count: u32 },
}

/// Shared threshold counter store
pub struct ThresholdWindowStore {
    windows: DashMap<(u64, String), Arc<Mutex<KeyWindow>>>,
    /// How long to wait for a single key's lock before treating the
    /// event as a transient skip
    lock_timeout: StdDuration,
}

impl ThresholdWindowStore {
    pub fn new(lock_timeout: StdDuration) -> Self {
        Self {
            windows: DashMap::new(),
            lock_timeout,
        }
    }

    /// Record a qualifying event and apply the sliding window.
    ///
    /// Appends the event timestamp, evicts entries older than `window`
    /// relative to the newest timestamp, then fires and resets if the
    /// surviving count reaches `threshold`.
    pub fn record(
        &self,
        rule_id: u64,
        aggregation_key: &str,
        timestamp: DateTime<Utc>,
        window: Duration,
        threshold: u32,
    ) -> Result<WindowOutcome, EngineError> {
        let entry = self
            .windows
            .entry((rule_id, aggregation_key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(KeyWindow::default())))
            .clone();

        // Lock outside the map shard; a timeout leaves prior state intact
        let mut state = entry.try_lock_for(self.lock_timeout).ok_or_else(|| {
            EngineError::ResourceContention {
                rule_id,
                key: aggregation_key.to_string(),
            }
        })?;

        state.timestamps.push_back(timestamp);
        let newest = *state
            .timestamps
            .iter()
            .max()
            .expect("just pushed a timestamp");
        state.timestamps.retain(|ts| newest - *ts < window);

        let count = state.timestamps.len() as u32;
        if count >= threshold {
            state.timestamps.clear();
            state.last_fire_at = Some(newest);
            Ok(WindowOutcome::Fired { count })
        } else {
            Ok(WindowOutcome::Accumulated { count })
        }
    }

    /// When the key last fired, if ever
    pub fn last_fire_at(&self, rule_id: u64, aggregation_key: &str) -> Option<DateTime<Utc>> {
        self.windows
            .get(&(rule_id, aggregation_key.to_string()))
            .and_then(|entry| entry.lock().last_fire_at)
    }

    /// Drop keys idle longer than `max_idle` relative to `now`
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) {
        self.windows.retain(|_, entry| {
            let state = entry.lock();
            let latest = state
                .timestamps
                .back()
                .copied()
                .or(state.last_fire_at)
                .unwrap_or(now);
            now - latest < max_idle
        });
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for ThresholdWindowStore {
    fn default() -> Self {
        Self::new(StdDuration::from_millis(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_fires_on_threshold_inside_window() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(10);

        // 5 events spread across 9 minutes
        for i in 0..4 {
            let outcome = store
                .record(1, "admin|10.0.0.1", t0() + Duration::minutes(i * 2), window, 5)
                .unwrap();
            assert_eq!(outcome, WindowOutcome::Accumulated { count: i as u32 + 1 });
        }
        let outcome = store
            .record(1, "admin|10.0.0.1", t0() + Duration::minutes(9), window, 5)
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Fired { count: 5 });
    }

    #[test]
    fn test_does_not_fire_when_spread_exceeds_window() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(10);

        // 5 events across 11 minutes: by the 5th, the 1st has slid out
        for (i, offset) in [0i64, 3, 6, 9, 11].iter().enumerate() {
            let outcome = store
                .record(1, "k", t0() + Duration::minutes(*offset), window, 5)
                .unwrap();
            if i == 4 {
                assert_eq!(outcome, WindowOutcome::Accumulated { count: 4 });
            }
        }
    }

    #[test]
    fn test_counter_resets_after_firing() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(10);

        for i in 0..3 {
            store
                .record(1, "k", t0() + Duration::seconds(i * 10), window, 3)
                .unwrap();
        }
        // Fired on the 3rd; a 4th event alone must not re-fire
        let outcome = store
            .record(1, "k", t0() + Duration::seconds(40), window, 3)
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Accumulated { count: 1 });
        assert!(store.last_fire_at(1, "k").is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(5);

        store.record(1, "a", t0(), window, 2).unwrap();
        let outcome = store.record(1, "b", t0(), window, 2).unwrap();
        assert_eq!(outcome, WindowOutcome::Accumulated { count: 1 });

        let outcome = store
            .record(1, "a", t0() + Duration::seconds(5), window, 2)
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Fired { count: 2 });
    }

    #[test]
    fn test_rules_do_not_share_keys() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(5);

        store.record(1, "k", t0(), window, 2).unwrap();
        let outcome = store
            .record(2, "k", t0() + Duration::seconds(1), window, 2)
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Accumulated { count: 1 });
    }

    #[test]
    fn test_evict_idle_drops_stale_keys() {
        let store = ThresholdWindowStore::default();
        let window = Duration::minutes(10);

        store.record(1, "old", t0(), window, 5).unwrap();
        store
            .record(1, "fresh", t0() + Duration::hours(2), window, 5)
            .unwrap();

        store.evict_idle(t0() + Duration::hours(2), Duration::hours(1));
        assert_eq!(store.key_count(), 1);
    }
}
