//! Recently-seen frame cache
//!
//! Remembers `(origin, frame_id)` pairs for a bounded window so flooded
//! copies of a frame are consumed and relayed only once. Memory is bounded
//! by both age and count: entries older than the window are evicted lazily,
//! and when the cache is full the oldest entry makes room for the newest.

use hashbrown::HashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::DedupConfig;
use crate::types::{FrameKey, Timestamp};

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Keys checked against the cache
    pub frames_processed: u64,
    /// Keys that were already present
    pub duplicates_detected: u64,
    /// Entries dropped because of age
    pub expired: u64,
    /// Entries dropped because the cache was full
    pub displaced: u64,
}

impl DedupStats {
    pub fn duplicate_rate(&self) -> f64 {
        if self.frames_processed == 0 {
            0.0
        } else {
            self.duplicates_detected as f64 / self.frames_processed as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateCache {
    seen: HashMap<FrameKey, Timestamp>,
    order: VecDeque<(FrameKey, Timestamp)>,
    capacity: usize,
    window: Duration,
    stats: DedupStats,
}

impl DuplicateCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_bounds(config.capacity, config.window)
    }

    pub fn with_bounds(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            window,
            stats: DedupStats::default(),
        }
    }

    /// Record `key` and report whether it had already been seen
    pub fn check_and_insert(&mut self, key: FrameKey, now: Timestamp) -> bool {
        self.evict_expired(now);
        self.stats.frames_processed += 1;

        if self.seen.contains_key(&key) {
            self.stats.duplicates_detected += 1;
            return true;
        }

        self.insert_fresh(key, now);
        false
    }

    /// Remember `key` without counting it as a processed arrival
    pub fn insert(&mut self, key: FrameKey, now: Timestamp) {
        self.evict_expired(now);
        if !self.seen.contains_key(&key) {
            self.insert_fresh(key, now);
        }
    }

    pub fn contains(&self, key: &FrameKey, now: Timestamp) -> bool {
        self.seen
            .get(key)
            .map(|seen_at| now.duration_since(*seen_at) < self.window)
            .unwrap_or(false)
    }

    /// Drop every entry older than the window; returns how many went
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        let mut evicted = 0;
        while let Some((key, seen_at)) = self.order.front().copied() {
            if now.duration_since(seen_at) < self.window {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&key);
            evicted += 1;
        }
        self.stats.expired += evicted as u64;
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    fn insert_fresh(&mut self, key: FrameKey, now: Timestamp) {
        while self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
                self.stats.displaced += 1;
            }
        }
        self.seen.insert(key, now);
        self.order.push_back((key, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameId, MeshAddress};

    fn key(origin: u16, id: u32) -> FrameKey {
        FrameKey::new(MeshAddress::new(origin), FrameId::new(id))
    }

    #[test]
    fn test_second_sighting_is_a_duplicate() {
        let mut cache = DuplicateCache::with_bounds(8, Duration::from_secs(10));
        let now = Timestamp::new(0);
        assert!(!cache.check_and_insert(key(1, 42), now));
        assert!(cache.check_and_insert(key(1, 42), now));
        assert!(!cache.check_and_insert(key(2, 42), now));
        assert_eq!(cache.stats().duplicates_detected, 1);
        assert_eq!(cache.stats().frames_processed, 3);
    }

    #[test]
    fn test_entries_expire_after_the_window() {
        let mut cache = DuplicateCache::with_bounds(8, Duration::from_secs(10));
        cache.check_and_insert(key(1, 1), Timestamp::new(0));
        assert!(cache.contains(&key(1, 1), Timestamp::new(9_999)));
        assert!(!cache.contains(&key(1, 1), Timestamp::new(10_000)));
        assert!(!cache.check_and_insert(key(1, 1), Timestamp::new(10_000)));
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_full_cache_displaces_oldest() {
        let mut cache = DuplicateCache::with_bounds(2, Duration::from_secs(60));
        let now = Timestamp::new(0);
        cache.check_and_insert(key(1, 1), now);
        cache.check_and_insert(key(1, 2), now);
        cache.check_and_insert(key(1, 3), now);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(1, 1), now));
        assert!(cache.contains(&key(1, 3), now));
        assert_eq!(cache.stats().displaced, 1);
    }

    #[test]
    fn test_insert_does_not_count_as_arrival() {
        let mut cache = DuplicateCache::with_bounds(4, Duration::from_secs(60));
        cache.insert(key(7, 9), Timestamp::new(0));
        cache.insert(key(7, 9), Timestamp::new(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().frames_processed, 0);
        assert!(cache.check_and_insert(key(7, 9), Timestamp::new(2)));
    }
}
