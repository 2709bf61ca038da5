//! One-hop neighbor tracking
//!
//! Every node keeps its own view of the peers it can reach directly. Entries
//! are refreshed by received traffic and link outcomes, scored by signal and
//! delivery history, and dropped once they go quiet. The relay engine asks
//! this table for ranked forwarding targets.

use hashbrown::HashMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::time::Duration;

use crate::config::NeighborConfig;
use crate::types::{MeshAddress, Timestamp};

/// Weight of the newest sample in the moving averages
const EMA_ALPHA: f32 = 0.3;

// ----------------------------------------------------------------------------
// Link Quality
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkQuality {
    /// Smoothed RSSI in dBm, if the link reports one
    pub rssi: Option<f32>,
    /// Smoothed share of transmissions that were link-acked
    pub delivery_ratio: f32,
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self {
            rssi: None,
            delivery_ratio: 1.0,
        }
    }
}

impl LinkQuality {
    pub fn observe_rssi(&mut self, rssi: i16) {
        let sample = f32::from(rssi);
        self.rssi = Some(match self.rssi {
            Some(current) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * current,
            None => sample,
        });
    }

    pub fn observe_delivery(&mut self, delivered: bool) {
        let sample = if delivered { 1.0 } else { 0.0 };
        self.delivery_ratio = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.delivery_ratio;
    }

    /// Score in `0.0..=1.0`, higher is better
    pub fn score(&self) -> f32 {
        match self.rssi {
            // -100 dBm maps to 0, -40 dBm to 1
            Some(rssi) => {
                let signal = ((rssi + 100.0) / 60.0).clamp(0.0, 1.0);
                0.4 * signal + 0.6 * self.delivery_ratio
            }
            None => self.delivery_ratio,
        }
    }
}

// ----------------------------------------------------------------------------
// Neighbor Entry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NeighborEntry {
    pub address: MeshAddress,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub quality: LinkQuality,
    pub frames_received: u64,
}

impl NeighborEntry {
    fn new(address: MeshAddress, now: Timestamp) -> Self {
        Self {
            address,
            first_seen: now,
            last_seen: now,
            quality: LinkQuality::default(),
            frames_received: 0,
        }
    }

    pub fn is_stale(&self, now: Timestamp, stale_after: Duration) -> bool {
        now.duration_since(self.last_seen) > stale_after
    }
}

// ----------------------------------------------------------------------------
// Neighbor Table
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NeighborTable {
    entries: HashMap<MeshAddress, NeighborEntry>,
    stale_after: Duration,
    max_neighbors: usize,
    min_quality: f32,
}

impl NeighborTable {
    pub fn new(config: &NeighborConfig) -> Self {
        Self {
            entries: HashMap::new(),
            stale_after: config.stale_after,
            max_neighbors: config.max_neighbors.max(1),
            min_quality: config.min_quality,
        }
    }

    /// Note that `address` was heard from directly
    pub fn record_sighting(&mut self, address: MeshAddress, rssi: Option<i16>, now: Timestamp) {
        let entry = self.entry_mut(address, now);
        entry.last_seen = now;
        entry.frames_received += 1;
        if let Some(rssi) = rssi {
            entry.quality.observe_rssi(rssi);
        }
    }

    /// Fold a link-level delivery result into the neighbor's score
    pub fn record_link_outcome(&mut self, address: MeshAddress, delivered: bool, now: Timestamp) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.quality.observe_delivery(delivered);
            if delivered {
                entry.last_seen = now;
            }
        }
    }

    pub fn remove(&mut self, address: MeshAddress) -> Option<NeighborEntry> {
        self.entries.remove(&address)
    }

    /// Drop neighbors that have been silent too long
    pub fn evict_stale(&mut self, now: Timestamp) -> Vec<MeshAddress> {
        let stale_after = self.stale_after;
        let stale: Vec<MeshAddress> = self
            .entries
            .values()
            .filter(|entry| entry.is_stale(now, stale_after))
            .map(|entry| entry.address)
            .collect();
        for address in &stale {
            self.entries.remove(address);
        }
        stale
    }

    /// Fresh neighbors above the quality floor, best first
    pub fn healthy_neighbors(&self, now: Timestamp) -> Vec<MeshAddress> {
        let mut healthy: Vec<&NeighborEntry> = self
            .entries
            .values()
            .filter(|entry| {
                !entry.is_stale(now, self.stale_after) && entry.quality.score() >= self.min_quality
            })
            .collect();
        healthy.sort_by(|a, b| {
            b.quality
                .score()
                .partial_cmp(&a.quality.score())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.address.cmp(&b.address))
        });
        healthy.into_iter().map(|entry| entry.address).collect()
    }

    pub fn is_healthy(&self, address: MeshAddress, now: Timestamp) -> bool {
        self.entries
            .get(&address)
            .map(|entry| {
                !entry.is_stale(now, self.stale_after) && entry.quality.score() >= self.min_quality
            })
            .unwrap_or(false)
    }

    pub fn get(&self, address: &MeshAddress) -> Option<&NeighborEntry> {
        self.entries.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, address: MeshAddress, now: Timestamp) -> &mut NeighborEntry {
        if !self.entries.contains_key(&address) && self.entries.len() >= self.max_neighbors {
            self.evict_least_recent();
        }
        self.entries
            .entry(address)
            .or_insert_with(|| NeighborEntry::new(address, now))
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|entry| entry.last_seen)
            .map(|entry| entry.address);
        if let Some(address) = oldest {
            tracing::debug!(%address, "neighbor table full, evicting least recent");
            self.entries.remove(&address);
        }
    }
}
