//! Flooding relay engine
//!
//! Decides, for every frame that arrives on a link, whether this node
//! consumes it, forwards it, or drops it. The engine owns the node's
//! duplicate cache and neighbor table and performs no I/O: callers hand it a
//! frame plus the time and get back a `RelayOutcome` describing what to do.
//!
//! Decision order for an arriving frame:
//! 1. seen before (same origin and frame id) -> drop as duplicate
//! 2. originated here and echoed back -> drop
//! 3. addressed to this node or broadcast -> hand to the local consumer
//! 4. unicast for this node, or TTL exhausted -> stop
//! 5. otherwise spend one hop and forward to the best healthy neighbors,
//!    never back to the sender or the origin

use serde::Serialize;
use smallvec::SmallVec;

use crate::config::MeshConfig;
use crate::protocol::dedup::{DedupStats, DuplicateCache};
use crate::protocol::frame::Frame;
use crate::protocol::neighbor::NeighborTable;
use crate::types::{MeshAddress, Timestamp};

/// Neighbors a single frame is sent to
pub type RelayTargets = SmallVec<[MeshAddress; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// Copy of a frame already handled
    Duplicate,
    /// TTL exhausted before the frame could be forwarded
    Expired,
    /// No eligible neighbor to forward to
    NoNeighbors,
    /// Our own frame came back through the mesh
    OwnFrame,
}

/// Forwarding instruction: transmit `frame` on each target link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub frame: Frame,
    pub targets: RelayTargets,
}

/// What the node should do with one received frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Frame for the local consumer
    pub deliver: Option<Frame>,
    /// Relay instruction
    pub forward: Option<Forward>,
    /// Why relaying stopped here, if it did
    pub dropped: Option<DropReason>,
}

impl RelayOutcome {
    fn dropped(reason: DropReason) -> Self {
        Self {
            dropped: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.dropped == Some(DropReason::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames_received: u64,
    pub frames_delivered: u64,
    pub frames_forwarded: u64,
    pub frames_originated: u64,
    pub duplicates_dropped: u64,
    pub expired_dropped: u64,
    pub isolated_dropped: u64,
    pub own_dropped: u64,
}

#[derive(Debug, Clone)]
pub struct RelayEngine {
    local: MeshAddress,
    max_fan_out: usize,
    dedup: DuplicateCache,
    neighbors: NeighborTable,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            local: config.address,
            max_fan_out: config.max_fan_out.max(1),
            dedup: DuplicateCache::new(&config.dedup),
            neighbors: NeighborTable::new(&config.neighbors),
            stats: RelayStats::default(),
        }
    }

    pub fn local_address(&self) -> MeshAddress {
        self.local
    }

    /// Decide the fate of `frame`, received from neighbor `from`
    pub fn process(&mut self, frame: Frame, from: Option<MeshAddress>, now: Timestamp) -> RelayOutcome {
        self.stats.frames_received += 1;
        self.neighbors.evict_stale(now);

        if self.dedup.check_and_insert(frame.key(), now) {
            self.stats.duplicates_dropped += 1;
            tracing::trace!(key = %frame.key(), "duplicate frame dropped");
            return RelayOutcome::dropped(DropReason::Duplicate);
        }

        if frame.origin == self.local {
            self.stats.own_dropped += 1;
            return RelayOutcome::dropped(DropReason::OwnFrame);
        }

        let mut outcome = RelayOutcome::default();
        if frame.is_for(self.local) {
            self.stats.frames_delivered += 1;
            outcome.deliver = Some(frame.clone());
            if !frame.is_broadcast() {
                return outcome;
            }
        }

        let Some(next) = frame.next_hop() else {
            self.stats.expired_dropped += 1;
            tracing::trace!(key = %frame.key(), "ttl exhausted, not relaying");
            outcome.dropped = Some(DropReason::Expired);
            return outcome;
        };

        let targets = self.select_targets(&next, from, now);
        if targets.is_empty() {
            self.stats.isolated_dropped += 1;
            tracing::debug!(key = %frame.key(), "no eligible neighbors, relay stops here");
            outcome.dropped = Some(DropReason::NoNeighbors);
            return outcome;
        }

        self.stats.frames_forwarded += 1;
        outcome.forward = Some(Forward {
            frame: next,
            targets,
        });
        outcome
    }

    /// Register a locally built frame and pick its first-hop targets.
    ///
    /// Also used for retransmissions: the frame keeps its id, so echoes of
    /// any earlier copy are still recognised as duplicates.
    pub fn originate(&mut self, frame: &Frame, now: Timestamp) -> RelayTargets {
        self.stats.frames_originated += 1;
        self.neighbors.evict_stale(now);
        self.dedup.insert(frame.key(), now);
        self.select_targets(frame, None, now)
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn neighbors_mut(&mut self) -> &mut NeighborTable {
        &mut self.neighbors
    }

    /// Age out cache entries and silent neighbors; returns evicted neighbors
    pub fn evict_expired(&mut self, now: Timestamp) -> Vec<MeshAddress> {
        self.dedup.evict_expired(now);
        self.neighbors.evict_stale(now)
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    fn select_targets(&self, frame: &Frame, from: Option<MeshAddress>, now: Timestamp) -> RelayTargets {
        let mut candidates = self.neighbors.healthy_neighbors(now);
        candidates.retain(|peer| Some(*peer) != from && *peer != frame.origin);

        // A destination we can reach directly always makes the cut.
        if let Some(position) = candidates.iter().position(|peer| *peer == frame.destination) {
            let destination = candidates.remove(position);
            candidates.insert(0, destination);
        }

        candidates.into_iter().take(self.max_fan_out).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::PayloadType;
    use crate::types::{FrameId, Ttl};

    fn addr(value: u16) -> MeshAddress {
        MeshAddress::new(value)
    }

    fn engine(local: u16, neighbors: &[u16]) -> RelayEngine {
        let config = MeshConfig::device(addr(local)).with_max_fan_out(2);
        let mut engine = RelayEngine::new(&config);
        for neighbor in neighbors {
            engine
                .neighbors_mut()
                .record_sighting(addr(*neighbor), None, Timestamp::new(0));
        }
        engine
    }

    fn frame(origin: u16, destination: MeshAddress, ttl: u8) -> Frame {
        Frame::new(
            FrameId::new(42),
            addr(origin),
            destination,
            Ttl::new(ttl),
            PayloadType::Command,
            vec![0x82, 0x01],
        )
        .unwrap()
    }

    #[test]
    fn test_unicast_for_self_is_consumed_not_relayed() {
        let mut relay = engine(3, &[1, 2, 4]);
        let outcome = relay.process(frame(1, addr(3), 4), Some(addr(1)), Timestamp::new(0));
        assert!(outcome.deliver.is_some());
        assert!(outcome.forward.is_none());
        assert_eq!(outcome.dropped, None);
    }

    #[test]
    fn test_second_copy_is_a_duplicate() {
        let mut relay = engine(3, &[1, 2]);
        let now = Timestamp::new(0);
        relay.process(frame(1, addr(3), 4), Some(addr(1)), now);
        let outcome = relay.process(frame(1, addr(3), 4), Some(addr(2)), now);
        assert!(outcome.is_duplicate());
        assert!(outcome.deliver.is_none());
        assert_eq!(relay.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_transit_frame_is_forwarded_with_one_less_hop() {
        let mut relay = engine(2, &[1, 3]);
        let outcome = relay.process(frame(1, addr(3), 4), Some(addr(1)), Timestamp::new(0));
        assert!(outcome.deliver.is_none());
        let forward = outcome.forward.unwrap();
        assert_eq!(forward.frame.ttl, Ttl::new(3));
        assert_eq!(forward.targets.as_slice(), &[addr(3)]);
    }

    #[test]
    fn test_broadcast_is_consumed_and_relayed() {
        let mut relay = engine(2, &[1, 3, 4]);
        let outcome = relay.process(
            frame(1, MeshAddress::BROADCAST, 2),
            Some(addr(1)),
            Timestamp::new(0),
        );
        assert!(outcome.deliver.is_some());
        let forward = outcome.forward.unwrap();
        assert_eq!(forward.targets.len(), 2);
        assert!(!forward.targets.contains(&addr(1)));
    }

    #[test]
    fn test_zero_ttl_is_never_relayed() {
        let mut relay = engine(2, &[1, 3]);
        let outcome = relay.process(frame(1, addr(3), 0), Some(addr(1)), Timestamp::new(0));
        assert_eq!(outcome.dropped, Some(DropReason::Expired));
        assert!(outcome.forward.is_none());

        let mut relay = engine(3, &[1]);
        let outcome = relay.process(frame(1, addr(3), 0), Some(addr(1)), Timestamp::new(0));
        assert!(outcome.deliver.is_some());
    }

    #[test]
    fn test_isolated_node_drops_without_error() {
        let mut relay = engine(2, &[1]);
        let outcome = relay.process(frame(1, addr(9), 4), Some(addr(1)), Timestamp::new(0));
        assert_eq!(outcome.dropped, Some(DropReason::NoNeighbors));
        assert_eq!(relay.stats().isolated_dropped, 1);
    }

    #[test]
    fn test_own_frames_echoed_back_are_dropped() {
        let mut relay = engine(1, &[2]);
        let own = frame(1, addr(3), 4);
        let targets = relay.originate(&own, Timestamp::new(0));
        assert_eq!(targets.as_slice(), &[addr(2)]);
        let outcome = relay.process(own, Some(addr(2)), Timestamp::new(10));
        assert!(outcome.is_duplicate());
    }

    #[test]
    fn test_reachable_destination_is_always_targeted() {
        let mut relay = engine(2, &[5, 6, 9]);
        relay
            .neighbors_mut()
            .record_sighting(addr(5), Some(-40), Timestamp::new(0));
        relay
            .neighbors_mut()
            .record_sighting(addr(6), Some(-40), Timestamp::new(0));
        relay
            .neighbors_mut()
            .record_sighting(addr(9), Some(-95), Timestamp::new(0));
        let outcome = relay.process(frame(1, addr(9), 4), Some(addr(1)), Timestamp::new(0));
        let forward = outcome.forward.unwrap();
        assert_eq!(forward.targets[0], addr(9));
        assert_eq!(forward.targets.len(), 2);
    }
}
