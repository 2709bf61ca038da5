//! Property-based tests for relay decisions
//!
//! Feeds random arrival sequences into a relay engine and checks the
//! forwarding invariants that keep floods finite.

use blehome_core::{
    Frame, FrameId, FrameKey, MeshAddress, MeshConfig, PayloadType, RelayEngine, Timestamp, Ttl,
};
use proptest::prelude::*;
use std::collections::HashSet;

const LOCAL: u16 = 10;

/// Arrival of a frame at the local node: (origin, id, destination, ttl, sender)
fn arb_arrival() -> impl Strategy<Value = (u16, u32, u16, u8, u16)> {
    (
        1u16..=6,
        0u32..8,
        prop_oneof![Just(LOCAL), Just(0xFFFF), 1u16..=6],
        0u8..=5,
        1u16..=6,
    )
}

fn engine() -> RelayEngine {
    let mut engine = RelayEngine::new(&MeshConfig::device(MeshAddress::new(LOCAL)).with_max_fan_out(3));
    for neighbor in 1u16..=6 {
        engine
            .neighbors_mut()
            .record_sighting(MeshAddress::new(neighbor), None, Timestamp::new(0));
    }
    engine
}

proptest! {
    /// Property: forwarded copies spend exactly one hop and never go back to sender or origin
    #[test]
    fn test_forwarding_respects_ttl_and_direction(arrivals in prop::collection::vec(arb_arrival(), 1..60)) {
        let mut relay = engine();
        for (step, (origin, id, destination, ttl, sender)) in arrivals.into_iter().enumerate() {
            let frame = Frame::new(
                FrameId::new(id),
                MeshAddress::new(origin),
                MeshAddress::new(destination),
                Ttl::new(ttl),
                PayloadType::SensorRelay,
                vec![1, 2, 3],
            ).expect("small payload");
            let outcome = relay.process(frame.clone(), Some(MeshAddress::new(sender)), Timestamp::new(step as u64));

            if let Some(forward) = outcome.forward {
                prop_assert!(ttl > 0);
                prop_assert_eq!(forward.frame.ttl.value(), ttl - 1);
                prop_assert_eq!(forward.frame.key(), frame.key());
                prop_assert!(!forward.targets.contains(&MeshAddress::new(sender)));
                prop_assert!(!forward.targets.contains(&frame.origin));
                prop_assert!(forward.targets.len() <= 3);
                prop_assert!(destination != LOCAL);
            }
        }
    }

    /// Property: each (origin, frame id) is handed to the consumer at most once
    #[test]
    fn test_consumption_happens_at_most_once(arrivals in prop::collection::vec(arb_arrival(), 1..60)) {
        let mut relay = engine();
        let mut delivered: HashSet<FrameKey> = HashSet::new();
        for (step, (origin, id, destination, ttl, sender)) in arrivals.into_iter().enumerate() {
            let frame = Frame::new(
                FrameId::new(id),
                MeshAddress::new(origin),
                MeshAddress::new(destination),
                Ttl::new(ttl),
                PayloadType::Command,
                Vec::new(),
            ).expect("empty payload");
            let outcome = relay.process(frame, Some(MeshAddress::new(sender)), Timestamp::new(step as u64));
            if let Some(frame) = outcome.deliver {
                prop_assert!(delivered.insert(frame.key()), "delivered {} twice", frame.key());
            }
        }
    }
}
