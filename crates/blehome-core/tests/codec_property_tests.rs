//! Property-based tests for the frame codec
//!
//! These check that arbitrary input never panics the decoder, that any
//! single corrupted bit is caught, and that valid frames survive the wire.

use blehome_core::{
    protocol::wire::{HEADER_LEN, TAG_LEN},
    Frame, FrameError, FrameId, MeshAddress, NetworkKey, PayloadType, Ttl, WireFormat,
    MAX_PAYLOAD_LEN,
};
use proptest::prelude::*;

fn codec() -> WireFormat {
    WireFormat::new(NetworkKey::default())
}

/// Generate arbitrary mesh address, broadcast included
fn arb_address() -> impl Strategy<Value = MeshAddress> {
    any::<u16>().prop_map(MeshAddress::new)
}

fn arb_payload_type() -> impl Strategy<Value = PayloadType> {
    prop_oneof![
        Just(PayloadType::Command),
        Just(PayloadType::Ack),
        Just(PayloadType::SensorRelay),
        Just(PayloadType::Discovery),
        Just(PayloadType::StateReport),
    ]
}

/// Generate arbitrary well-formed frame
fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        any::<u32>(),
        arb_address(),
        arb_address(),
        any::<u8>(),
        any::<u16>(),
        arb_payload_type(),
        prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
    )
        .prop_map(|(id, origin, destination, ttl, sequence, payload_type, payload)| Frame {
            frame_id: FrameId::new(id),
            origin,
            destination,
            ttl: Ttl::new(ttl),
            sequence,
            payload_type,
            payload,
        })
}

proptest! {
    /// Property: decoding arbitrary bytes returns an error or a frame, never panics
    #[test]
    fn test_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..300)) {
        let _ = codec().decode(&bytes);
        let _ = WireFormat::decode_link_ack(&bytes);
    }

    /// Property: a valid frame decodes to exactly what was encoded
    #[test]
    fn test_valid_frames_survive_the_wire(frame in arb_frame()) {
        let bytes = codec().encode(&frame).expect("frame within limits");
        prop_assert_eq!(bytes.len(), HEADER_LEN + frame.payload.len() + TAG_LEN);
        prop_assert_eq!(codec().decode(&bytes).expect("valid frame"), frame);
    }

    /// Property: flipping any single bit makes the frame unacceptable
    #[test]
    fn test_single_bit_corruption_is_rejected(frame in arb_frame(), position in any::<prop::sample::Index>(), bit in 0u8..8) {
        let mut bytes = codec().encode(&frame).expect("frame within limits");
        let index = position.index(bytes.len());
        bytes[index] ^= 1 << bit;
        prop_assert!(codec().decode(&bytes).is_err());
    }

    /// Property: frames sealed under another key never verify
    #[test]
    fn test_foreign_key_is_rejected(frame in arb_frame(), key in any::<[u8; 16]>()) {
        prop_assume!(key != *NetworkKey::default().as_bytes());
        let foreign = WireFormat::new(NetworkKey::new(key));
        let bytes = foreign.encode(&frame).expect("frame within limits");
        prop_assert_eq!(codec().decode(&bytes), Err(FrameError::IntegrityMismatch));
    }
}
