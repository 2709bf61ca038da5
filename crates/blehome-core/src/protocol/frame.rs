//! Decoded mesh frame and the identifiers an originator stamps on it

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::types::{FrameId, FrameKey, MeshAddress, Ttl};

/// Largest payload a single frame may carry
pub const MAX_PAYLOAD_LEN: usize = 200;

// ----------------------------------------------------------------------------
// Payload Type
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    Command = 0x01,
    Ack = 0x02,
    SensorRelay = 0x03,
    Discovery = 0x04,
    StateReport = 0x05,
}

impl PayloadType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::SensorRelay),
            0x04 => Ok(Self::Discovery),
            0x05 => Ok(Self::StateReport),
            other => Err(FrameError::UnknownPayloadType(other)),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A mesh frame as the protocol layers see it.
///
/// The integrity tag is not stored here: it depends on the mutable TTL and is
/// recomputed by the codec whenever a frame is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub origin: MeshAddress,
    pub destination: MeshAddress,
    pub ttl: Ttl,
    pub sequence: u16,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, rejecting payloads that cannot fit on the wire
    pub fn new(
        frame_id: FrameId,
        origin: MeshAddress,
        destination: MeshAddress,
        ttl: Ttl,
        payload_type: PayloadType,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            frame_id,
            origin,
            destination,
            ttl,
            sequence: 0,
            payload_type,
            payload,
        })
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.origin, self.frame_id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Whether the node at `local` should consume this frame
    pub fn is_for(&self, local: MeshAddress) -> bool {
        self.destination == local || self.destination.is_broadcast()
    }

    /// Copy of this frame with one hop spent, or `None` when TTL is exhausted
    pub fn next_hop(&self) -> Option<Self> {
        let ttl = self.ttl.decrement()?;
        Some(Self {
            ttl,
            ..self.clone()
        })
    }
}

// ----------------------------------------------------------------------------
// Identifier Allocation
// ----------------------------------------------------------------------------

/// Monotonic frame id source for one originator.
///
/// Seeded randomly so a rebooted node does not replay ids still sitting in
/// its neighbors' dedup caches.
#[derive(Debug, Clone)]
pub struct FrameIdGenerator {
    next: u32,
}

impl FrameIdGenerator {
    pub fn random() -> Self {
        Self {
            next: rand::random(),
        }
    }

    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    pub fn next_id(&mut self) -> FrameId {
        let id = FrameId::new(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Wrapping sequence counter for originated frames
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn next_sequence(&mut self) -> u16 {
        let current = self.0;
        self.0 = self.0.wrapping_add(1);
        current
    }
}
