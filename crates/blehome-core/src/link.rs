//! Link Trait Definition
//!
//! Defines the interface a point-to-point radio link exposes to the mesh.
//! Concrete implementations live in their respective crates: the BLE GATT
//! link in `blehome-ble`, in-memory loopback links in `blehome-runtime`.

use crate::errors::LinkError;
use crate::types::MeshAddress;

// ----------------------------------------------------------------------------
// Link Outcomes
// ----------------------------------------------------------------------------

/// Result of handing one frame to a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The neighbor confirmed receipt with a link ack
    Acked,
    /// No link ack arrived in time for this attempt
    TimedOut,
    /// The link went away, or stayed silent through every retry
    LinkLost,
}

impl AckOutcome {
    pub fn is_acked(self) -> bool {
        matches!(self, Self::Acked)
    }
}

// ----------------------------------------------------------------------------
// Gatt Link Trait
// ----------------------------------------------------------------------------

/// A bidirectional byte pipe to exactly one neighbor.
///
/// Writes carry whole frames or link acks; a link never splits or merges
/// them. `recv` yields inbound buffers in arrival order and returns `None`
/// once the link is gone for good.
#[async_trait::async_trait]
pub trait GattLink: Send + Sync {
    /// Mesh address of the node on the other end
    fn peer(&self) -> MeshAddress;

    fn is_connected(&self) -> bool;

    /// Transmit one buffer; must not interleave with other writes
    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Next inbound buffer, `None` when the link is closed
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Signal strength of the most recent inbound traffic, if known
    fn rssi(&self) -> Option<i16> {
        None
    }
}
