//! Mesh protocol state machines and wire formats
//!
//! Everything in here is sans-IO: components take decoded frames and the
//! current time, and return decisions for the runtime to act on.

pub mod bthome;
pub mod coordinator;
pub mod dedup;
pub mod frame;
pub mod neighbor;
pub mod payload;
pub mod relay;
pub mod wire;

pub use bthome::{
    parse_measurements, BthomeAdvertisement, BthomeBridge, Measurement, MeasurementKind,
    SensorReading, BTHOME_SERVICE_UUID16,
};
pub use coordinator::{
    AckLedger, AckResolution, CommandCoordinator, CommandOutcome, CommandReceipt,
    CoordinatorAction, CoordinatorStats, OutstandingCommand,
};
pub use dedup::{DedupStats, DuplicateCache};
pub use frame::{Frame, FrameIdGenerator, PayloadType, SequenceCounter, MAX_PAYLOAD_LEN};
pub use neighbor::{LinkQuality, NeighborEntry, NeighborTable};
pub use payload::{AckPayload, AckStatus, CommandPayload, DeviceState, DiscoveryBeacon};
pub use relay::{DropReason, Forward, RelayEngine, RelayOutcome, RelayStats, RelayTargets};
pub use wire::{WireFormat, WireKind, LINK_ACK_LEN, MAX_FRAME_LEN};
