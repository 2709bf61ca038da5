//! BLEHome Runtime
//!
//! Runs mesh nodes on tokio:
//! - `NodeBuilder` / `MeshHandle`: spawn a node and talk to it
//! - `LinkSession`: link-local acks, retries and radio serialization
//! - `LoopbackLink` and `MeshSimulation`: in-memory links and topologies
//!
//! Protocol decisions live in `blehome-core`; this crate only moves bytes
//! and time around them.

pub mod builder;
pub mod clock;
pub mod executor;
pub mod handle;
pub mod link;
pub mod loopback;
mod node;
pub mod registry;
pub mod simulation;

pub use builder::NodeBuilder;
pub use clock::TokioTimeSource;
pub use executor::{CommandExecutor, LightExecutor};
pub use handle::{CommandCanceller, MeshEvent, MeshHandle, NodeStats, PendingCommand};
pub use link::{LinkSession, LinkStats};
pub use loopback::{loopback_pair, LoopbackLink};
pub use registry::{DeviceRecord, DeviceRegistry, RegistryUpdate};
pub use simulation::MeshSimulation;

pub use blehome_core::{
    BlehomeError, BthomeAdvertisement, CommandOutcome, CommandPayload, CommandReceipt,
    DeviceState, FrameId, MeshAddress, MeshConfig, NodeRole, Result, SensorReading,
};
