//! BLEHome Core Protocol Implementation
//!
//! Sans-IO building blocks of the BLEHome mesh: the frame codec, duplicate
//! suppression, neighbor tracking, the flooding relay engine, end-to-end
//! command coordination and BTHome bridging. Runtimes drive these with a
//! clock and a set of `GattLink`s.

pub mod config;
pub mod errors;
pub mod link;
pub mod protocol;
pub mod types;

pub use config::{
    BthomeConfig, CommandConfig, DedupConfig, DiscoveryConfig, LinkConfig, MeshConfig,
    NeighborConfig, NetworkKey, RuntimeConfig,
};
pub use errors::{BlehomeError, ConfigError, FrameError, LinkError, Result};
pub use link::{AckOutcome, GattLink};
pub use protocol::*;
pub use types::{
    FrameId, FrameKey, ManualTimeSource, MeshAddress, NodeRole, SystemTimeSource, TimeSource,
    Timestamp, Ttl,
};
