//! Core types for the BLEHome mesh protocol
//!
//! Newtypes for addresses, frame identifiers and hop limits, plus the time
//! abstraction every sans-IO component is driven by.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Mesh Address
// ----------------------------------------------------------------------------

/// 16-bit node address inside the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeshAddress(u16);

impl MeshAddress {
    /// Address every node consumes
    pub const BROADCAST: Self = Self(0xFFFF);

    /// Address of a node that has not been provisioned yet
    pub const UNASSIGNED: Self = Self(0x0000);

    /// Address the gateway coordinator answers on unless configured otherwise
    pub const DEFAULT_GATEWAY: Self = Self(0x0001);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_broadcast() && *self != Self::UNASSIGNED
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for MeshAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex_digits) => u16::from_str_radix(hex_digits, 16),
            None => trimmed.parse::<u16>(),
        };
        parsed.map(Self).map_err(|_| ConfigError::InvalidAddress {
            value: s.to_string(),
        })
    }
}

impl TryFrom<String> for MeshAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MeshAddress> for String {
    fn from(address: MeshAddress) -> Self {
        address.to_string()
    }
}

impl From<u16> for MeshAddress {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Frame Identifier
// ----------------------------------------------------------------------------

/// Per-origin frame identifier, reused verbatim by retransmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(u32);

impl FrameId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for FrameId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Dedup identity of a frame: who originated it and which id it carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameKey {
    pub origin: MeshAddress,
    pub frame_id: FrameId,
}

impl FrameKey {
    pub fn new(origin: MeshAddress, frame_id: FrameId) -> Self {
        Self { origin, frame_id }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.frame_id)
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live (TTL)
// ----------------------------------------------------------------------------

/// Remaining relay hops for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Hop budget for frames originated without an explicit TTL
    pub const DEFAULT: Self = Self(4);

    /// Frames with this TTL may be consumed but are never relayed
    pub const ZERO: Self = Self(0);

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        self.0 == 0
    }

    /// Spend one hop; `None` once the budget is gone
    pub fn decrement(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Node Role
// ----------------------------------------------------------------------------

/// What a node does in the mesh besides relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Host-side coordinator that issues commands and collects readings
    Gateway,
    /// Controllable endpoint (light, switch) that executes commands
    Device,
    /// Pure relay that only forwards traffic
    Relay,
    /// Node that also listens for BTHome advertisements and bridges them
    Bridge,
}

impl NodeRole {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Gateway => 0,
            Self::Device => 1,
            Self::Relay => 2,
            Self::Bridge => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Gateway),
            1 => Some(Self::Device),
            2 => Some(Self::Relay),
            3 => Some(Self::Bridge),
            _ => None,
        }
    }

    pub fn executes_commands(self) -> bool {
        matches!(self, Self::Device | Self::Bridge)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gateway => "gateway",
            Self::Device => "device",
            Self::Relay => "relay",
            Self::Bridge => "bridge",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp from whatever clock drives the component
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, saturating at zero
    pub fn duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.duration_since(rhs)
    }
}

// ----------------------------------------------------------------------------
// Time Sources
// ----------------------------------------------------------------------------

/// Clock abstraction so protocol state machines can run under a fake clock
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(elapsed.as_millis() as u64)
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_address_parses_hex_and_decimal() {
        assert_eq!("0x0003".parse::<MeshAddress>().unwrap(), MeshAddress::new(3));
        assert_eq!("42".parse::<MeshAddress>().unwrap(), MeshAddress::new(42));
        assert_eq!("0xffff".parse::<MeshAddress>().unwrap(), MeshAddress::BROADCAST);
        assert!("0x1ffff".parse::<MeshAddress>().is_err());
        assert!("gateway".parse::<MeshAddress>().is_err());
    }

    #[test]
    fn test_mesh_address_display_round_trips() {
        let address = MeshAddress::new(0x0a0b);
        assert_eq!(address.to_string(), "0x0a0b");
        assert_eq!(address.to_string().parse::<MeshAddress>().unwrap(), address);
    }

    #[test]
    fn test_broadcast_is_not_unicast() {
        assert!(MeshAddress::BROADCAST.is_broadcast());
        assert!(!MeshAddress::BROADCAST.is_unicast());
        assert!(!MeshAddress::UNASSIGNED.is_unicast());
        assert!(MeshAddress::DEFAULT_GATEWAY.is_unicast());
    }

    #[test]
    fn test_ttl_decrement_stops_at_zero() {
        let ttl = Ttl::new(1);
        let next = ttl.decrement().unwrap();
        assert!(next.is_expired());
        assert_eq!(next.decrement(), None);
    }

    #[test]
    fn test_manual_time_source_advances() {
        let clock = ManualTimeSource::new(Timestamp::new(1_000));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp::new(1_250));
        assert_eq!(clock.now() - Timestamp::new(1_000), Duration::from_millis(250));
        assert_eq!(Timestamp::new(5).duration_since(Timestamp::new(10)), Duration::ZERO);
    }

    #[test]
    fn test_node_role_byte_mapping() {
        for role in [NodeRole::Gateway, NodeRole::Device, NodeRole::Relay, NodeRole::Bridge] {
            assert_eq!(NodeRole::from_byte(role.to_byte()), Some(role));
        }
        assert_eq!(NodeRole::from_byte(9), None);
    }
}
