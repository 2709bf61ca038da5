//! Centralized Configuration Management
//!
//! Every tunable of a mesh node lives here. All structs deserialize with
//! defaults for missing fields so partial TOML files and environment
//! overrides layer cleanly on top of `MeshConfig::default()`.

use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::types::{MeshAddress, NodeRole, Ttl};

// ----------------------------------------------------------------------------
// Network Key
// ----------------------------------------------------------------------------

/// Length of the shared network key in bytes
pub const NETWORK_KEY_LEN: usize = 16;

/// Shared secret every node uses to seal and verify frame integrity tags
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkKey([u8; NETWORK_KEY_LEN]);

impl NetworkKey {
    /// Well-known key for development meshes; never use it for real installs
    pub const DEVELOPMENT: Self = Self(*b"BLEHome-dev-key!");

    pub fn new(bytes: [u8; NETWORK_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NETWORK_KEY_LEN] {
        &self.0
    }

    pub fn is_development(&self) -> bool {
        *self == Self::DEVELOPMENT
    }
}

impl Default for NetworkKey {
    fn default() -> Self {
        Self::DEVELOPMENT
    }
}

// Keys never show up in logs.
impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

impl FromStr for NetworkKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(clean).map_err(|e| ConfigError::InvalidNetworkKey {
            reason: e.to_string(),
        })?;
        let key: [u8; NETWORK_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|bytes: Vec<u8>| ConfigError::InvalidNetworkKey {
                    reason: format!("expected {} bytes, got {}", NETWORK_KEY_LEN, bytes.len()),
                })?;
        Ok(Self(key))
    }
}

impl TryFrom<String> for NetworkKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkKey> for String {
    fn from(key: NetworkKey) -> Self {
        hex::encode(key.0)
    }
}

// ----------------------------------------------------------------------------
// Deduplication Configuration
// ----------------------------------------------------------------------------

/// Bounds of the recently-seen frame cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum remembered frame keys; the oldest is evicted first
    pub capacity: usize,
    /// How long a frame key suppresses copies of the same frame
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            window: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Neighbor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborConfig {
    /// Neighbors silent for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// Hard cap on tracked neighbors; the weakest is replaced when full
    pub max_neighbors: usize,
    /// Neighbors below this quality score are not used as relay targets
    pub min_quality: f32,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            max_neighbors: 16,
            min_quality: 0.1,
        }
    }
}

// ----------------------------------------------------------------------------
// Link Configuration
// ----------------------------------------------------------------------------

/// Per-hop acknowledgement behaviour of a link session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Wait for a link ack before retransmitting on the same link
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Local retransmissions before the link is reported lost
    pub retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(300),
            retries: 2,
        }
    }
}

impl LinkConfig {
    /// Worst-case time one hop spends before giving up
    pub fn per_hop_budget(&self) -> Duration {
        self.ack_timeout * (self.retries + 1)
    }
}

// ----------------------------------------------------------------------------
// Command Configuration
// ----------------------------------------------------------------------------

/// End-to-end retry policy of the command coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Time to wait for an end-to-end ack before retransmitting
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Total transmissions of a command, the first one included
    pub max_attempts: u32,
    /// Longest path the timeout budget has to cover
    pub expected_hops: u32,
    /// Minimum spacing between repeated acks for the same command
    #[serde(with = "humantime_serde")]
    pub reack_holdoff: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(4),
            max_attempts: 3,
            expected_hops: 4,
            reack_holdoff: Duration::from_secs(1),
        }
    }
}

impl CommandConfig {
    /// Longest time a command can stay outstanding
    pub fn lifetime(&self) -> Duration {
        self.attempt_timeout * self.max_attempts
    }
}

// ----------------------------------------------------------------------------
// Discovery Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between one-hop presence beacons
    #[serde(with = "humantime_serde")]
    pub beacon_interval: Duration,
    /// Human readable name carried in beacons
    pub name: String,
    /// Capability bits advertised in beacons
    pub capabilities: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(10),
            name: "BLE".to_string(),
            capabilities: 0,
        }
    }
}

// ----------------------------------------------------------------------------
// BTHome Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BthomeConfig {
    /// Whether this node wraps BTHome advertisements it hears
    pub enabled: bool,
    /// Remembered (sensor, packet id) pairs used to skip repeated adverts
    pub replay_capacity: usize,
}

impl Default for BthomeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replay_capacity: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime Configuration
// ----------------------------------------------------------------------------

/// Channel sizes and timer cadence of the node task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How often timers (retries, eviction, beacons) are serviced
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Buffer of the node's inbound event channel
    pub event_buffer_size: usize,
    /// Buffer of the broadcast channel feeding subscribers
    pub mesh_event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            event_buffer_size: 256,
            mesh_event_buffer_size: 128,
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of one mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub address: MeshAddress,
    pub role: NodeRole,
    /// Where sensor relays and state reports are sent
    pub gateway: MeshAddress,
    pub network_key: NetworkKey,
    /// Hop budget for originated frames
    pub default_ttl: u8,
    /// Maximum neighbors a single frame is forwarded to
    pub max_fan_out: usize,
    pub dedup: DedupConfig,
    pub neighbors: NeighborConfig,
    pub link: LinkConfig,
    pub command: CommandConfig,
    pub discovery: DiscoveryConfig,
    pub bthome: BthomeConfig,
    pub runtime: RuntimeConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            address: MeshAddress::DEFAULT_GATEWAY,
            role: NodeRole::Gateway,
            gateway: MeshAddress::DEFAULT_GATEWAY,
            network_key: NetworkKey::default(),
            default_ttl: Ttl::DEFAULT.value(),
            max_fan_out: 3,
            dedup: DedupConfig::default(),
            neighbors: NeighborConfig::default(),
            link: LinkConfig::default(),
            command: CommandConfig::default(),
            discovery: DiscoveryConfig::default(),
            bthome: BthomeConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Gateway coordinator at `address`
    pub fn gateway(address: MeshAddress) -> Self {
        Self {
            address,
            role: NodeRole::Gateway,
            gateway: address,
            ..Self::default()
        }
    }

    /// Device answering on `address`, reporting to the default gateway
    pub fn device(address: MeshAddress) -> Self {
        Self {
            address,
            role: NodeRole::Device,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_gateway(mut self, gateway: MeshAddress) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_network_key(mut self, key: NetworkKey) -> Self {
        self.network_key = key;
        self
    }

    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_fan_out(mut self, fan_out: usize) -> Self {
        self.max_fan_out = fan_out;
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_command(mut self, command: CommandConfig) -> Self {
        self.command = command;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.discovery.name = name.into();
        self
    }

    pub fn ttl(&self) -> Ttl {
        Ttl::new(self.default_ttl)
    }

    /// Reject combinations the protocol cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.address.is_unicast() {
            return Err(ConfigError::invalid_value(
                "address",
                format!("{} is not a unicast address", self.address),
            ));
        }
        if !self.gateway.is_unicast() {
            return Err(ConfigError::invalid_value(
                "gateway",
                format!("{} is not a unicast address", self.gateway),
            ));
        }
        if self.default_ttl == 0 {
            return Err(ConfigError::invalid_value(
                "default_ttl",
                "frames need at least one hop",
            ));
        }
        if self.max_fan_out == 0 {
            return Err(ConfigError::invalid_value("max_fan_out", "must be at least 1"));
        }
        if self.dedup.capacity == 0 || self.dedup.window.is_zero() {
            return Err(ConfigError::invalid_value(
                "dedup",
                "capacity and window must be non-zero",
            ));
        }
        if self.neighbors.max_neighbors == 0 {
            return Err(ConfigError::invalid_value(
                "neighbors.max_neighbors",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.neighbors.min_quality) {
            return Err(ConfigError::invalid_value(
                "neighbors.min_quality",
                "must be within 0.0..=1.0",
            ));
        }
        if self.link.ack_timeout.is_zero() {
            return Err(ConfigError::invalid_value("link.ack_timeout", "must be non-zero"));
        }
        if self.command.max_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "command.max_attempts",
                "must be at least 1",
            ));
        }

        let path_budget = self.link.per_hop_budget() * self.command.expected_hops;
        if self.command.attempt_timeout <= path_budget {
            return Err(ConfigError::invalid_value(
                "command.attempt_timeout",
                format!(
                    "{:?} does not exceed {} hops x {:?} per hop",
                    self.command.attempt_timeout,
                    self.command.expected_hops,
                    self.link.per_hop_budget()
                ),
            ));
        }

        // A retransmission must not execute twice. Relays that carried the
        // first copy drop it as a duplicate too, so a lost ack is only
        // recovered by re-ack when the destination is a direct neighbor.
        if self.dedup.window < self.command.lifetime() {
            return Err(ConfigError::invalid_value(
                "dedup.window",
                format!(
                    "{:?} is shorter than the command lifetime {:?}",
                    self.dedup.window,
                    self.command.lifetime()
                ),
            ));
        }

        if self.runtime.tick_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "runtime.tick_interval",
                "must be non-zero",
            ));
        }
        if self.discovery.name.len() > crate::protocol::payload::MAX_NAME_LEN {
            return Err(ConfigError::invalid_value(
                "discovery.name",
                format!(
                    "longer than {} bytes",
                    crate::protocol::payload::MAX_NAME_LEN
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        MeshConfig::default().validate().unwrap();
        MeshConfig::device(MeshAddress::new(7)).validate().unwrap();
    }

    #[test]
    fn test_attempt_timeout_must_cover_the_path() {
        let config = MeshConfig::default().with_command(CommandConfig {
            attempt_timeout: Duration::from_millis(500),
            ..CommandConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "command.attempt_timeout",
                ..
            }
        ));
    }

    #[test]
    fn test_dedup_window_must_outlive_commands() {
        let mut config = MeshConfig::default();
        config.dedup.window = Duration::from_secs(5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "dedup.window",
                ..
            })
        ));
    }

    #[test]
    fn test_broadcast_cannot_be_a_node_address() {
        let config = MeshConfig::device(MeshAddress::BROADCAST);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_key_parses_hex() {
        let key: NetworkKey = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(key.as_bytes()[15], 0x0f);
        assert!("0011".parse::<NetworkKey>().is_err());
        assert!(NetworkKey::default().is_development());
        assert_eq!(format!("{:?}", key), "NetworkKey(..)");
    }

    #[test]
    fn test_builder_methods_apply() {
        let config = MeshConfig::device(MeshAddress::new(9))
            .with_gateway(MeshAddress::new(2))
            .with_default_ttl(6)
            .with_max_fan_out(2)
            .with_name("porch");
        assert_eq!(config.gateway, MeshAddress::new(2));
        assert_eq!(config.ttl(), Ttl::new(6));
        assert_eq!(config.max_fan_out, 2);
        assert_eq!(config.discovery.name, "porch");
    }
}
