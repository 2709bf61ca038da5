//! BLE link configuration

use std::time::Duration;

use blehome_core::MeshAddress;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BleLinkError;
use crate::protocol::{
    parse_mac, BLEHOME_NOTIFY_CHARACTERISTIC_UUID, BLEHOME_SERVICE_UUID,
    BLEHOME_WRITE_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the GATT link to a BLEHome gateway device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleLinkConfig {
    /// Advertised name prefix of gateway devices
    pub device_name_prefix: String,
    /// Connect to this MAC instead of the first matching name
    pub gateway_mac: Option<String>,
    /// Mesh address of the device on the other end of the link
    pub peer_address: MeshAddress,
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    /// How long to scan for a gateway before giving up
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    /// Connect timeout of the first attempt; later attempts get longer
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Connection attempts before giving up, 0 for unlimited
    pub max_connect_attempts: u32,
    /// Interval between heartbeat commands on an idle link
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Whether to automatically reconnect on disconnection
    pub auto_reconnect: bool,
    /// Forward BTHome advertisements heard during scanning into the mesh
    pub bridge_bthome: bool,
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: "BLE".to_string(),
            gateway_mac: None,
            peer_address: MeshAddress::new(0x0002),
            service_uuid: BLEHOME_SERVICE_UUID,
            write_characteristic_uuid: BLEHOME_WRITE_CHARACTERISTIC_UUID,
            notify_characteristic_uuid: BLEHOME_NOTIFY_CHARACTERISTIC_UUID,
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(15),
            max_connect_attempts: 0,
            keep_alive_interval: Duration::from_secs(30),
            auto_reconnect: true,
            bridge_bthome: true,
        }
    }
}

impl BleLinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_name_prefix = prefix.into();
        self
    }

    pub fn with_gateway_mac(mut self, mac: impl Into<String>) -> Self {
        self.gateway_mac = Some(mac.into());
        self
    }

    pub fn with_peer_address(mut self, address: MeshAddress) -> Self {
        self.peer_address = address;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Parsed `gateway_mac`, if one is configured
    pub fn gateway_mac_bytes(&self) -> Result<Option<[u8; 6]>, BleLinkError> {
        self.gateway_mac.as_deref().map(parse_mac).transpose()
    }
}
