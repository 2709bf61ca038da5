//! BLE protocol constants and utilities for BLEHome

use std::time::Duration;

use uuid::Uuid;

use crate::error::BleLinkError;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// BLEHome gateway service UUID
pub const BLEHOME_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB);

/// Characteristic the host writes frames and link acks to
pub const BLEHOME_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFE1_0000_1000_8000_00805F9B34FB);

/// Characteristic the gateway notifies frames and link acks on
pub const BLEHOME_NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFE2_0000_1000_8000_00805F9B34FB);

/// Service data UUID of BTHome v2 advertisements
pub const BTHOME_SERVICE_DATA_UUID: Uuid = Uuid::from_u128(0x0000FCD2_0000_1000_8000_00805F9B34FB);

// ----------------------------------------------------------------------------
// Connection Timing
// ----------------------------------------------------------------------------

/// Upper bound for both the connect timeout and the reconnect delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT_STEP: Duration = Duration::from_secs(5);

/// Connect timeout for reconnect attempt `attempt` (0-based)
pub fn connect_timeout(base: Duration, attempt: u32) -> Duration {
    (base + CONNECT_TIMEOUT_STEP * attempt).min(MAX_BACKOFF)
}

/// Delay before reconnect attempt `attempt + 1`: `2^attempt` seconds, capped
pub fn reconnect_delay(attempt: u32) -> Duration {
    let seconds = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(seconds).min(MAX_BACKOFF)
}

// ----------------------------------------------------------------------------
// Device Names and Addresses
// ----------------------------------------------------------------------------

/// Advertised name of a gateway: `<prefix> <last 4 hex digits of its MAC>`
pub fn generate_device_name(mac: &[u8; 6], prefix: &str) -> String {
    format!("{} {}", prefix, hex::encode_upper(&mac[4..]))
}

/// Whether an advertised local name belongs to a gateway with this prefix
pub fn is_gateway_name(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(' ') || rest.starts_with('-'),
        None => false,
    }
}

/// Parse `AA:BB:CC:DD:EE:FF` (or `-` separated, or bare hex) into bytes
pub fn parse_mac(value: &str) -> Result<[u8; 6], BleLinkError> {
    let digits: String = value
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    let bytes = hex::decode(&digits).map_err(|_| BleLinkError::InvalidMac {
        value: value.to_string(),
    })?;
    bytes.try_into().map_err(|_| BleLinkError::InvalidMac {
        value: value.to_string(),
    })
}

/// Colon separated upper-case form, as btleplug prints addresses
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_uuids_match_gatt_layout() {
        assert_eq!(
            BLEHOME_SERVICE_UUID.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BLEHOME_WRITE_CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BLEHOME_NOTIFY_CHARACTERISTIC_UUID.to_string(),
            "0000ffe2-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BTHOME_SERVICE_DATA_UUID.to_string(),
            "0000fcd2-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_connect_timeout_grows_and_caps() {
        let base = Duration::from_secs(15);
        assert_eq!(connect_timeout(base, 0), Duration::from_secs(15));
        assert_eq!(connect_timeout(base, 3), Duration::from_secs(30));
        assert_eq!(connect_timeout(base, 9), Duration::from_secs(60));
        assert_eq!(connect_timeout(base, 1000), MAX_BACKOFF);
    }

    #[test]
    fn test_reconnect_delay_is_exponential() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(6), Duration::from_secs(60));
        assert_eq!(reconnect_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_device_name_generation() {
        let mac = [0xA4, 0xC1, 0x38, 0x00, 0x1B, 0x7F];
        let name = generate_device_name(&mac, "BLE");
        assert_eq!(name, "BLE 1B7F");
        assert!(is_gateway_name(&name, "BLE"));
        assert!(!is_gateway_name("BLEACH", "BLE"));
        assert!(!is_gateway_name("Other 1B7F", "BLE"));
    }

    #[test]
    fn test_mac_parsing() {
        let mac = assert_ok!(parse_mac("a4:c1:38:00:1b:7f"));
        assert_eq!(mac, [0xA4, 0xC1, 0x38, 0x00, 0x1B, 0x7F]);
        assert_eq!(format_mac(&mac), "A4:C1:38:00:1B:7F");
        assert_eq!(assert_ok!(parse_mac("A4-C1-38-00-1B-7F")), mac);
        assert_err!(parse_mac("A4:C1:38"));
        assert_err!(parse_mac("zz:c1:38:00:1b:7f"));
    }
}
