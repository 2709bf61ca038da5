//! Error types for BLE links

use std::time::Duration;

use blehome_core::BlehomeError;
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE link
#[derive(Error, Debug)]
pub enum BleLinkError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("BLE adapter error: {0}")]
    Adapter(String),

    #[error("Failed to scan: {0}")]
    ScanFailed(String),

    #[error("No gateway advertising as '{prefix}' found within {timeout:?}")]
    GatewayNotFound { prefix: String, timeout: Duration },

    #[error("Failed to connect to gateway: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Gave up after {attempts} connection attempts")]
    TooManyRetries { attempts: u32 },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: Uuid },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to get notifications stream: {0}")]
    NotificationStreamFailed(String),

    #[error("Invalid MAC address: {value}")]
    InvalidMac { value: String },
}

impl From<btleplug::Error> for BleLinkError {
    fn from(err: btleplug::Error) -> Self {
        BleLinkError::Adapter(err.to_string())
    }
}

impl From<BleLinkError> for BlehomeError {
    fn from(err: BleLinkError) -> Self {
        match err {
            BleLinkError::InvalidMac { .. } => BlehomeError::config_error("gateway_mac", err.to_string()),
            other => BlehomeError::transport_error(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_mac_maps_to_configuration_error() {
        let err: BlehomeError = BleLinkError::InvalidMac {
            value: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, BlehomeError::Configuration(_)));
    }

    #[test]
    fn test_link_failures_are_transport_errors() {
        let err: BlehomeError = BleLinkError::ConnectionTimeout(Duration::from_secs(15)).into();
        assert!(matches!(err, BlehomeError::Transport { .. }));
        assert!(err.is_retryable());
    }
}
