//! Bluetooth Low Energy links for BLEHome
//!
//! This crate connects a host to a BLEHome gateway device over GATT and
//! exposes the connection as a `GattLink`, so the host can join the mesh as
//! a node of its own.
//!
//! ## Architecture
//!
//! - [`config`] - Link configuration and settings
//! - [`error`] - Error types specific to the BLE link
//! - [`protocol`] - GATT identifiers, device names and backoff timing
//! - [`peer`] - Gateway connection state and retry bookkeeping
//! - [`discovery`] - Gateway scanning and BTHome advertisement capture
//! - [`connection`] - The `GattLink` implementation and reconnect loop
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blehome_ble::{connect_with_backoff, BleDiscovery, BleLinkConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BleLinkConfig::new().with_device_name_prefix("BLE");
//! let mut discovery = BleDiscovery::new(config.clone());
//! discovery.initialize_adapter().await?;
//!
//! // Scans, connects and subscribes; retries with exponential backoff.
//! let link = connect_with_backoff(&discovery, &config).await?;
//! # let _ = link;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod discovery;
mod error;
mod peer;
mod protocol;

// Public API exports
pub use config::BleLinkConfig;
pub use connection::{connect_with_backoff, BleGattLink};
pub use discovery::BleDiscovery;
pub use error::BleLinkError;
pub use peer::{ConnectionState, GatewayPeer};
pub use protocol::{
    connect_timeout, format_mac, generate_device_name, is_gateway_name, parse_mac,
    reconnect_delay, BLEHOME_NOTIFY_CHARACTERISTIC_UUID, BLEHOME_SERVICE_UUID,
    BLEHOME_WRITE_CHARACTERISTIC_UUID, BTHOME_SERVICE_DATA_UUID, MAX_BACKOFF,
};

// Re-export the link trait for convenience
pub use blehome_core::GattLink;
