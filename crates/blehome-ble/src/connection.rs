//! GATT link to a BLEHome gateway device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blehome_core::{GattLink, LinkError, MeshAddress};
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleLinkConfig;
use crate::discovery::BleDiscovery;
use crate::error::BleLinkError;
use crate::peer::GatewayPeer;
use crate::protocol::format_mac;

/// Inbound notifications buffered per link
const NOTIFICATION_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Gatt Link
// ----------------------------------------------------------------------------

/// A connected gateway peripheral, exposed to the mesh as a `GattLink`
pub struct BleGattLink {
    peer: MeshAddress,
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    rssi: Option<i16>,
    pump: JoinHandle<()>,
}

impl BleGattLink {
    /// Set up a peripheral that is already connected: discover the GATT
    /// service, subscribe to notifications and start pumping them.
    pub async fn open(peripheral: Peripheral, config: &BleLinkConfig) -> Result<Self, BleLinkError> {
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleLinkError::ServiceDiscoveryFailed(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(BleLinkError::CharacteristicNotFound { uuid })
        };
        let write_characteristic = find(config.write_characteristic_uuid)?;
        let notify_characteristic = find(config.notify_characteristic_uuid)?;

        peripheral
            .subscribe(&notify_characteristic)
            .await
            .map_err(|e| BleLinkError::SubscriptionFailed(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| BleLinkError::NotificationStreamFailed(e.to_string()))?;

        let rssi = match peripheral.properties().await {
            Ok(Some(properties)) => properties.rssi,
            _ => None,
        };

        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let notify_uuid = notify_characteristic.uuid;
        let peer = config.peer_address;
        let pump_connected = connected.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            pump_connected.store(false, Ordering::SeqCst);
            debug!(%peer, "notification stream ended");
        });

        info!(%peer, "GATT link ready");
        Ok(Self {
            peer,
            peripheral,
            write_characteristic,
            inbound: Mutex::new(rx),
            connected,
            rssi,
            pump,
        })
    }

    /// Close the link; pending `recv` calls return `None`
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pump.abort();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(peer = %self.peer, "Failed to disconnect from gateway: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl GattLink for BleGattLink {
    fn peer(&self) -> MeshAddress {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected { peer: self.peer });
        }
        self.peripheral
            .write(&self.write_characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| LinkError::WriteFailed {
                peer: self.peer,
                reason: e.to_string(),
            })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }

    fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

impl Drop for BleGattLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for BleGattLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleGattLink")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("rssi", &self.rssi)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Connection Management
// ----------------------------------------------------------------------------

/// Find and connect to the gateway, backing off between failed attempts.
///
/// Each attempt rescans, so a gateway that changed address or restarted is
/// picked up again. Gives up after `max_connect_attempts` failures when
/// that is non-zero.
pub async fn connect_with_backoff(
    discovery: &BleDiscovery,
    config: &BleLinkConfig,
) -> Result<Arc<BleGattLink>, BleLinkError> {
    let mut gateway = GatewayPeer::new(config.connection_timeout, config.max_connect_attempts);

    loop {
        let connect_timeout = gateway.start_connection_attempt();
        match connect_once(discovery, config, connect_timeout).await {
            Ok(link) => {
                gateway.mark_connected();
                return Ok(Arc::new(link));
            }
            Err(e) => {
                let delay = gateway.mark_failed();
                if !gateway.can_retry() {
                    error!("Giving up on gateway after {} attempts: {}", gateway.attempt, e);
                    return Err(BleLinkError::TooManyRetries {
                        attempts: gateway.attempt,
                    });
                }
                warn!(
                    attempt = gateway.attempt,
                    retry_in = ?delay,
                    "Gateway connection failed: {}", e
                );
                sleep(delay).await;
            }
        }
    }
}

async fn connect_once(
    discovery: &BleDiscovery,
    config: &BleLinkConfig,
    connect_timeout: std::time::Duration,
) -> Result<BleGattLink, BleLinkError> {
    let peripheral = discovery.find_gateway().await?;
    let (mac, name) = match peripheral.properties().await? {
        Some(properties) => (properties.address.into_inner(), properties.local_name),
        None => (peripheral.address().into_inner(), None),
    };

    if !peripheral.is_connected().await? {
        debug!(mac = %format_mac(&mac), timeout = ?connect_timeout, "connecting to gateway");
        match timeout(connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BleLinkError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(BleLinkError::ConnectionTimeout(connect_timeout)),
        }
    }
    info!(mac = %format_mac(&mac), name = ?name, "Connected to gateway");

    match BleGattLink::open(peripheral.clone(), config).await {
        Ok(link) => Ok(link),
        Err(e) => {
            let _ = peripheral.disconnect().await;
            Err(e)
        }
    }
}
