//! Gateway discovery and BTHome scanning

use std::collections::HashMap;

use blehome_core::BthomeAdvertisement;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::BleLinkConfig;
use crate::error::BleLinkError;
use crate::protocol::{format_mac, is_gateway_name, BTHOME_SERVICE_DATA_UUID};

// ----------------------------------------------------------------------------
// Discovery Implementation
// ----------------------------------------------------------------------------

/// Finds the gateway device and listens for sensor advertisements
pub struct BleDiscovery {
    config: BleLinkConfig,
    adapter: Option<Adapter>,
}

impl BleDiscovery {
    pub fn new(config: BleLinkConfig) -> Self {
        Self {
            config,
            adapter: None,
        }
    }

    /// Initialize the first BLE adapter of the host
    pub async fn initialize_adapter(&mut self) -> Result<(), BleLinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleLinkError::AdapterNotAvailable)?;
        info!("BLE adapter initialized");
        self.adapter = Some(adapter);
        Ok(())
    }

    pub fn adapter(&self) -> Result<&Adapter, BleLinkError> {
        self.adapter.as_ref().ok_or(BleLinkError::AdapterNotAvailable)
    }

    /// Scan until a peripheral matching the configured MAC or name prefix shows up
    pub async fn find_gateway(&self) -> Result<Peripheral, BleLinkError> {
        let adapter = self.adapter()?;
        let wanted_mac = self.config.gateway_mac_bytes()?;
        let mut events = adapter
            .events()
            .await
            .map_err(|e| BleLinkError::ScanFailed(e.to_string()))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![self.config.service_uuid],
            })
            .await
            .map_err(|e| BleLinkError::ScanFailed(e.to_string()))?;
        info!(prefix = %self.config.device_name_prefix, "scanning for BLEHome gateway");

        let search = async {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Some(peripheral) = self.matching_gateway(adapter, &id, wanted_mac).await {
                    return Some(peripheral);
                }
            }
            None
        };

        let found = timeout(self.config.scan_timeout, search).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop gateway scan: {}", e);
        }
        match found {
            Ok(Some(peripheral)) => Ok(peripheral),
            Ok(None) => Err(BleLinkError::ScanFailed("adapter event stream ended".to_string())),
            Err(_) => Err(BleLinkError::GatewayNotFound {
                prefix: self.config.device_name_prefix.clone(),
                timeout: self.config.scan_timeout,
            }),
        }
    }

    async fn matching_gateway(
        &self,
        adapter: &Adapter,
        id: &PeripheralId,
        wanted_mac: Option<[u8; 6]>,
    ) -> Option<Peripheral> {
        let peripheral = adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let mac = properties.address.into_inner();

        let matches = match wanted_mac {
            Some(wanted) => mac == wanted,
            None => properties
                .local_name
                .as_deref()
                .map(|name| is_gateway_name(name, &self.config.device_name_prefix))
                .unwrap_or(false),
        };
        if matches {
            info!(
                mac = %format_mac(&mac),
                name = ?properties.local_name,
                rssi = ?properties.rssi,
                "found BLEHome gateway"
            );
            Some(peripheral)
        } else {
            trace!(mac = %format_mac(&mac), "ignoring peripheral");
            None
        }
    }

    /// Listen for BTHome advertisements and forward them on `sink`.
    ///
    /// Starts an unfiltered scan; the task ends when `sink` is closed or
    /// the adapter stops producing events.
    pub async fn start_bthome_scanner(
        &self,
        sink: mpsc::Sender<BthomeAdvertisement>,
    ) -> Result<JoinHandle<()>, BleLinkError> {
        let adapter = self.adapter()?.clone();
        let mut events = adapter
            .events()
            .await
            .map_err(|e| BleLinkError::ScanFailed(e.to_string()))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleLinkError::ScanFailed(e.to_string()))?;
        info!("Started BLE scanning for BTHome sensors");

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
                    continue;
                };
                let Some(advertisement) = bthome_advertisement(&adapter, &id, &service_data).await
                else {
                    continue;
                };
                debug!(sensor = %advertisement.mac_string(), "BTHome advertisement");
                if sink.send(advertisement).await.is_err() {
                    break;
                }
            }
            debug!("BTHome scanner ended");
        }))
    }
}

async fn bthome_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    service_data: &HashMap<Uuid, Vec<u8>>,
) -> Option<BthomeAdvertisement> {
    let data = service_data.get(&BTHOME_SERVICE_DATA_UUID)?;
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let rssi = properties
        .rssi
        .map(|rssi| rssi.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8)
        .unwrap_or(i8::MIN);
    Some(BthomeAdvertisement::new(
        properties.address.into_inner(),
        rssi,
        data.clone(),
    ))
}
