//! Gateway application: one mesh node on the host, linked to the gateway
//! device over BLE.

use std::sync::Arc;

use blehome_ble::{connect_with_backoff, BleDiscovery, BleGattLink, BleLinkError, GattLink};
use blehome_core::{
    BlehomeError, BthomeAdvertisement, CommandPayload, CommandReceipt, MeshAddress,
};
use blehome_runtime::{MeshEvent, MeshHandle, NodeBuilder};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::output::{print_json, render_event};

/// Advertisements buffered between the BLE scanner and the mesh node
const ADVERTISEMENT_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Mock Sensor
// ----------------------------------------------------------------------------

/// Synthetic BTHome v2 temperature sensor
#[derive(Debug, Clone)]
pub struct MockSensor {
    mac: [u8; 6],
    packet_id: u8,
}

impl MockSensor {
    pub fn new(mac: [u8; 6]) -> Self {
        Self { mac, packet_id: 0 }
    }

    /// Next advertisement; every call carries a fresh packet id so the
    /// bridge does not suppress it as a repeat.
    pub fn next_advertisement(&mut self) -> BthomeAdvertisement {
        self.packet_id = self.packet_id.wrapping_add(1);
        // 20.00 °C rising in 0.10 °C steps, wrapping every 50 packets
        let centidegrees = 2000 + i16::from(self.packet_id % 50) * 10;
        let [low, high] = centidegrees.to_le_bytes();
        BthomeAdvertisement::new(
            self.mac,
            -60,
            vec![0x40, 0x00, self.packet_id, 0x02, low, high],
        )
    }
}

// ----------------------------------------------------------------------------
// Gateway Application
// ----------------------------------------------------------------------------

/// Options of the long running gateway mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayOptions {
    pub mock_bthome: bool,
    pub scan_bthome: bool,
    pub json: bool,
}

pub struct GatewayApp {
    config: AppConfig,
    mesh: MeshHandle,
    discovery: Option<BleDiscovery>,
    link: Option<Arc<BleGattLink>>,
    scanner: Option<JoinHandle<()>>,
}

/// Send one heartbeat in the background; the result arrives on `results`
pub fn spawn_heartbeat(
    mesh: &MeshHandle,
    peer: MeshAddress,
    results: mpsc::Sender<std::result::Result<CommandReceipt, BlehomeError>>,
) {
    let mesh = mesh.clone();
    tokio::spawn(async move {
        let result = mesh.send_command(peer, CommandPayload::Heartbeat).await;
        if let Ok(receipt) = &result {
            debug!(%peer, round_trip = ?receipt.round_trip, "heartbeat acknowledged");
        }
        let _ = results.send(result).await;
    });
}

impl GatewayApp {
    /// Spawn the host's mesh node; BLE is only touched on `connect`
    pub fn new(config: AppConfig) -> Result<Self> {
        let mesh = NodeBuilder::new(config.mesh.clone()).spawn()?;
        Ok(Self {
            config,
            mesh,
            discovery: None,
            link: None,
            scanner: None,
        })
    }

    pub fn mesh(&self) -> &MeshHandle {
        &self.mesh
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    async fn discovery(&mut self) -> Result<&BleDiscovery> {
        if self.discovery.is_none() {
            let mut discovery = BleDiscovery::new(self.config.ble.clone());
            discovery.initialize_adapter().await?;
            self.discovery = Some(discovery);
        }
        match &self.discovery {
            Some(discovery) => Ok(discovery),
            None => Err(BleLinkError::AdapterNotAvailable.into()),
        }
    }

    /// Find the gateway device, connect and attach the link to the mesh node
    pub async fn connect(&mut self) -> Result<Arc<BleGattLink>> {
        let config = self.config.ble.clone();
        let discovery = self.discovery().await?;
        let link = connect_with_backoff(discovery, &config).await?;
        self.mesh.attach_link(link.clone()).await?;
        self.link = Some(link.clone());
        info!(peer = %config.peer_address, "Gateway link attached to mesh");
        Ok(link)
    }

    /// Drop the current link; the node notices the closed session on its own
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await;
        if !self.config.ble.auto_reconnect {
            return Err(BlehomeError::LinkLost {
                peer: self.config.ble.peer_address,
            }
            .into());
        }
        info!("Reconnecting to gateway");
        self.connect().await?;
        Ok(())
    }

    fn link_is_up(&self) -> bool {
        self.link.as_ref().map(|link| link.is_connected()).unwrap_or(false)
    }

    /// (Re)start listening for BTHome sensors
    async fn start_scanner(&mut self, sink: &mpsc::Sender<BthomeAdvertisement>) -> Result<()> {
        self.stop_scanner();
        let discovery = self.discovery().await?;
        let scanner = discovery.start_bthome_scanner(sink.clone()).await?;
        self.scanner = Some(scanner);
        Ok(())
    }

    fn stop_scanner(&mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }
    }

    /// Run until Ctrl+C: keep the link alive, bridge sensors and print events.
    /// The node and link are stopped however the loop ends.
    pub async fn run(&mut self, options: GatewayOptions) -> Result<()> {
        let result = self.serve(options).await;
        let stopped = self.stop().await;
        result.and(stopped)
    }

    async fn serve(&mut self, options: GatewayOptions) -> Result<()> {
        let mut events = self.mesh.subscribe();
        self.connect().await?;

        let scan_bthome = options.scan_bthome && self.config.ble.bridge_bthome;
        let (adverts_tx, mut adverts) = mpsc::channel(ADVERTISEMENT_BUFFER);
        if scan_bthome {
            self.start_scanner(&adverts_tx).await?;
        }

        let peer = self.config.ble.peer_address;
        let keep_alive = self.config.ble.keep_alive_interval;
        let mut heartbeat = interval_at(Instant::now() + keep_alive, keep_alive);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (heartbeat_tx, mut heartbeat_results) = mpsc::channel(1);
        let mut heartbeat_in_flight = false;

        let mut mock_ticker = interval(self.config.cli.bthome_mock_interval);
        let mock_bthome = options.mock_bthome || self.config.cli.bthome_mock;
        let mut mock_sensor = MockSensor::new(self.config.mock_sensor_mac()?);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        info!(address = %self.mesh.address(), "Gateway running, press Ctrl+C to stop");

        loop {
            let mut reconnected = false;
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down gateway");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if options.json {
                            print_json(&event)?;
                        } else {
                            println!("{}", render_event(&event));
                        }
                        if let MeshEvent::LinkLost { peer: lost } = event {
                            // A fresh link may already replace the lost session
                            if lost == peer && !self.link_is_up() {
                                warn!(%lost, "Gateway link lost");
                                self.reconnect().await?;
                                reconnected = true;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event output fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(advertisement) = adverts.recv() => {
                    match self.mesh.inject_bthome(advertisement).await {
                        Ok(true) => {}
                        Ok(false) => debug!("repeated BTHome packet skipped"),
                        Err(e) => warn!("Failed to bridge BTHome advertisement: {}", e),
                    }
                }
                _ = heartbeat.tick(), if !heartbeat_in_flight => {
                    spawn_heartbeat(&self.mesh, peer, heartbeat_tx.clone());
                    heartbeat_in_flight = true;
                }
                Some(result) = heartbeat_results.recv() => {
                    heartbeat_in_flight = false;
                    if let Err(e) = result {
                        warn!("Heartbeat failed, reconnecting: {}", e);
                        self.reconnect().await?;
                        reconnected = true;
                    }
                }
                _ = mock_ticker.tick(), if mock_bthome => {
                    let advertisement = mock_sensor.next_advertisement();
                    if let Err(e) = self.mesh.inject_bthome(advertisement).await {
                        warn!("Failed to inject mock BTHome advertisement: {}", e);
                    }
                }
            }

            // Connecting scans for the gateway, which ends any running BTHome scan
            if reconnected && scan_bthome {
                self.start_scanner(&adverts_tx).await?;
            }
        }
        Ok(())
    }

    /// Stop the scanner, close the link and stop the mesh node
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_scanner();
        self.disconnect().await;
        self.mesh.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for GatewayApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayApp")
            .field("mesh", &self.mesh)
            .field("link", &self.link)
            .field("scanning", &self.scanner.is_some())
            .finish()
    }
}
