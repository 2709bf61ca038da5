//! In-memory demonstration mesh
//!
//! Builds a gateway plus a handful of devices on loopback links and drives
//! the same operations the real gateway uses: a control command to the
//! farthest device, a scan, and a bridged BTHome reading.

use std::time::Duration;

use blehome_core::{CommandPayload, CommandReceipt, MeshAddress, SensorReading};
use blehome_runtime::{DeviceRecord, MeshEvent, MeshSimulation, NodeStats};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::app::MockSensor;
use crate::cli::Topology;
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Time given to link beacons before the first command
const SETTLE_TIME: Duration = Duration::from_millis(200);

/// How long to wait for the bridged reading to reach the gateway
const READING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub topology: &'static str,
    pub gateway: MeshAddress,
    pub devices: Vec<MeshAddress>,
    /// Control command to the farthest device
    pub control: CommandReceipt,
    /// Devices that answered the scan
    pub scanned: Vec<CommandReceipt>,
    /// Gateway registry after the scan
    pub registry: Vec<DeviceRecord>,
    pub reading: Option<SensorReading>,
    pub stats: NodeStats,
}

pub async fn run_simulation(
    config: &AppConfig,
    topology: Topology,
    device_count: u16,
) -> Result<SimulationReport> {
    let gateway = config.mesh.address.value();
    let last = gateway.checked_add(device_count).ok_or_else(|| {
        CliError::InvalidArgument(format!(
            "{} devices after {} overflow the address space",
            device_count, config.mesh.address
        ))
    })?;
    if last >= MeshAddress::BROADCAST.value() {
        return Err(CliError::InvalidArgument(format!(
            "{} devices after {} reach the broadcast address",
            device_count, config.mesh.address
        )));
    }
    let devices: Vec<u16> = (gateway + 1..=last).collect();

    let mut template = config.mesh.clone();
    template.gateway = config.mesh.address;
    let mut simulation = MeshSimulation::new(template);
    let gateway_handle = simulation.add_gateway(gateway)?;
    for device in &devices {
        simulation.add_device(*device)?;
    }

    let mut previous = gateway;
    for device in &devices {
        match topology {
            Topology::Chain => simulation.connect(previous, *device).await?,
            Topology::Star => simulation.connect(gateway, *device).await?,
        }
        previous = *device;
    }
    info!(?topology, devices = devices.len(), "simulated mesh up");
    sleep(SETTLE_TIME).await;

    let mut events = gateway_handle.subscribe();
    let farthest = MeshAddress::new(last);
    let control = gateway_handle
        .send_command(
            farthest,
            CommandPayload::Control {
                on: true,
                brightness: 80,
            },
        )
        .await?;

    let scanned = gateway_handle
        .scan(gateway..=last, config.cli.scan_delay)
        .await?;
    let registry = gateway_handle.devices().await?;

    let sensor_mac = config.mock_sensor_mac()?;
    let reading = match simulation.node(last) {
        Some(sensor_host) => {
            sensor_host
                .inject_bthome(MockSensor::new(sensor_mac).next_advertisement())
                .await?;
            wait_for_reading(&mut events).await
        }
        None => None,
    };

    let stats = gateway_handle.stats().await?;
    simulation.shutdown().await?;

    Ok(SimulationReport {
        topology: match topology {
            Topology::Chain => "chain",
            Topology::Star => "star",
        },
        gateway: config.mesh.address,
        devices: devices.into_iter().map(MeshAddress::new).collect(),
        control,
        scanned,
        registry,
        reading,
        stats,
    })
}

async fn wait_for_reading(events: &mut broadcast::Receiver<MeshEvent>) -> Option<SensorReading> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(MeshEvent::SensorReading(reading)) => return Some(reading),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    timeout(READING_TIMEOUT, wait).await.ok().flatten()
}
