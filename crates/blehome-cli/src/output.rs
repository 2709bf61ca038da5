//! Human and JSON rendering of mesh events and results

use blehome_core::{CommandOutcome, CommandReceipt, DeviceState, MeasurementKind, SensorReading};
use blehome_runtime::{DeviceRecord, MeshEvent, NodeStats};
use serde::Serialize;

use crate::error::Result;

/// Print `value` as one JSON line
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn render_state(state: &DeviceState) -> String {
    if state.on {
        format!("on at brightness {}/255", state.brightness)
    } else {
        "off".to_string()
    }
}

pub fn render_reading(reading: &SensorReading) -> String {
    let mac = reading
        .sensor_mac
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":");
    let values = if reading.encrypted {
        "encrypted".to_string()
    } else {
        reading
            .measurements
            .iter()
            .filter(|measurement| measurement.kind != MeasurementKind::PacketId)
            .map(|measurement| {
                format!(
                    "{:?} {:.2}{}",
                    measurement.kind,
                    measurement.value,
                    measurement.kind.unit()
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "sensor {} via {} ({} dBm): {}",
        mac, reading.bridge, reading.rssi, values
    )
}

pub fn render_receipt(receipt: &CommandReceipt) -> String {
    let state = receipt
        .state
        .as_ref()
        .map(|state| format!(", device is {}", render_state(state)))
        .unwrap_or_default();
    format!(
        "command {} to {} {:?} by {} after {} attempt(s) in {:?}{}",
        receipt.frame_id,
        receipt.destination,
        receipt.status,
        receipt.acked_by,
        receipt.attempts,
        receipt.round_trip,
        state
    )
}

pub fn render_event(event: &MeshEvent) -> String {
    match event {
        MeshEvent::SensorReading(reading) => render_reading(reading),
        MeshEvent::DeviceStateChanged { address, state } => {
            format!("device {} is {}", address, render_state(state))
        }
        MeshEvent::DeviceDiscovered {
            address,
            role,
            name,
        } => {
            let role = role
                .map(|role| role.to_string())
                .unwrap_or_else(|| "unknown role".to_string());
            match name {
                Some(name) => format!("discovered {} ({}) \"{}\"", address, role, name),
                None => format!("discovered {} ({})", address, role),
            }
        }
        MeshEvent::CommandResolved {
            frame_id,
            destination,
            outcome,
        } => match outcome {
            CommandOutcome::Succeeded(receipt) => render_receipt(receipt),
            CommandOutcome::TimedOut { attempts } => format!(
                "command {} to {} timed out after {} attempt(s)",
                frame_id, destination, attempts
            ),
            CommandOutcome::Cancelled => {
                format!("command {} to {} cancelled", frame_id, destination)
            }
        },
        MeshEvent::LinkLost { peer } => format!("link to {} lost", peer),
    }
}

pub fn render_devices(devices: &[DeviceRecord]) -> String {
    if devices.is_empty() {
        return "no known devices".to_string();
    }
    devices
        .iter()
        .map(|device| {
            let role = device
                .role
                .map(|role| role.to_string())
                .unwrap_or_else(|| "-".to_string());
            let state = device
                .state
                .as_ref()
                .map(render_state)
                .unwrap_or_else(|| "-".to_string());
            format!(
                "  {}  {:<8} {:<12} {}",
                device.address,
                role,
                device.name.as_deref().unwrap_or("-"),
                state
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_stats(stats: &NodeStats) -> String {
    let mut lines = vec![
        format!("node {} ({}), up {:?}", stats.address, stats.role, stats.uptime),
        format!(
            "  links {}  neighbors {}  known devices {}  outstanding {}",
            stats.links,
            stats.neighbors.len(),
            stats.known_devices,
            stats.outstanding_commands
        ),
        format!(
            "  relay: received {} delivered {} forwarded {} originated {} duplicates {} expired {}",
            stats.relay.frames_received,
            stats.relay.frames_delivered,
            stats.relay.frames_forwarded,
            stats.relay.frames_originated,
            stats.relay.duplicates_dropped,
            stats.relay.expired_dropped
        ),
        format!(
            "  commands: succeeded {} retransmitted {} timed out {} cancelled {}",
            stats.commands.succeeded,
            stats.commands.retransmitted,
            stats.commands.timed_out,
            stats.commands.cancelled
        ),
    ];
    if stats.malformed_frames > 0 {
        lines.push(format!("  malformed frames: {}", stats.malformed_frames));
    }
    lines.join("\n")
}
