//! BTHome advertisement bridging
//!
//! Bridge-capable nodes wrap the raw BTHome v2 service data they overhear
//! into `SensorRelay` frames addressed to the gateway. The service data is
//! carried byte for byte; only the gateway parses it into measurements.
//!
//! SensorRelay payload layout: sensor MAC (6 bytes, as advertised), RSSI
//! (i8), then the untouched service data.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::BthomeConfig;
use crate::errors::FrameError;
use crate::protocol::frame::{Frame, PayloadType, MAX_PAYLOAD_LEN};
use crate::types::{FrameId, MeshAddress, Ttl};

/// 16-bit service UUID BTHome advertisements are published under
pub const BTHOME_SERVICE_UUID16: u16 = 0xFCD2;

const RELAY_HEADER_LEN: usize = 7;

/// Largest service data blob that still fits into one frame
pub const MAX_SERVICE_DATA_LEN: usize = MAX_PAYLOAD_LEN - RELAY_HEADER_LEN;

const DEVICE_INFO_ENCRYPTED: u8 = 0x01;

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// A BTHome advertisement as heard over the air
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BthomeAdvertisement {
    pub mac: [u8; 6],
    pub rssi: i8,
    pub service_data: Vec<u8>,
}

impl BthomeAdvertisement {
    pub fn new(mac: [u8; 6], rssi: i8, service_data: Vec<u8>) -> Self {
        Self {
            mac,
            rssi,
            service_data,
        }
    }

    pub fn device_info(&self) -> Option<u8> {
        self.service_data.first().copied()
    }

    pub fn is_encrypted(&self) -> bool {
        self.device_info()
            .map(|info| info & DEVICE_INFO_ENCRYPTED != 0)
            .unwrap_or(false)
    }

    /// BTHome version from the device info byte (bits 5-7)
    pub fn version(&self) -> Option<u8> {
        self.device_info().map(|info| info >> 5)
    }

    /// Sensor-side packet counter, if the advertisement carries one
    pub fn packet_id(&self) -> Option<u8> {
        if self.is_encrypted() {
            return None;
        }
        match self.service_data.as_slice() {
            [_, 0x00, id, ..] => Some(*id),
            _ => None,
        }
    }

    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }
}

// ----------------------------------------------------------------------------
// Measurements
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    PacketId,
    Battery,
    Temperature,
    Humidity,
    Pressure,
    Illuminance,
    Voltage,
    Window,
}

impl MeasurementKind {
    pub fn unit(self) -> &'static str {
        match self {
            Self::PacketId | Self::Window => "",
            Self::Battery | Self::Humidity => "%",
            Self::Temperature => "°C",
            Self::Pressure => "hPa",
            Self::Illuminance => "lx",
            Self::Voltage => "V",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub kind: MeasurementKind,
    pub value: f64,
}

/// Object id -> (kind, width in bytes, signed, scale factor)
fn object_format(object_id: u8) -> Option<(MeasurementKind, usize, bool, f64)> {
    let format = match object_id {
        0x00 => (MeasurementKind::PacketId, 1, false, 1.0),
        0x01 => (MeasurementKind::Battery, 1, false, 1.0),
        0x02 => (MeasurementKind::Temperature, 2, true, 0.01),
        0x03 => (MeasurementKind::Humidity, 2, false, 0.01),
        0x04 => (MeasurementKind::Pressure, 3, false, 0.01),
        0x05 => (MeasurementKind::Illuminance, 3, false, 0.01),
        0x0C => (MeasurementKind::Voltage, 2, false, 0.001),
        0x2D => (MeasurementKind::Window, 1, false, 1.0),
        0x2E => (MeasurementKind::Humidity, 1, false, 1.0),
        0x45 => (MeasurementKind::Temperature, 2, true, 0.1),
        _ => return None,
    };
    Some(format)
}

fn read_le(bytes: &[u8], signed: bool) -> i64 {
    let mut raw: u64 = 0;
    for (shift, byte) in bytes.iter().enumerate() {
        raw |= u64::from(*byte) << (8 * shift);
    }
    if signed {
        let bits = 8 * bytes.len() as u32;
        let sign_bit = 1u64 << (bits - 1);
        if raw & sign_bit != 0 {
            return raw as i64 - (1i64 << bits);
        }
    }
    raw as i64
}

/// Parse the object list of an unencrypted BTHome v2 payload.
///
/// Parsing stops at the first object id this parser does not know, because
/// object lengths are implied by the id. Encrypted payloads yield no
/// measurements.
pub fn parse_measurements(service_data: &[u8]) -> Result<Vec<Measurement>, FrameError> {
    let Some((&device_info, mut rest)) = service_data.split_first() else {
        return Err(FrameError::malformed_payload("bthome", "empty service data"));
    };
    if device_info & DEVICE_INFO_ENCRYPTED != 0 {
        return Ok(Vec::new());
    }

    let mut measurements = Vec::new();
    while let Some((&object_id, tail)) = rest.split_first() {
        let Some((kind, width, signed, scale)) = object_format(object_id) else {
            tracing::debug!(object_id, "unknown BTHome object, stopping parse");
            break;
        };
        if tail.len() < width {
            return Err(FrameError::malformed_payload(
                "bthome",
                format!("object 0x{:02x} truncated", object_id),
            ));
        }
        let raw = read_le(&tail[..width], signed);
        measurements.push(Measurement {
            kind,
            value: raw as f64 * scale,
        });
        rest = &tail[width..];
    }
    Ok(measurements)
}

// ----------------------------------------------------------------------------
// Sensor Reading
// ----------------------------------------------------------------------------

/// A bridged advertisement as delivered to gateway subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// Mesh node that heard the advertisement
    pub bridge: MeshAddress,
    pub sensor_mac: [u8; 6],
    pub rssi: i8,
    pub encrypted: bool,
    pub measurements: Vec<Measurement>,
    pub service_data: Vec<u8>,
}

impl SensorReading {
    pub fn value(&self, kind: MeasurementKind) -> Option<f64> {
        self.measurements
            .iter()
            .find(|measurement| measurement.kind == kind)
            .map(|measurement| measurement.value)
    }
}

// ----------------------------------------------------------------------------
// Bridge
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BthomeBridge {
    local: MeshAddress,
    gateway: MeshAddress,
    ttl: Ttl,
    recent: VecDeque<([u8; 6], u8)>,
    replay_capacity: usize,
}

impl BthomeBridge {
    pub fn new(local: MeshAddress, gateway: MeshAddress, ttl: Ttl, config: &BthomeConfig) -> Self {
        Self {
            local,
            gateway,
            ttl,
            recent: VecDeque::with_capacity(config.replay_capacity),
            replay_capacity: config.replay_capacity,
        }
    }

    /// Wrap `advertisement` into a frame for the gateway.
    ///
    /// Returns `Ok(None)` for a repeat of a (sensor, packet id) pair that was
    /// already bridged; sensors send each packet several times.
    pub fn wrap(
        &mut self,
        advertisement: &BthomeAdvertisement,
        frame_id: FrameId,
    ) -> Result<Option<Frame>, FrameError> {
        if advertisement.service_data.len() > MAX_SERVICE_DATA_LEN {
            return Err(FrameError::PayloadTooLarge {
                size: advertisement.service_data.len(),
                max: MAX_SERVICE_DATA_LEN,
            });
        }

        if let Some(packet_id) = advertisement.packet_id() {
            let marker = (advertisement.mac, packet_id);
            if self.recent.contains(&marker) {
                return Ok(None);
            }
            if self.replay_capacity > 0 {
                if self.recent.len() >= self.replay_capacity {
                    self.recent.pop_front();
                }
                self.recent.push_back(marker);
            }
        }

        let mut payload = Vec::with_capacity(RELAY_HEADER_LEN + advertisement.service_data.len());
        payload.extend_from_slice(&advertisement.mac);
        payload.push(advertisement.rssi as u8);
        payload.extend_from_slice(&advertisement.service_data);

        Frame::new(
            frame_id,
            self.local,
            self.gateway,
            self.ttl,
            PayloadType::SensorRelay,
            payload,
        )
        .map(Some)
    }

    /// Recover the advertisement from a `SensorRelay` frame
    pub fn unwrap(frame: &Frame) -> Result<BthomeAdvertisement, FrameError> {
        if frame.payload_type != PayloadType::SensorRelay {
            return Err(FrameError::malformed_payload(
                "sensor relay",
                format!("wrong payload type {:?}", frame.payload_type),
            ));
        }
        if frame.payload.len() < RELAY_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: RELAY_HEADER_LEN,
                actual: frame.payload.len(),
            });
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&frame.payload[..6]);
        Ok(BthomeAdvertisement {
            mac,
            rssi: frame.payload[6] as i8,
            service_data: frame.payload[RELAY_HEADER_LEN..].to_vec(),
        })
    }

    /// Unwrap and parse a relayed advertisement for delivery
    pub fn reading(frame: &Frame) -> Result<SensorReading, FrameError> {
        let advertisement = Self::unwrap(frame)?;
        let measurements = parse_measurements(&advertisement.service_data)?;
        Ok(SensorReading {
            bridge: frame.origin,
            sensor_mac: advertisement.mac,
            rssi: advertisement.rssi,
            encrypted: advertisement.is_encrypted(),
            measurements,
            service_data: advertisement.service_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xA4, 0xC1, 0x38, 0x01, 0x02, 0x03];

    // device info 0x40 (v2, unencrypted), packet id 9, battery 97%,
    // temperature 23.45 C, humidity 51.20 %
    fn climate_advert() -> BthomeAdvertisement {
        BthomeAdvertisement::new(
            MAC,
            -67,
            vec![0x40, 0x00, 0x09, 0x01, 0x61, 0x02, 0x29, 0x09, 0x03, 0x00, 0x14],
        )
    }

    fn bridge() -> BthomeBridge {
        BthomeBridge::new(
            MeshAddress::new(4),
            MeshAddress::DEFAULT_GATEWAY,
            Ttl::DEFAULT,
            &BthomeConfig::default(),
        )
    }

    #[test]
    fn test_parses_common_objects() {
        let measurements = parse_measurements(&climate_advert().service_data).unwrap();
        assert_eq!(measurements.len(), 4);
        assert_eq!(measurements[0].kind, MeasurementKind::PacketId);
        assert_eq!(measurements[1].value, 97.0);
        assert!((measurements[2].value - 23.45).abs() < 1e-9);
        assert!((measurements[3].value - 51.20).abs() < 1e-9);
    }

    #[test]
    fn test_negative_temperature_is_sign_extended() {
        // -5.00 C = -500 = 0xFE0C
        let measurements = parse_measurements(&[0x40, 0x02, 0x0C, 0xFE]).unwrap();
        assert!((measurements[0].value + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parsing_stops_at_unknown_object() {
        let measurements = parse_measurements(&[0x40, 0x01, 0x50, 0x7F, 0x01, 0x02]).unwrap();
        assert_eq!(measurements.len(), 1);
    }

    #[test]
    fn test_encrypted_payloads_are_not_decoded() {
        let advert = BthomeAdvertisement::new(MAC, -70, vec![0x41, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(advert.is_encrypted());
        assert_eq!(advert.packet_id(), None);
        assert!(parse_measurements(&advert.service_data).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_object_is_malformed() {
        assert!(parse_measurements(&[0x40, 0x02, 0x01]).is_err());
        assert!(parse_measurements(&[]).is_err());
    }

    #[test]
    fn test_wrap_targets_gateway_and_preserves_bytes() {
        let mut bridge = bridge();
        let advert = climate_advert();
        let frame = bridge.wrap(&advert, FrameId::new(1)).unwrap().unwrap();
        assert_eq!(frame.destination, MeshAddress::DEFAULT_GATEWAY);
        assert_eq!(frame.origin, MeshAddress::new(4));
        assert_eq!(frame.payload_type, PayloadType::SensorRelay);
        assert_eq!(BthomeBridge::unwrap(&frame).unwrap(), advert);

        let reading = BthomeBridge::reading(&frame).unwrap();
        assert_eq!(reading.bridge, MeshAddress::new(4));
        assert_eq!(reading.value(MeasurementKind::Battery), Some(97.0));
        assert_eq!(reading.rssi, -67);
    }

    #[test]
    fn test_repeated_packet_id_is_suppressed() {
        let mut bridge = bridge();
        assert!(bridge.wrap(&climate_advert(), FrameId::new(1)).unwrap().is_some());
        assert!(bridge.wrap(&climate_advert(), FrameId::new(2)).unwrap().is_none());

        let mut next = climate_advert();
        next.service_data[2] = 0x0A;
        assert!(bridge.wrap(&next, FrameId::new(3)).unwrap().is_some());
    }

    #[test]
    fn test_oversized_service_data_is_rejected() {
        let mut bridge = bridge();
        let advert = BthomeAdvertisement::new(MAC, -50, vec![0x40; MAX_SERVICE_DATA_LEN + 1]);
        assert!(bridge.wrap(&advert, FrameId::new(1)).is_err());
    }

    #[test]
    fn test_mac_is_formatted_with_colons() {
        assert_eq!(climate_advert().mac_string(), "A4:C1:38:01:02:03");
    }
}
