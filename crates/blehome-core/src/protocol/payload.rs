//! Payload bodies carried inside frames
//!
//! Commands keep the vendor opcode layout (big-endian opcode followed by
//! arguments) so existing firmware can parse them unchanged.

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::types::{FrameId, NodeRole};

pub const OPCODE_HEARTBEAT: u16 = 0x0000;
pub const OPCODE_QUERY: u16 = 0x8201;
pub const OPCODE_CONTROL: u16 = 0x8202;

/// Longest node name a discovery beacon carries
pub const MAX_NAME_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Device State
// ----------------------------------------------------------------------------

/// Reported state of a controllable device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceState {
    pub on: bool,
    pub brightness: u8,
}

impl DeviceState {
    pub const ENCODED_LEN: usize = 2;

    pub fn new(on: bool, brightness: u8) -> Self {
        Self { on, brightness }
    }

    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        [u8::from(self.on), self.brightness]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes {
            [on, brightness] => Ok(Self {
                on: *on != 0,
                brightness: *brightness,
            }),
            _ => Err(FrameError::malformed_payload(
                "state",
                format!("expected 2 bytes, got {}", bytes.len()),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Command
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    /// Switch a light and set its brightness
    Control { on: bool, brightness: u8 },
    /// Ask a device to report its state
    Query,
    /// Keep-alive ping, acknowledged without state
    Heartbeat,
    /// Opcode this crate has no structured form for
    Raw { opcode: u16, args: Vec<u8> },
}

impl CommandPayload {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::Control { .. } => OPCODE_CONTROL,
            Self::Query => OPCODE_QUERY,
            Self::Heartbeat => OPCODE_HEARTBEAT,
            Self::Raw { opcode, .. } => *opcode,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.opcode().to_be_bytes().to_vec();
        match self {
            Self::Control { on, brightness } => {
                out.push(u8::from(*on));
                out.push(*brightness);
            }
            Self::Query | Self::Heartbeat => {}
            Self::Raw { args, .. } => out.extend_from_slice(args),
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let (opcode, args) = match bytes {
            [hi, lo, rest @ ..] => (u16::from_be_bytes([*hi, *lo]), rest),
            _ => {
                return Err(FrameError::malformed_payload(
                    "command",
                    "missing opcode",
                ))
            }
        };
        match opcode {
            OPCODE_CONTROL => match args {
                [on, brightness, ..] => Ok(Self::Control {
                    on: *on != 0,
                    brightness: *brightness,
                }),
                _ => Err(FrameError::malformed_payload(
                    "command",
                    "control needs on and brightness",
                )),
            },
            OPCODE_QUERY => Ok(Self::Query),
            OPCODE_HEARTBEAT => Ok(Self::Heartbeat),
            other => Ok(Self::Raw {
                opcode: other,
                args: args.to_vec(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Acknowledgement
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Rejected,
}

impl AckStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Rejected => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Rejected),
            other => Err(FrameError::malformed_payload(
                "ack",
                format!("unknown status {}", other),
            )),
        }
    }
}

/// End-to-end acknowledgement of a command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub acked: FrameId,
    pub status: AckStatus,
    pub state: Option<DeviceState>,
}

impl AckPayload {
    pub fn ok(acked: FrameId, state: Option<DeviceState>) -> Self {
        Self {
            acked,
            status: AckStatus::Ok,
            state,
        }
    }

    pub fn rejected(acked: FrameId) -> Self {
        Self {
            acked,
            status: AckStatus::Rejected,
            state: None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7);
        out.extend_from_slice(&self.acked.value().to_le_bytes());
        out.push(self.status.to_byte());
        if let Some(state) = self.state {
            out.extend_from_slice(&state.to_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != 5 && bytes.len() != 7 {
            return Err(FrameError::malformed_payload(
                "ack",
                format!("expected 5 or 7 bytes, got {}", bytes.len()),
            ));
        }
        let acked = FrameId::new(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        let status = AckStatus::from_byte(bytes[4])?;
        let state = if bytes.len() == 7 {
            Some(DeviceState::from_bytes(&bytes[5..7])?)
        } else {
            None
        };
        Ok(Self {
            acked,
            status,
            state,
        })
    }
}

// ----------------------------------------------------------------------------
// Discovery Beacon
// ----------------------------------------------------------------------------

/// One-hop presence announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    pub role: NodeRole,
    pub capabilities: u8,
    pub name: String,
}

impl DiscoveryBeacon {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Truncation happens on a char boundary so the name stays valid UTF-8.
        let mut end = self.name.len().min(MAX_NAME_LEN);
        while !self.name.is_char_boundary(end) {
            end -= 1;
        }
        let name = &self.name.as_bytes()[..end];
        let mut out = Vec::with_capacity(3 + name.len());
        out.push(self.role.to_byte());
        out.push(self.capabilities);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let [role, capabilities, name_len, name @ ..] = bytes else {
            return Err(FrameError::malformed_payload("discovery", "header truncated"));
        };
        let role = NodeRole::from_byte(*role).ok_or_else(|| {
            FrameError::malformed_payload("discovery", format!("unknown role {}", role))
        })?;
        let name_len = *name_len as usize;
        if name_len > MAX_NAME_LEN || name.len() != name_len {
            return Err(FrameError::malformed_payload(
                "discovery",
                format!("name length {} does not match {} bytes", name_len, name.len()),
            ));
        }
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| FrameError::malformed_payload("discovery", "name is not UTF-8"))?;
        Ok(Self {
            role,
            capabilities: *capabilities,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_uses_vendor_opcode_layout() {
        let command = CommandPayload::Control {
            on: true,
            brightness: 80,
        };
        assert_eq!(command.to_bytes(), vec![0x82, 0x02, 0x01, 80]);
        assert_eq!(CommandPayload::from_bytes(&command.to_bytes()).unwrap(), command);
    }

    #[test]
    fn test_query_and_heartbeat_have_no_arguments() {
        assert_eq!(CommandPayload::Query.to_bytes(), vec![0x82, 0x01]);
        assert_eq!(CommandPayload::Heartbeat.to_bytes(), vec![0x00, 0x00]);
        assert_eq!(
            CommandPayload::from_bytes(&[0x00, 0x00]).unwrap(),
            CommandPayload::Heartbeat
        );
    }

    #[test]
    fn test_unknown_opcode_stays_raw() {
        let parsed = CommandPayload::from_bytes(&[0x12, 0x34, 0xAA]).unwrap();
        assert_eq!(
            parsed,
            CommandPayload::Raw {
                opcode: 0x1234,
                args: vec![0xAA]
            }
        );
        assert_eq!(parsed.to_bytes(), vec![0x12, 0x34, 0xAA]);
    }

    #[test]
    fn test_truncated_commands_are_malformed() {
        assert!(CommandPayload::from_bytes(&[0x82]).is_err());
        assert!(CommandPayload::from_bytes(&[0x82, 0x02, 0x01]).is_err());
    }

    #[test]
    fn test_ack_with_and_without_state() {
        let bare = AckPayload::ok(FrameId::new(42), None);
        assert_eq!(bare.to_bytes(), vec![42, 0, 0, 0, 0]);

        let with_state = AckPayload::ok(FrameId::new(42), Some(DeviceState::new(true, 50)));
        assert_eq!(with_state.to_bytes(), vec![42, 0, 0, 0, 0, 1, 50]);
        assert_eq!(AckPayload::from_bytes(&with_state.to_bytes()).unwrap(), with_state);

        let rejected = AckPayload::rejected(FrameId::new(1));
        assert_eq!(AckPayload::from_bytes(&rejected.to_bytes()).unwrap(), rejected);

        assert!(AckPayload::from_bytes(&[1, 0, 0, 0]).is_err());
        assert!(AckPayload::from_bytes(&[1, 0, 0, 0, 7]).is_err());
    }

    #[test]
    fn test_beacon_name_is_bounded() {
        let beacon = DiscoveryBeacon {
            role: NodeRole::Device,
            capabilities: 0x03,
            name: "x".repeat(40),
        };
        let bytes = beacon.to_bytes();
        assert_eq!(bytes.len(), 3 + MAX_NAME_LEN);
        let parsed = DiscoveryBeacon::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.name.len(), MAX_NAME_LEN);
        assert_eq!(parsed.role, NodeRole::Device);
    }

    #[test]
    fn test_beacon_rejects_inconsistent_length() {
        assert!(DiscoveryBeacon::from_bytes(&[1, 0, 5, b'a']).is_err());
        assert!(DiscoveryBeacon::from_bytes(&[9, 0, 0]).is_err());
        assert!(DiscoveryBeacon::from_bytes(&[1]).is_err());
    }
}
