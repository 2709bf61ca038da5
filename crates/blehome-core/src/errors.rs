//! Error types for the BLEHome mesh protocol
//!
//! Frame decoding, link and configuration failures each have their own enum;
//! `BlehomeError` unifies them for callers of the public API.

use crate::types::{FrameId, MeshAddress};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Reasons a byte buffer is not an acceptable frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes, need at least {expected}")]
    TooShort { expected: usize, actual: usize },
    #[error("Bad magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Declared payload length {declared} does not match {actual} bytes on the wire")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Unknown payload type 0x{0:02x}")]
    UnknownPayloadType(u8),
    #[error("Integrity tag mismatch")]
    IntegrityMismatch,
    #[error("Network key rejected by the integrity function")]
    InvalidKey,
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },
}

impl FrameError {
    pub fn malformed_payload(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            reason: reason.into(),
        }
    }
}

/// Link-layer failures reported by a `GattLink` implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Link to {peer} is not connected")]
    NotConnected { peer: MeshAddress },
    #[error("Write to {peer} failed: {reason}")]
    WriteFailed { peer: MeshAddress, reason: String },
    #[error("Link to {peer} was lost")]
    Lost { peer: MeshAddress },
}

/// Configuration values that cannot work together
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid mesh address: {value}")]
    InvalidAddress { value: String },
    #[error("Invalid network key: {reason}")]
    InvalidNetworkKey { reason: String },
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BlehomeError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Link to {peer} lost")]
    LinkLost { peer: MeshAddress },

    #[error("Command {frame_id} to {destination} timed out after {attempts} attempts")]
    CommandTimeout {
        frame_id: FrameId,
        destination: MeshAddress,
        attempts: u32,
    },

    #[error("Command {frame_id} was cancelled")]
    CommandCancelled { frame_id: FrameId },

    #[error("Command {frame_id} is already outstanding")]
    DuplicateCommand { frame_id: FrameId },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl BlehomeError {
    pub fn channel_error(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn config_error(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigError::invalid_value(field, reason))
    }

    /// Whether the caller may reasonably try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LinkLost { .. } | Self::Link(_) | Self::Transport { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, BlehomeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_convert_into_malformed_frame() {
        let error: BlehomeError = FrameError::BadMagic(0x42).into();
        assert!(matches!(error, BlehomeError::MalformedFrame(FrameError::BadMagic(0x42))));
        assert_eq!(error.to_string(), "Malformed frame: Bad magic byte 0x42");
    }

    #[test]
    fn test_timeouts_are_terminal() {
        let timeout = BlehomeError::CommandTimeout {
            frame_id: FrameId::new(7),
            destination: MeshAddress::new(3),
            attempts: 3,
        };
        assert!(!timeout.is_retryable());
        assert!(BlehomeError::LinkLost {
            peer: MeshAddress::new(2)
        }
        .is_retryable());
    }
}
