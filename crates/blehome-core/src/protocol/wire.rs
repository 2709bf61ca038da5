//! Binary encoding of mesh frames and link acknowledgements
//!
//! All multi-byte integers are little-endian. A frame is a fixed 14 byte
//! header, up to `MAX_PAYLOAD_LEN` payload bytes and a 4 byte integrity tag
//! (HMAC-SHA256 over header and payload, truncated). The tag covers the TTL,
//! so relays re-seal every frame they forward.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::NetworkKey;
use crate::errors::FrameError;
use crate::protocol::frame::{Frame, PayloadType, MAX_PAYLOAD_LEN};
use crate::types::{FrameId, FrameKey, MeshAddress, Ttl};

type HmacSha256 = Hmac<Sha256>;

pub const FRAME_MAGIC: u8 = 0xA5;
pub const LINK_ACK_MAGIC: u8 = 0x5A;
pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 14;
pub const TAG_LEN: usize = 4;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TAG_LEN;
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + TAG_LEN;
pub const LINK_ACK_LEN: usize = 7;

/// What a received buffer claims to be, judged by its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Frame,
    LinkAck,
}

impl WireKind {
    pub fn classify(bytes: &[u8]) -> Option<Self> {
        match bytes.first() {
            Some(&FRAME_MAGIC) => Some(Self::Frame),
            Some(&LINK_ACK_MAGIC) => Some(Self::LinkAck),
            _ => None,
        }
    }
}

/// Frame codec bound to one network key
#[derive(Debug, Clone)]
pub struct WireFormat {
    key: NetworkKey,
}

impl WireFormat {
    pub fn new(key: NetworkKey) -> Self {
        Self { key }
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + payload_len + TAG_LEN);
        out.push(FRAME_MAGIC);
        out.push((PROTOCOL_VERSION << 4) | (frame.payload_type.as_u8() & 0x0F));
        out.extend_from_slice(&frame.origin.to_le_bytes());
        out.extend_from_slice(&frame.destination.to_le_bytes());
        out.extend_from_slice(&frame.frame_id.value().to_le_bytes());
        out.push(frame.ttl.value());
        out.extend_from_slice(&frame.sequence.to_le_bytes());
        out.push(payload_len as u8);
        out.extend_from_slice(&frame.payload);

        let tag = self.seal(&out)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort {
                expected: MIN_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != FRAME_MAGIC {
            return Err(FrameError::BadMagic(bytes[0]));
        }
        let version = bytes[1] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let declared = bytes[13] as usize;
        let actual = bytes.len() - HEADER_LEN - TAG_LEN;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }
        if declared > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                size: declared,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let payload_type = PayloadType::try_from(bytes[1] & 0x0F)?;

        let body_end = HEADER_LEN + declared;
        self.verify(&bytes[..body_end], &bytes[body_end..])?;

        Ok(Frame {
            frame_id: FrameId::new(u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]])),
            origin: MeshAddress::from_le_bytes([bytes[2], bytes[3]]),
            destination: MeshAddress::from_le_bytes([bytes[4], bytes[5]]),
            ttl: Ttl::new(bytes[10]),
            sequence: u16::from_le_bytes([bytes[11], bytes[12]]),
            payload_type,
            payload: bytes[HEADER_LEN..body_end].to_vec(),
        })
    }

    /// Per-hop receipt for the frame identified by `key`
    pub fn encode_link_ack(key: FrameKey) -> [u8; LINK_ACK_LEN] {
        let mut out = [0u8; LINK_ACK_LEN];
        out[0] = LINK_ACK_MAGIC;
        out[1..3].copy_from_slice(&key.origin.to_le_bytes());
        out[3..7].copy_from_slice(&key.frame_id.value().to_le_bytes());
        out
    }

    pub fn decode_link_ack(bytes: &[u8]) -> Result<FrameKey, FrameError> {
        if bytes.len() < LINK_ACK_LEN {
            return Err(FrameError::TooShort {
                expected: LINK_ACK_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != LINK_ACK_MAGIC {
            return Err(FrameError::BadMagic(bytes[0]));
        }
        if bytes.len() != LINK_ACK_LEN {
            return Err(FrameError::LengthMismatch {
                declared: LINK_ACK_LEN,
                actual: bytes.len(),
            });
        }
        Ok(FrameKey::new(
            MeshAddress::from_le_bytes([bytes[1], bytes[2]]),
            FrameId::new(u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]])),
        ))
    }

    fn mac(&self) -> Result<HmacSha256, FrameError> {
        HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|_| FrameError::InvalidKey)
    }

    fn seal(&self, body: &[u8]) -> Result<[u8; TAG_LEN], FrameError> {
        let mut mac = self.mac()?;
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        Ok(tag)
    }

    fn verify(&self, body: &[u8], tag: &[u8]) -> Result<(), FrameError> {
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_truncated_left(tag)
            .map_err(|_| FrameError::IntegrityMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> WireFormat {
        WireFormat::new(NetworkKey::default())
    }

    fn sample_frame() -> Frame {
        Frame::new(
            FrameId::new(0x0102_0304),
            MeshAddress::new(0x0001),
            MeshAddress::new(0x0203),
            Ttl::new(4),
            PayloadType::Command,
            vec![0x82, 0x02, 0x01, 0x64],
        )
        .unwrap()
        .with_sequence(0x0506)
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let bytes = codec().encode(&sample_frame()).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 4 + TAG_LEN);
        assert_eq!(bytes[0], FRAME_MAGIC);
        assert_eq!(bytes[1], 0x11);
        assert_eq!(&bytes[2..4], &[0x01, 0x00]);
        assert_eq!(&bytes[4..6], &[0x03, 0x02]);
        assert_eq!(&bytes[6..10], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[10], 4);
        assert_eq!(&bytes[11..13], &[0x06, 0x05]);
        assert_eq!(bytes[13], 4);
        assert_eq!(&bytes[14..18], &[0x82, 0x02, 0x01, 0x64]);
    }

    #[test]
    fn test_decode_restores_every_field() {
        let frame = sample_frame();
        let decoded = codec().decode(&codec().encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_flipped_payload_bit_fails_integrity() {
        let mut bytes = codec().encode(&sample_frame()).unwrap();
        bytes[15] ^= 0x01;
        assert_eq!(codec().decode(&bytes), Err(FrameError::IntegrityMismatch));
    }

    #[test]
    fn test_ttl_is_covered_by_the_tag() {
        let mut bytes = codec().encode(&sample_frame()).unwrap();
        bytes[10] = 9;
        assert_eq!(codec().decode(&bytes), Err(FrameError::IntegrityMismatch));
    }

    #[test]
    fn test_other_network_key_is_rejected() {
        let bytes = codec().encode(&sample_frame()).unwrap();
        let stranger = WireFormat::new(NetworkKey::new([7u8; 16]));
        assert_eq!(stranger.decode(&bytes), Err(FrameError::IntegrityMismatch));
    }

    #[test]
    fn test_structural_errors_are_reported() {
        let bytes = codec().encode(&sample_frame()).unwrap();

        assert!(matches!(
            codec().decode(&bytes[..10]),
            Err(FrameError::TooShort { actual: 10, .. })
        ));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = 0x00;
        assert_eq!(codec().decode(&bad_magic), Err(FrameError::BadMagic(0x00)));

        let mut bad_version = bytes.clone();
        bad_version[1] = 0x21;
        assert_eq!(
            codec().decode(&bad_version),
            Err(FrameError::UnsupportedVersion(2))
        );

        let mut truncated = bytes.clone();
        truncated.pop();
        assert_eq!(
            codec().decode(&truncated),
            Err(FrameError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        );

        let mut unknown_type = bytes;
        unknown_type[1] = 0x1F;
        assert_eq!(
            codec().decode(&unknown_type),
            Err(FrameError::UnknownPayloadType(0x0F))
        );
    }

    #[test]
    fn test_empty_payload_is_legal() {
        let frame = Frame::new(
            FrameId::new(1),
            MeshAddress::new(5),
            MeshAddress::BROADCAST,
            Ttl::ZERO,
            PayloadType::Discovery,
            Vec::new(),
        )
        .unwrap();
        let bytes = codec().encode(&frame).unwrap();
        assert_eq!(bytes.len(), MIN_FRAME_LEN);
        assert_eq!(codec().decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_link_ack_layout() {
        let key = FrameKey::new(MeshAddress::new(0x0304), FrameId::new(42));
        let bytes = WireFormat::encode_link_ack(key);
        assert_eq!(bytes, [0x5A, 0x04, 0x03, 42, 0, 0, 0]);
        assert_eq!(WireFormat::decode_link_ack(&bytes).unwrap(), key);
        assert_eq!(WireKind::classify(&bytes), Some(WireKind::LinkAck));
        assert!(WireFormat::decode_link_ack(&bytes[..5]).is_err());
    }

    #[test]
    fn test_classify_by_first_byte() {
        assert_eq!(WireKind::classify(&[FRAME_MAGIC, 0]), Some(WireKind::Frame));
        assert_eq!(WireKind::classify(&[0x00]), None);
        assert_eq!(WireKind::classify(&[]), None);
    }
}
