//! Wire protocol for offers, requests and payload segments
//!
//! Every message starts with a 4-byte magic cookie and a 1-byte type tag,
//! followed by fixed-size fields in network byte order:
//!
//! ```text
//! Offer    [magic: u32][type: u8 = 2][udp_port: u16][tcp_port: u16]
//! Request  [magic: u32][type: u8 = 3][file_size: u64]
//! Payload  [magic: u32][type: u8 = 4][total_segments: u64][segment_index: u64][data...]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0xabcd_dcba;
pub const DISCOVERY_PORT: u16 = 39457;
/// Payload bytes carried by one UDP segment
pub const CHUNK_SIZE: usize = 1024;
/// TCP transfers read and write in blocks of this many chunks
pub const TCP_CHUNK_FACTOR: usize = 8;

pub const OFFER_LEN: usize = 9;
pub const REQUEST_LEN: usize = 13;
pub const PAYLOAD_HEADER_LEN: usize = 21;

const PREAMBLE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Offer = 0x2,
    Request = 0x3,
    Payload = 0x4,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x2 => Ok(MessageType::Offer),
            0x3 => Ok(MessageType::Request),
            0x4 => Ok(MessageType::Payload),
            other => Err(other),
        }
    }
}

/// Reason a buffer was rejected. Always recoverable: drop the datagram and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad magic cookie")]
    BadMagic,
    #[error("unexpected message type {got:#04x}, expected {expected:?}")]
    BadType { expected: MessageType, got: u8 },
    #[error("truncated message: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("oversized message: expected {expected} bytes, got {actual}")]
    Oversized { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub udp_port: u16,
    pub tcp_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub total_segments: u64,
    pub segment_index: u64,
}

/// Constants both ends must agree on. Built once and handed to the server
/// and client engines; never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub magic: u32,
    pub discovery_port: u16,
    pub chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            magic: MAGIC_COOKIE,
            discovery_port: DISCOVERY_PORT,
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl ProtocolConfig {
    pub fn codec(&self) -> Codec {
        Codec::new(self.magic)
    }

    /// Block size for TCP reads and writes
    pub fn tcp_chunk_size(&self) -> usize {
        self.chunk_size * TCP_CHUNK_FACTOR
    }

    /// Number of segments needed to carry `file_size` bytes
    pub fn total_segments(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }
}

/// Encoder/decoder bound to one magic cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    magic: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MAGIC_COOKIE)
    }
}

impl Codec {
    pub const fn new(magic: u32) -> Self {
        Self { magic }
    }

    pub fn encode_offer(&self, udp_port: u16, tcp_port: u16) -> [u8; OFFER_LEN] {
        let mut buf = [0u8; OFFER_LEN];
        self.write_preamble(&mut buf, MessageType::Offer);
        buf[5..7].copy_from_slice(&udp_port.to_be_bytes());
        buf[7..9].copy_from_slice(&tcp_port.to_be_bytes());
        buf
    }

    pub fn decode_offer(&self, buf: &[u8]) -> Result<Offer, DecodeError> {
        self.check_preamble(buf, MessageType::Offer)?;
        check_exact_len(buf, OFFER_LEN)?;
        Ok(Offer {
            udp_port: u16::from_be_bytes([buf[5], buf[6]]),
            tcp_port: u16::from_be_bytes([buf[7], buf[8]]),
        })
    }

    pub fn encode_request(&self, file_size: u64) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        self.write_preamble(&mut buf, MessageType::Request);
        buf[5..13].copy_from_slice(&file_size.to_be_bytes());
        buf
    }

    pub fn decode_request(&self, buf: &[u8]) -> Result<Request, DecodeError> {
        self.check_preamble(buf, MessageType::Request)?;
        check_exact_len(buf, REQUEST_LEN)?;
        Ok(Request {
            file_size: read_u64(&buf[5..13]),
        })
    }

    pub fn encode_payload_header(
        &self,
        total_segments: u64,
        segment_index: u64,
    ) -> [u8; PAYLOAD_HEADER_LEN] {
        let mut buf = [0u8; PAYLOAD_HEADER_LEN];
        self.write_payload_header(&mut buf, total_segments, segment_index);
        buf
    }

    /// Write a payload header into the front of `packet`.
    ///
    /// Panics if `packet` is shorter than [`PAYLOAD_HEADER_LEN`].
    pub fn write_payload_header(&self, packet: &mut [u8], total_segments: u64, segment_index: u64) {
        self.write_preamble(packet, MessageType::Payload);
        packet[5..13].copy_from_slice(&total_segments.to_be_bytes());
        packet[13..21].copy_from_slice(&segment_index.to_be_bytes());
    }

    /// Decode a payload segment, returning its header and the length of the
    /// filler that follows. The filler itself is never looked at.
    pub fn decode_payload(&self, buf: &[u8]) -> Result<(PayloadHeader, usize), DecodeError> {
        self.check_preamble(buf, MessageType::Payload)?;
        if buf.len() < PAYLOAD_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: PAYLOAD_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let header = PayloadHeader {
            total_segments: read_u64(&buf[5..13]),
            segment_index: read_u64(&buf[13..21]),
        };
        Ok((header, buf.len() - PAYLOAD_HEADER_LEN))
    }

    fn write_preamble(&self, buf: &mut [u8], msg_type: MessageType) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = msg_type as u8;
    }

    fn check_preamble(&self, buf: &[u8], expected: MessageType) -> Result<(), DecodeError> {
        // Compare whatever prefix we have first, so garbage is reported as
        // BadMagic even when it is also short.
        let magic = self.magic.to_be_bytes();
        if buf.iter().zip(magic.iter()).any(|(a, b)| a != b) {
            return Err(DecodeError::BadMagic);
        }
        if buf.len() < PREAMBLE_LEN {
            return Err(DecodeError::Truncated {
                needed: PREAMBLE_LEN,
                actual: buf.len(),
            });
        }
        match MessageType::try_from(buf[4]) {
            Ok(t) if t == expected => Ok(()),
            _ => Err(DecodeError::BadType {
                expected,
                got: buf[4],
            }),
        }
    }
}

fn check_exact_len(buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    match buf.len() {
        n if n < expected => Err(DecodeError::Truncated {
            needed: expected,
            actual: n,
        }),
        n if n > expected => Err(DecodeError::Oversized {
            expected,
            actual: n,
        }),
        _ => Ok(()),
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_roundtrip() {
        let codec = Codec::default();
        let buf = codec.encode_offer(40001, 40002);
        assert_eq!(buf.len(), OFFER_LEN);

        let offer = codec.decode_offer(&buf).unwrap();
        assert_eq!(offer.udp_port, 40001);
        assert_eq!(offer.tcp_port, 40002);
    }

    #[test]
    fn test_request_roundtrip() {
        let codec = Codec::default();
        let buf = codec.encode_request(1_000_000);
        assert_eq!(codec.decode_request(&buf).unwrap().file_size, 1_000_000);
    }

    #[test]
    fn test_payload_data_length() {
        let codec = Codec::default();
        let mut packet = vec![0xAAu8; PAYLOAD_HEADER_LEN + 300];
        codec.write_payload_header(&mut packet, 5, 4);

        let (header, data_len) = codec.decode_payload(&packet).unwrap();
        assert_eq!(header.total_segments, 5);
        assert_eq!(header.segment_index, 4);
        assert_eq!(data_len, 300);
    }

    #[test]
    fn test_bad_magic_rejected_by_every_decoder() {
        let codec = Codec::default();
        let buffers: [&[u8]; 4] = [
            &[0u8; 21],
            &[0xde, 0xad, 0xbe, 0xef, 0x02, 0, 1, 0, 2],
            &[0x00],
            b"hello world",
        ];

        for buf in buffers {
            assert_eq!(codec.decode_offer(buf), Err(DecodeError::BadMagic));
            assert_eq!(codec.decode_request(buf), Err(DecodeError::BadMagic));
            assert_eq!(
                codec.decode_payload(buf).map(|_| ()),
                Err(DecodeError::BadMagic)
            );
        }
    }

    #[test]
    fn test_wrong_type_rejected() {
        let codec = Codec::default();
        let request = codec.encode_request(9);
        assert!(matches!(
            codec.decode_offer(&request),
            Err(DecodeError::BadType {
                expected: MessageType::Offer,
                got: 0x3
            })
        ));
    }

    #[test]
    fn test_truncated_and_oversized() {
        let codec = Codec::default();
        let offer = codec.encode_offer(1, 2);
        assert!(matches!(
            codec.decode_offer(&offer[..7]),
            Err(DecodeError::Truncated { needed: 9, actual: 7 })
        ));
        assert!(matches!(
            codec.decode_offer(&offer[..3]),
            Err(DecodeError::Truncated { .. })
        ));

        let mut long = offer.to_vec();
        long.push(0);
        assert!(matches!(
            codec.decode_offer(&long),
            Err(DecodeError::Oversized { expected: 9, actual: 10 })
        ));

        let header = codec.encode_payload_header(1, 0);
        assert!(matches!(
            codec.decode_payload(&header[..20]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_custom_magic_isolated() {
        let ours = Codec::new(0x1234_5678);
        let theirs = Codec::default();
        let buf = theirs.encode_offer(1, 2);
        assert_eq!(ours.decode_offer(&buf), Err(DecodeError::BadMagic));
    }

    #[test]
    fn test_total_segments() {
        let config = ProtocolConfig::default();
        assert_eq!(config.total_segments(5000), 5);
        assert_eq!(config.total_segments(1024), 1);
        assert_eq!(config.total_segments(1025), 2);
        assert_eq!(config.total_segments(1), 1);
        assert_eq!(config.tcp_chunk_size(), 8192);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }
}
