//! Wire formats: negotiate request/response and the data transfer header.
//!
//! All multi-byte fields are little-endian.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The only protocol version this transport speaks.
pub const PROTOCOL_VERSION_1: u16 = 0x0100;

pub const NEGOTIATE_REQUEST_SIZE: usize = 20;
pub const NEGOTIATE_RESPONSE_SIZE: usize = 28;

/// Data transfer header up to (not including) the padding field.
pub const EMPTY_HEADER_SIZE: usize = 20;
/// Data transfer header including padding; payload starts here.
pub const DATA_HEADER_SIZE: usize = 24;

/// Data transfer flag: the sender wants an immediate reply.
pub const FLAG_RESPONSE_REQUESTED: u16 = 0x0001;

pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NOT_SUPPORTED: u16 = 0x00BB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateRequest {
    pub min_version: u16,
    pub max_version: u16,
    pub credits_requested: u16,
    pub preferred_send_size: u32,
    pub max_receive_size: u32,
    pub max_fragmented_size: u32,
}

impl NegotiateRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NEGOTIATE_REQUEST_SIZE);
        buf.put_u16_le(self.min_version);
        buf.put_u16_le(self.max_version);
        buf.put_u16_le(0);
        buf.put_u16_le(self.credits_requested);
        buf.put_u32_le(self.preferred_send_size);
        buf.put_u32_le(self.max_receive_size);
        buf.put_u32_le(self.max_fragmented_size);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < NEGOTIATE_REQUEST_SIZE {
            return None;
        }
        let min_version = src.get_u16_le();
        let max_version = src.get_u16_le();
        src.advance(2);
        Some(Self {
            min_version,
            max_version,
            credits_requested: src.get_u16_le(),
            preferred_send_size: src.get_u32_le(),
            max_receive_size: src.get_u32_le(),
            max_fragmented_size: src.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateResponse {
    pub min_version: u16,
    pub max_version: u16,
    pub negotiated_version: u16,
    pub credits_requested: u16,
    pub credits_granted: u16,
    pub status: u16,
    pub max_readwrite_size: u32,
    pub preferred_send_size: u32,
    pub max_receive_size: u32,
    pub max_fragmented_size: u32,
}

impl NegotiateResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NEGOTIATE_RESPONSE_SIZE);
        buf.put_u16_le(self.min_version);
        buf.put_u16_le(self.max_version);
        buf.put_u16_le(self.negotiated_version);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.credits_requested);
        buf.put_u16_le(self.credits_granted);
        buf.put_u32_le(self.max_readwrite_size);
        buf.put_u32_le(self.preferred_send_size);
        buf.put_u32_le(self.max_receive_size);
        buf.put_u32_le(self.max_fragmented_size);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < NEGOTIATE_RESPONSE_SIZE {
            return None;
        }
        let min_version = src.get_u16_le();
        let max_version = src.get_u16_le();
        Some(Self {
            min_version,
            max_version,
            negotiated_version: src.get_u16_le(),
            status: src.get_u16_le(),
            credits_requested: src.get_u16_le(),
            credits_granted: src.get_u16_le(),
            max_readwrite_size: src.get_u32_le(),
            preferred_send_size: src.get_u32_le(),
            max_receive_size: src.get_u32_le(),
            max_fragmented_size: src.get_u32_le(),
        })
    }
}

/// Header of every post-negotiation packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransferHeader {
    pub credits_requested: u16,
    pub credits_granted: u16,
    pub flags: u16,
    pub remaining_data_length: u32,
    pub data_length: u32,
    pub data_offset: u32,
}

impl DataTransferHeader {
    /// Header for a packet carrying `data_length` payload bytes.
    pub fn new(credits_requested: u16, credits_granted: u16, flags: u16, data_length: u32, remaining: u32) -> Self {
        Self {
            credits_requested,
            credits_granted,
            flags,
            remaining_data_length: remaining,
            data_length,
            data_offset: if data_length > 0 { DATA_HEADER_SIZE as u32 } else { 0 },
        }
    }

    /// Bytes this header occupies on the wire; padding only exists in front of payload.
    #[inline]
    pub fn wire_len(&self) -> usize {
        if self.data_length > 0 {
            DATA_HEADER_SIZE
        } else {
            EMPTY_HEADER_SIZE
        }
    }

    #[inline]
    pub fn response_requested(&self) -> bool {
        self.flags & FLAG_RESPONSE_REQUESTED != 0
    }

    /// Append the header to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u16_le(self.credits_requested);
        dst.put_u16_le(self.credits_granted);
        dst.put_u16_le(self.flags);
        dst.put_u16_le(0);
        dst.put_u32_le(self.remaining_data_length);
        dst.put_u32_le(self.data_length);
        dst.put_u32_le(self.data_offset);
        if self.data_length > 0 {
            dst.put_u32_le(0);
        }
    }

    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < EMPTY_HEADER_SIZE {
            return None;
        }
        let credits_requested = src.get_u16_le();
        let credits_granted = src.get_u16_le();
        let flags = src.get_u16_le();
        src.advance(2);
        Some(Self {
            credits_requested,
            credits_granted,
            flags,
            remaining_data_length: src.get_u32_le(),
            data_length: src.get_u32_le(),
            data_offset: src.get_u32_le(),
        })
    }
}

/// Check a received data packet against the bytes actually received and the
/// fragmented-message ceiling, reporting the first violation found.
pub fn validate_data_packet(packet: &[u8], max_fragmented: u32) -> Result<DataTransferHeader> {
    let violation = |reason: String| Err(Error::ProtocolViolation(reason));
    let Some(header) = DataTransferHeader::decode(packet) else {
        return violation(format!("packet of {} bytes shorter than header", packet.len()));
    };

    let received = packet.len() as u64;
    let offset = header.data_offset as u64;
    let length = header.data_length as u64;
    let remaining = header.remaining_data_length as u64;

    if length > 0 {
        if offset < EMPTY_HEADER_SIZE as u64 {
            return violation(format!("data_offset {offset} overlaps header"));
        }
        if offset > received || offset + length > received {
            return violation(format!(
                "data_offset {offset} + data_length {length} exceeds {received} received bytes"
            ));
        }
    }

    let ceiling = max_fragmented as u64;
    if length > ceiling || remaining > ceiling || length + remaining > ceiling {
        return violation(format!(
            "data_length {length} + remaining {remaining} exceeds fragmented ceiling {ceiling}"
        ));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_request_layout() {
        let req = NegotiateRequest {
            min_version: PROTOCOL_VERSION_1,
            max_version: PROTOCOL_VERSION_1,
            credits_requested: 255,
            preferred_send_size: 1364,
            max_receive_size: 1364,
            max_fragmented_size: 1024 * 1024,
        };
        let wire = req.encode();
        assert_eq!(wire.len(), NEGOTIATE_REQUEST_SIZE);
        assert_eq!(&wire[..8], &[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0xff, 0x00]);
        assert_eq!(&wire[8..12], &1364u32.to_le_bytes());
        assert_eq!(NegotiateRequest::decode(&wire), Some(req));
        assert_eq!(NegotiateRequest::decode(&wire[..19]), None);
    }

    #[test]
    fn test_negotiate_response_field_offsets() {
        let resp = NegotiateResponse {
            min_version: PROTOCOL_VERSION_1,
            max_version: PROTOCOL_VERSION_1,
            negotiated_version: PROTOCOL_VERSION_1,
            credits_requested: 128,
            credits_granted: 64,
            status: STATUS_SUCCESS,
            max_readwrite_size: 1 << 20,
            preferred_send_size: 1024,
            max_receive_size: 2048,
            max_fragmented_size: 256 * 1024,
        };
        let wire = resp.encode();
        assert_eq!(wire.len(), NEGOTIATE_RESPONSE_SIZE);
        assert_eq!(u16::from_le_bytes([wire[6], wire[7]]), STATUS_SUCCESS);
        assert_eq!(u16::from_le_bytes([wire[8], wire[9]]), 128);
        assert_eq!(u16::from_le_bytes([wire[10], wire[11]]), 64);
        assert_eq!(u32::from_le_bytes([wire[12], wire[13], wire[14], wire[15]]), 1 << 20);
        assert_eq!(u32::from_le_bytes([wire[20], wire[21], wire[22], wire[23]]), 2048);
        assert_eq!(NegotiateResponse::decode(&wire), Some(resp));
    }

    #[test]
    fn test_data_header_sizes() {
        let mut buf = BytesMut::new();
        DataTransferHeader::new(255, 3, 0, 0, 0).encode_into(&mut buf);
        assert_eq!(buf.len(), EMPTY_HEADER_SIZE);

        let mut buf = BytesMut::new();
        let header = DataTransferHeader::new(255, 0, FLAG_RESPONSE_REQUESTED, 1340, 3660);
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_SIZE);
        assert_eq!(&buf[8..12], &3660u32.to_le_bytes());
        assert_eq!(&buf[12..16], &1340u32.to_le_bytes());
        assert_eq!(&buf[16..20], &(DATA_HEADER_SIZE as u32).to_le_bytes());
        let decoded = DataTransferHeader::decode(&buf).unwrap();
        assert_eq!(decoded.data_offset, DATA_HEADER_SIZE as u32);
        assert_eq!(decoded.remaining_data_length, 3660);
        assert!(decoded.response_requested());
    }

    fn packet(data_offset: u32, data_length: u32, remaining: u32, actual_payload: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut header = DataTransferHeader::new(1, 0, 0, data_length, remaining);
        header.data_offset = data_offset;
        header.encode_into(&mut buf);
        if data_length == 0 {
            buf.put_u32_le(0);
        }
        buf.extend_from_slice(&vec![0xab; actual_payload]);
        buf.to_vec()
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let pkt = packet(24, 100, 900, 100);
        let header = validate_data_packet(&pkt, 1024).unwrap();
        assert_eq!(header.data_length, 100);
    }

    #[test]
    fn test_validate_rejects_length_beyond_received() {
        let pkt = packet(24, 200, 0, 100);
        assert!(matches!(
            validate_data_packet(&pkt, 1 << 20),
            Err(Error::ProtocolViolation(reason)) if reason.contains("exceeds 124 received bytes")
        ));
        let pkt = packet(4096, 10, 0, 100);
        assert!(validate_data_packet(&pkt, 1 << 20).is_err());
    }

    #[test]
    fn test_validate_rejects_ceiling_violations() {
        let pkt = packet(24, 100, 1000, 100);
        assert!(validate_data_packet(&pkt, 1024).is_err());
        let pkt = packet(24, 100, u32::MAX, 100);
        assert!(validate_data_packet(&pkt, u32::MAX).is_err());
    }

    #[test]
    fn test_validate_rejects_truncated_and_overlapping() {
        assert!(validate_data_packet(&[0u8; 12], 1024).is_err());
        let pkt = packet(8, 4, 0, 16);
        assert!(validate_data_packet(&pkt, 1024).is_err());
    }
}
