//! Peer wire messages.
//!
//! Two frame types cross the peer link: Info (0x58) carrying the full
//! progress struct, and Data (0x59) carrying an image payload chunk. Every
//! frame is length-prefixed and checksum-trailed:
//!
//! ```text
//! type:u8 | len:u16 | frame_number:u32 | payload | byte_sum:u32
//! ```
//!
//! All multi-byte integers are little-endian. The trailer is a wrapping
//! additive byte-sum over the payload — deliberately not a CRC, for wire
//! compatibility with deployed firmware.

use crate::error::{OtaError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MSG_INFO: u8 = 0x58;
pub const MSG_DATA: u8 = 0x59;

/// Hard cap on a frame payload.
pub const MAX_PAYLOAD: usize = 2048;

/// type + len + frame_number + trailing byte-sum.
pub const FRAME_OVERHEAD: usize = 1 + 2 + 4 + 4;

/// Serialized size of [`SyncInfo`].
pub const SYNC_INFO_SIZE: usize = 25;

/// Bit 31 of the declared size in the initial handshake: set when the
/// session is being created in response to a peer's Ready, making the
/// local device the Secondary. Never set on the wire.
pub const ROLE_BIT: u32 = 0x8000_0000;

/// Wrapping additive byte-sum — the wire trailer algorithm.
pub fn byte_sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ready = 1,
    Inquire = 2,
    FwCheck = 3,
    Halt = 4,
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Ready),
            2 => Some(Self::Inquire),
            3 => Some(Self::FwCheck),
            4 => Some(Self::Halt),
            _ => None,
        }
    }
}

// =============================================================================
// SyncInfo (Info payload)
// =============================================================================

/// Mirrored progress struct: each device keeps its own plus the last
/// validated copy the peer declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    /// Declared image size. Bit 31 is reserved for the role flag and kept
    /// clear on the wire.
    pub fw_size: u32,
    pub fw_ver: u32,
    /// Number of the last accepted data frame.
    pub cur_fn: u32,
    /// Byte-sum of the local persisted breakpoint record.
    pub bk_checksum: u32,
    pub unique_id: u32,
    /// Packet sequence number, advanced by handshake and every checkpoint.
    pub pn: u32,
    pub status: Status,
}

impl SyncInfo {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYNC_INFO_SIZE);
        buf.put_u32_le(self.fw_size & !ROLE_BIT);
        buf.put_u32_le(self.fw_ver);
        buf.put_u32_le(self.cur_fn);
        buf.put_u32_le(self.bk_checksum);
        buf.put_u32_le(self.unique_id);
        buf.put_u32_le(self.pn);
        buf.put_u8(self.status as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < SYNC_INFO_SIZE {
            return Err(OtaError::Parse("SyncInfo payload too short".into()));
        }
        let fw_size = payload.get_u32_le();
        let fw_ver = payload.get_u32_le();
        let cur_fn = payload.get_u32_le();
        let bk_checksum = payload.get_u32_le();
        let unique_id = payload.get_u32_le();
        let pn = payload.get_u32_le();
        let status = Status::from_u8(payload.get_u8())
            .ok_or_else(|| OtaError::Parse("unknown status".into()))?;
        Ok(Self {
            fw_size,
            fw_ver,
            cur_fn,
            bk_checksum,
            unique_id,
            pn,
            status,
        })
    }
}

// =============================================================================
// Frames
// =============================================================================

/// A validated inbound frame. Borrows the receive buffer — inbound
/// parsing allocates nothing per message.
#[derive(Debug, Clone)]
pub enum Frame<'a> {
    Info(SyncInfo),
    Data { frame_number: u32, payload: &'a [u8] },
}

fn encode_frame(msg_type: u8, frame_number: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u8(msg_type);
    buf.put_u16_le(payload.len() as u16);
    buf.put_u32_le(frame_number);
    buf.put_slice(payload);
    buf.put_u32_le(byte_sum(payload));
    buf.freeze()
}

/// Encode an Info frame. The frame-number field carries the sender's
/// packet sequence number (0 for Halt and FwCheck notifications).
pub fn encode_info(info: &SyncInfo, seq: u32) -> Bytes {
    encode_frame(MSG_INFO, seq, &info.encode())
}

/// Encode a Data frame carrying one image payload chunk.
pub fn encode_data(frame_number: u32, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    encode_frame(MSG_DATA, frame_number, payload)
}

/// Parse and validate a raw frame: known type, declared length within
/// `max_payload` and consistent with the buffer, byte-sum trailer intact.
pub fn decode_frame(raw: &[u8], max_payload: usize) -> Result<Frame<'_>> {
    if raw.len() < FRAME_OVERHEAD {
        return Err(OtaError::Parse("frame too short".into()));
    }
    let mut head = &raw[..7];
    let msg_type = head.get_u8();
    let len = head.get_u16_le() as usize;
    let frame_number = head.get_u32_le();

    if len > max_payload {
        return Err(OtaError::Parse(format!("payload length {len} over limit")));
    }
    if raw.len() != FRAME_OVERHEAD + len {
        return Err(OtaError::Parse(format!(
            "frame length mismatch: declared {len}, have {}",
            raw.len().saturating_sub(FRAME_OVERHEAD)
        )));
    }

    let payload = &raw[7..7 + len];
    let mut trailer = &raw[7 + len..];
    let declared_sum = trailer.get_u32_le();
    let computed = byte_sum(payload);
    if computed != declared_sum {
        return Err(OtaError::Parse(format!(
            "byte-sum mismatch: declared {declared_sum:#010x}, computed {computed:#010x}"
        )));
    }

    match msg_type {
        MSG_INFO => {
            if payload.len() != SYNC_INFO_SIZE {
                return Err(OtaError::Parse(format!(
                    "Info payload is {} bytes, expected {SYNC_INFO_SIZE}",
                    payload.len()
                )));
            }
            Ok(Frame::Info(SyncInfo::decode(payload)?))
        }
        MSG_DATA => Ok(Frame::Data {
            frame_number,
            payload,
        }),
        other => Err(OtaError::Parse(format!("unknown frame type {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> SyncInfo {
        SyncInfo {
            fw_size: 0x2_0000,
            fw_ver: 0x0102_0304,
            cur_fn: 9,
            bk_checksum: 0x1234,
            unique_id: 0xCAFE,
            pn: 3,
            status: Status::Inquire,
        }
    }

    #[test]
    fn test_info_roundtrip() {
        let info = sample_info();
        let frame = encode_info(&info, info.pn);
        match decode_frame(&frame, MAX_PAYLOAD).unwrap() {
            Frame::Info(decoded) => assert_eq!(decoded, info),
            other => panic!("expected Info, got {other:?}"),
        }
    }

    #[test]
    fn test_data_roundtrip() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = encode_data(42, &payload);
        match decode_frame(&frame, MAX_PAYLOAD).unwrap() {
            Frame::Data {
                frame_number,
                payload: decoded,
            } => {
                assert_eq!(frame_number, 42);
                assert_eq!(decoded, payload.as_slice());
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut frame = encode_data(1, b"payload bytes").to_vec();
        frame[8] ^= 0x01;
        assert!(decode_frame(&frame, MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_data(1, b"payload bytes");
        assert!(decode_frame(&frame[..frame.len() - 2], MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; 64];
        let frame = encode_data(1, &payload);
        assert!(decode_frame(&frame, 32).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = encode_data(1, b"x").to_vec();
        frame[0] = 0x7F;
        assert!(decode_frame(&frame, MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_role_bit_masked_on_wire() {
        let mut info = sample_info();
        info.fw_size = 0x100 | ROLE_BIT;
        let frame = encode_info(&info, 0);
        match decode_frame(&frame, MAX_PAYLOAD).unwrap() {
            Frame::Info(decoded) => assert_eq!(decoded.fw_size, 0x100),
            other => panic!("expected Info, got {other:?}"),
        }
    }

    #[test]
    fn test_byte_sum_wraps() {
        let data = vec![0xFFu8; 32];
        assert_eq!(byte_sum(&data), 32 * 0xFF);
    }
}
