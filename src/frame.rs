//! On-wire FEC frame format.
//!
//! Every frame is a fixed 25-byte header followed by the block payload. All
//! integers are big-endian. One frame maps to exactly one transport payload;
//! frames are never fragmented.
//!
//! ```text
//! ┌──────────┬──────────┬─────────────┬──────────────┬─────────────┬──────────┬─────────┐
//! │ type     │ group_id │ block_index │ total_blocks │ payload_len │ reserved │ payload │
//! │ (1B)     │ (8B)     │ (4B)        │ (4B)         │ (4B)        │ (4B)     │ (L)     │
//! └──────────┴──────────┴─────────────┴──────────────┴─────────────┴──────────┴─────────┘
//! ```
//!
//! The reserved bytes are written as zero and ignored on parse.

use crate::{Error, Result};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 25;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Source data block (index `0..k`).
    Source = 0xF0,
    /// Repair block (index `k..k+m`).
    Repair = 0xF1,
}

impl FrameType {
    /// Parse the frame type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xF0 => Some(Self::Source),
            0xF1 => Some(Self::Repair),
            _ => None,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Source or repair.
    pub frame_type: FrameType,
    /// Encoding group this block belongs to.
    pub group_id: u64,
    /// Position of the block within the group, `0..total_blocks`.
    pub block_index: u32,
    /// Total blocks in the group (`k + m`).
    pub total_blocks: u32,
    /// Payload length in bytes; equals the group's block size for
    /// well-formed frames.
    pub payload_length: u32,
}

/// A complete FEC frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl FecFrame {
    /// Build a source frame.
    pub fn source(group_id: u64, block_index: u32, total_blocks: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                frame_type: FrameType::Source,
                group_id,
                block_index,
                total_blocks,
                payload_length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Build a repair frame.
    pub fn repair(group_id: u64, block_index: u32, total_blocks: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                frame_type: FrameType::Repair,
                group_id,
                block_index,
                total_blocks,
                payload_length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Whether this frame carries original stream data.
    pub fn is_source(&self) -> bool {
        self.header.frame_type == FrameType::Source
    }

    /// Whether this frame carries redundancy.
    pub fn is_repair(&self) -> bool {
        self.header.frame_type == FrameType::Repair
    }

    /// Total serialized size.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload into a fresh buffer. Infallible for a
    /// well-formed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.push(self.header.frame_type as u8);
        buf.extend_from_slice(&self.header.group_id.to_be_bytes());
        buf.extend_from_slice(&self.header.block_index.to_be_bytes());
        buf.extend_from_slice(&self.header.total_blocks.to_be_bytes());
        buf.extend_from_slice(&self.header.payload_length.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]); // reserved
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a frame from raw bytes.
    ///
    /// Trailing bytes beyond `HEADER_LEN + payload_length` are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::ShortHeader(data.len()));
        }

        let frame_type = FrameType::from_u8(data[0]).ok_or(Error::UnknownFrameType(data[0]))?;
        let group_id = u64::from_be_bytes(data[1..9].try_into().unwrap());
        let block_index = u32::from_be_bytes(data[9..13].try_into().unwrap());
        let total_blocks = u32::from_be_bytes(data[13..17].try_into().unwrap());
        let payload_length = u32::from_be_bytes(data[17..21].try_into().unwrap());
        // data[21..25] reserved: accepted, ignored.

        let end = HEADER_LEN + payload_length as usize;
        if data.len() < end {
            return Err(Error::ShortPayload {
                expected: end,
                have: data.len(),
            });
        }

        Ok(Self {
            header: FrameHeader {
                frame_type,
                group_id,
                block_index,
                total_blocks,
                payload_length,
            },
            payload: data[HEADER_LEN..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0xF0), Some(FrameType::Source));
        assert_eq!(FrameType::from_u8(0xF1), Some(FrameType::Repair));
        assert_eq!(FrameType::from_u8(0x08), None);
        assert_eq!(FrameType::from_u8(0x00), None);
    }

    #[test]
    fn test_roundtrip_source_frame() {
        let frame = FecFrame::source(42, 3, 6, vec![1, 2, 3, 4, 5]);
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(FecFrame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_repair_frame_large_ids() {
        let frame = FecFrame::repair(0xDEAD_BEEF, 7, 10, vec![0xAA; 1200]);
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), 25 + 1200);
        let parsed = FecFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.is_repair());
        assert!(!parsed.is_source());
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let frame = FecFrame::source(0x0102030405060708, 0x0A0B0C0D, 0x01020304, vec![]);
        let bytes = frame.serialize();
        assert_eq!(bytes[0], 0xF0);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[9..13], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[13..17], &[1, 2, 3, 4]);
        assert_eq!(&bytes[17..21], &[0, 0, 0, 0]);
        assert_eq!(&bytes[21..25], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_short_header() {
        assert_eq!(FecFrame::parse(&[0xF0; 24]), Err(Error::ShortHeader(24)));
        assert_eq!(FecFrame::parse(&[]), Err(Error::ShortHeader(0)));
    }

    #[test]
    fn test_short_payload() {
        let frame = FecFrame::source(1, 0, 6, vec![0u8; 100]);
        let bytes = frame.serialize();
        assert_eq!(
            FecFrame::parse(&bytes[..HEADER_LEN + 50]),
            Err(Error::ShortPayload {
                expected: HEADER_LEN + 100,
                have: HEADER_LEN + 50,
            })
        );
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut bytes = FecFrame::source(1, 0, 6, vec![0u8; 8]).serialize();
        bytes[0] = 0x08;
        assert_eq!(FecFrame::parse(&bytes), Err(Error::UnknownFrameType(0x08)));
    }

    #[test]
    fn test_nonzero_reserved_accepted_and_ignored() {
        let frame = FecFrame::source(9, 1, 6, vec![7u8; 16]);
        let mut bytes = frame.serialize();
        bytes[21..25].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(FecFrame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let frame = FecFrame::source(5, 2, 6, vec![9u8; 10]);
        let mut bytes = frame.serialize();
        bytes.extend_from_slice(&[0xFF; 7]);
        assert_eq!(FecFrame::parse(&bytes).unwrap(), frame);
    }
}
