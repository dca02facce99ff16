//! Wire format constants and the fixed frame header.
//!
//! Every request frame has the same size:
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────┐
//! │ Type     │ Payload size │ Body                     │
//! │ uint32 LE│ uint32 LE    │ CHUNK_SIZE bytes         │
//! └──────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! The body holds the fixed fields of the message variant, or the raw bytes
//! of a payload chunk. Replies are a separate fixed-size record:
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ Status or length │ Text                      │
//! │ uint32 LE        │ MAX_REPLY_LEN bytes       │
//! └──────────────────┴───────────────────────────┘
//! ```

use crate::error::{EpmapError, Result};

/// Bytes of payload carried by one chunk frame.
pub const CHUNK_SIZE: usize = 1024;

/// Size of the type + payload size prefix of every request frame.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Size of every request frame (header or chunk).
pub const MESSAGE_SIZE: usize = FRAME_HEADER_SIZE + CHUNK_SIZE;

/// Maximum length of the text carried in a reply.
pub const MAX_REPLY_LEN: usize = 512;

/// Size of every reply frame.
pub const REPLY_SIZE: usize = 4 + MAX_REPLY_LEN;

/// Size of the fixed protocol sequence field of a resolve request.
pub const MAX_PROTSEQ_LEN: usize = 64;

/// Largest trailing payload a server will assemble (1 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 1 << 20;

/// Status word for a successful register/unregister/liveness.
pub const STATUS_OK: u32 = 0;

/// Length word of a resolve reply when no mapping exists.
pub const NOT_FOUND: u32 = u32::MAX;

/// A single encoded request frame.
pub type MessageFrame = [u8; MESSAGE_SIZE];

/// A single encoded reply frame.
pub type ReplyFrame = [u8; REPLY_SIZE];

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// "I ran" notification from a challenger; refreshes the idle timer.
    Liveness = 1,
    RegisterEndpoints = 2,
    UnregisterEndpoints = 3,
    ResolveEndpoint = 4,
    /// One slice of a trailing payload.
    PayloadChunk = 5,
}

impl MessageType {
    /// Tag value on the wire.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageType {
    type Error = EpmapError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Liveness),
            2 => Ok(Self::RegisterEndpoints),
            3 => Ok(Self::UnregisterEndpoints),
            4 => Ok(Self::ResolveEndpoint),
            5 => Ok(Self::PayloadChunk),
            other => Err(EpmapError::Protocol(format!(
                "Unknown message type {}",
                other
            ))),
        }
    }
}

/// Decoded prefix of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    /// Trailing payload bytes following in chunk frames (0 for chunks).
    pub payload_size: u32,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, payload_size: u32) -> Self {
        Self {
            message_type,
            payload_size,
        }
    }

    /// Encode into the first `FRAME_HEADER_SIZE` bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `FRAME_HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.message_type.as_u32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    /// Decode from the start of a frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(EpmapError::Protocol(format!(
                "Frame of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Self {
            message_type: MessageType::try_from(tag)?,
            payload_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Reject payloads larger than `max`.
    pub fn validate(&self, max: u32) -> Result<()> {
        if self.payload_size > max {
            return Err(EpmapError::PayloadTooLarge {
                size: self.payload_size,
                max,
            });
        }
        if self.message_type == MessageType::PayloadChunk && self.payload_size != 0 {
            return Err(EpmapError::Protocol(
                "Chunk frame cannot announce a payload".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read a little-endian u32 at `offset`.
#[inline]
pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Write a little-endian u32 at `offset`.
#[inline]
pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Copy `s` into a fixed NUL-padded field. At least one NUL must remain.
pub fn encode_fixed_str(s: &str, field: &mut [u8]) -> Result<()> {
    if s.len() >= field.len() || s.as_bytes().contains(&0) {
        return Err(EpmapError::StringTooLong {
            len: s.len(),
            max: field.len().saturating_sub(1),
        });
    }
    field.fill(0);
    field[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}

/// Read a NUL-padded field up to its first NUL (or the whole field).
pub fn decode_fixed_str(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|e| EpmapError::Protocol(format!("Invalid UTF-8 in string field: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(MESSAGE_SIZE, 1032);
        assert_eq!(REPLY_SIZE, 516);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = FrameHeader::new(MessageType::RegisterEndpoints, 0x0A0B0C0D);
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.encode_into(&mut buf);

        assert_eq!(buf, [2, 0, 0, 0, 0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_decode_unknown_type() {
        let buf = [9u8, 0, 0, 0, 0, 0, 0, 0];
        let err = FrameHeader::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("Unknown message type 9"));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(FrameHeader::decode(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = FrameHeader::new(MessageType::RegisterEndpoints, MAX_PAYLOAD_SIZE + 1);
        let result = header.validate(MAX_PAYLOAD_SIZE);
        assert!(matches!(result, Err(EpmapError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_validate_chunk_with_payload_rejected() {
        let header = FrameHeader::new(MessageType::PayloadChunk, 4);
        assert!(header.validate(MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_fixed_str_roundtrip_and_limits() {
        let mut field = [0xFFu8; 8];
        encode_fixed_str("np", &mut field).unwrap();
        assert_eq!(field, [b'n', b'p', 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_fixed_str(&field).unwrap(), "np");

        // Needs room for the terminator
        assert!(encode_fixed_str("12345678", &mut field).is_err());
        assert!(encode_fixed_str("1234567", &mut field).is_ok());
        assert!(encode_fixed_str("a\0b", &mut field).is_err());
    }

    #[test]
    fn test_decode_fixed_str_without_terminator() {
        assert_eq!(decode_fixed_str(b"abcd").unwrap(), "abcd");
        assert!(decode_fixed_str(&[0xC3, 0x28, 0]).is_err());
    }
}
