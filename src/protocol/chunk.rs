//! Chunked trailing payloads.
//!
//! A payload of `N` bytes travels as `ceil(N / CHUNK_SIZE)` fixed-size
//! `PayloadChunk` frames following the header frame. The last frame is
//! zero-padded; the receiver knows the real length from the header.
//!
//! The receiving side uses a small state machine:
//! - `Collecting`: fewer than `payload_size` bytes accumulated
//! - `Complete`: every declared byte has arrived

use bytes::Bytes;

use super::wire_format::{FrameHeader, MessageFrame, MessageType, CHUNK_SIZE, FRAME_HEADER_SIZE, MESSAGE_SIZE};
use crate::error::{EpmapError, Result};

/// Number of chunk frames needed for a payload of `len` bytes.
#[inline]
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}

/// Split a payload into chunk frames.
pub fn split_payload(payload: &[u8]) -> Vec<MessageFrame> {
    payload
        .chunks(CHUNK_SIZE)
        .map(|slice| {
            let mut frame = [0u8; MESSAGE_SIZE];
            FrameHeader::new(MessageType::PayloadChunk, 0).encode_into(&mut frame);
            frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + slice.len()].copy_from_slice(slice);
            frame
        })
        .collect()
}

/// Reassembles a payload from chunk frames.
pub struct ChunkAssembler {
    buffer: Vec<u8>,
    expected: usize,
}

impl ChunkAssembler {
    /// Prepare to receive `payload_size` bytes.
    ///
    /// Fails if the size exceeds `max_payload_size` or the buffer cannot be
    /// allocated.
    pub fn new(payload_size: u32, max_payload_size: u32) -> Result<Self> {
        if payload_size > max_payload_size {
            return Err(EpmapError::PayloadTooLarge {
                size: payload_size,
                max: max_payload_size,
            });
        }

        let expected = payload_size as usize;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(expected).map_err(|e| {
            EpmapError::Protocol(format!("Cannot allocate {} byte payload: {}", expected, e))
        })?;

        Ok(Self { buffer, expected })
    }

    /// Bytes still missing.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.expected - self.buffer.len()
    }

    /// Check if every declared byte has arrived.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Feed one frame. It must be a `PayloadChunk` frame.
    pub fn push(&mut self, frame: &[u8]) -> Result<()> {
        if self.is_complete() {
            return Err(EpmapError::Protocol(
                "Chunk received after payload was complete".to_string(),
            ));
        }
        if frame.len() != MESSAGE_SIZE {
            return Err(EpmapError::Protocol(format!(
                "Chunk frame is {} bytes, expected {}",
                frame.len(),
                MESSAGE_SIZE
            )));
        }

        let header = FrameHeader::decode(frame)?;
        if header.message_type != MessageType::PayloadChunk {
            return Err(EpmapError::Protocol(format!(
                "Expected payload chunk, got {:?}",
                header.message_type
            )));
        }

        let take = self.remaining().min(CHUNK_SIZE);
        self.buffer
            .extend_from_slice(&frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + take]);
        Ok(())
    }

    /// Take the assembled payload.
    pub fn finish(self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(EpmapError::Protocol(format!(
                "Payload incomplete: {} of {} bytes",
                self.buffer.len(),
                self.expected
            )));
        }
        Ok(Bytes::from(self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::MAX_PAYLOAD_SIZE;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn reassemble(payload: &[u8]) -> Bytes {
        let frames = split_payload(payload);
        assert_eq!(frames.len(), chunk_count(payload.len()));

        let mut assembler = ChunkAssembler::new(payload.len() as u32, MAX_PAYLOAD_SIZE).unwrap();
        for frame in &frames {
            assembler.push(frame).unwrap();
        }
        assembler.finish().unwrap()
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
    }

    #[test]
    fn test_reassembly_at_chunk_boundaries() {
        for len in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 10 * CHUNK_SIZE + 1] {
            let payload = pattern(len);
            assert_eq!(&reassemble(&payload)[..], &payload[..], "len {}", len);
        }
    }

    #[test]
    fn test_last_chunk_is_zero_padded() {
        let frames = split_payload(&[0xAB; 3]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 3], &[0xAB; 3]);
        assert!(frames[0][FRAME_HEADER_SIZE + 3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let mut frame = split_payload(&[1, 2, 3]).remove(0);
        FrameHeader::new(MessageType::ResolveEndpoint, 0).encode_into(&mut frame);

        let mut assembler = ChunkAssembler::new(3, MAX_PAYLOAD_SIZE).unwrap();
        let err = assembler.push(&frame).unwrap_err();
        assert!(err.to_string().contains("Expected payload chunk"));
    }

    #[test]
    fn test_short_frame_rejected() {
        let mut assembler = ChunkAssembler::new(3, MAX_PAYLOAD_SIZE).unwrap();
        assert!(assembler.push(&[5, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_incomplete_payload_rejected() {
        let frames = split_payload(&pattern(CHUNK_SIZE + 10));
        let mut assembler = ChunkAssembler::new((CHUNK_SIZE + 10) as u32, MAX_PAYLOAD_SIZE).unwrap();
        assembler.push(&frames[0]).unwrap();

        assert_eq!(assembler.remaining(), 10);
        assert!(assembler.finish().is_err());
    }

    #[test]
    fn test_extra_chunk_rejected() {
        let frames = split_payload(&[7u8; 4]);
        let mut assembler = ChunkAssembler::new(4, MAX_PAYLOAD_SIZE).unwrap();
        assembler.push(&frames[0]).unwrap();
        assert!(assembler.push(&frames[0]).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let result = ChunkAssembler::new(MAX_PAYLOAD_SIZE + 1, MAX_PAYLOAD_SIZE);
        assert!(matches!(result, Err(EpmapError::PayloadTooLarge { .. })));
    }
}
