//! Protocol module - fixed-size frames, chunked payloads, typed messages.
//!
//! This module implements the endpoint mapper wire protocol:
//! - Fixed request/reply frame layout
//! - Trailing payload of objects and bindings
//! - Chunk frames for payloads of any size
//! - `Request`/`Reply` with typed fields

mod chunk;
mod message;
mod payload;
mod wire_format;

pub use chunk::{chunk_count, split_payload, ChunkAssembler};
pub use message::{bindings, Reply, Request};
pub use payload::{Binding, TrailingPayload, MAX_BINDING_PROTSEQ_LEN, MAX_ENDPOINT_LEN};
pub use wire_format::{
    decode_fixed_str, encode_fixed_str, FrameHeader, MessageFrame, MessageType, ReplyFrame,
    CHUNK_SIZE, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_PROTSEQ_LEN, MAX_REPLY_LEN,
    MESSAGE_SIZE, NOT_FOUND, REPLY_SIZE, STATUS_OK,
};
