//! Typed requests and replies.
//!
//! Fixed body fields per message type (offsets relative to the body):
//! ```text
//! Liveness     timeout_ms:u32 @0
//! Register     iface:20 @0, object_count:u32 @20, binding_count:u32 @24, no_replace:u32 @28
//! Unregister   iface:20 @0, object_count:u32 @20, binding_count:u32 @24
//! Resolve      iface:20 @0, object:16 @20, protocol_sequence:[u8; 64] @36
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::chunk::split_payload;
use super::payload::{Binding, TrailingPayload};
use super::wire_format::{
    decode_fixed_str, encode_fixed_str, read_u32, write_u32, FrameHeader, MessageFrame,
    MessageType, ReplyFrame, FRAME_HEADER_SIZE, MAX_PROTSEQ_LEN, MAX_REPLY_LEN, MESSAGE_SIZE,
    NOT_FOUND, REPLY_SIZE, STATUS_OK,
};
use crate::error::{EpmapError, Result};
use crate::map::{InterfaceId, ObjectId, INTERFACE_ID_SIZE, OBJECT_ID_SIZE};

const IFACE_OFFSET: usize = FRAME_HEADER_SIZE;
const OBJECT_COUNT_OFFSET: usize = IFACE_OFFSET + INTERFACE_ID_SIZE;
const BINDING_COUNT_OFFSET: usize = OBJECT_COUNT_OFFSET + 4;
const NO_REPLACE_OFFSET: usize = BINDING_COUNT_OFFSET + 4;
const RESOLVE_OBJECT_OFFSET: usize = IFACE_OFFSET + INTERFACE_ID_SIZE;
const RESOLVE_PROTSEQ_OFFSET: usize = RESOLVE_OBJECT_OFFSET + OBJECT_ID_SIZE;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Sent by a challenger that found a running instance.
    Liveness { timeout_ms: u32 },
    RegisterEndpoints {
        iface: InterfaceId,
        payload: TrailingPayload,
        no_replace: bool,
    },
    UnregisterEndpoints {
        iface: InterfaceId,
        payload: TrailingPayload,
    },
    ResolveEndpoint {
        iface: InterfaceId,
        object: ObjectId,
        protocol_sequence: String,
    },
}

impl Request {
    /// Message type of the header frame.
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Liveness { .. } => MessageType::Liveness,
            Request::RegisterEndpoints { .. } => MessageType::RegisterEndpoints,
            Request::UnregisterEndpoints { .. } => MessageType::UnregisterEndpoints,
            Request::ResolveEndpoint { .. } => MessageType::ResolveEndpoint,
        }
    }

    /// Encode as a header frame followed by chunk frames.
    pub fn encode(&self) -> Result<Vec<MessageFrame>> {
        let mut header = [0u8; MESSAGE_SIZE];

        let payload = match self {
            Request::Liveness { timeout_ms } => {
                write_u32(&mut header, FRAME_HEADER_SIZE, *timeout_ms);
                Bytes::new()
            }
            Request::RegisterEndpoints {
                iface,
                payload,
                no_replace,
            } => {
                encode_counted(&mut header, iface, payload)?;
                write_u32(&mut header, NO_REPLACE_OFFSET, u32::from(*no_replace));
                payload.encode()?
            }
            Request::UnregisterEndpoints { iface, payload } => {
                encode_counted(&mut header, iface, payload)?;
                payload.encode()?
            }
            Request::ResolveEndpoint {
                iface,
                object,
                protocol_sequence,
            } => {
                header[IFACE_OFFSET..IFACE_OFFSET + INTERFACE_ID_SIZE]
                    .copy_from_slice(&iface.encode());
                header[RESOLVE_OBJECT_OFFSET..RESOLVE_OBJECT_OFFSET + OBJECT_ID_SIZE]
                    .copy_from_slice(object.as_bytes());
                encode_fixed_str(
                    protocol_sequence,
                    &mut header[RESOLVE_PROTSEQ_OFFSET..RESOLVE_PROTSEQ_OFFSET + MAX_PROTSEQ_LEN],
                )?;
                Bytes::new()
            }
        };

        let payload_size = u32::try_from(payload.len()).map_err(|_| EpmapError::PayloadTooLarge {
            size: u32::MAX,
            max: u32::MAX,
        })?;
        FrameHeader::new(self.message_type(), payload_size).encode_into(&mut header);

        let mut frames = Vec::with_capacity(1 + super::chunk::chunk_count(payload.len()));
        frames.push(header);
        frames.extend(split_payload(&payload));
        Ok(frames)
    }

    /// Encode every frame into one contiguous buffer.
    pub fn encode_bytes(&self) -> Result<Bytes> {
        let frames = self.encode()?;
        let mut buf = BytesMut::with_capacity(frames.len() * MESSAGE_SIZE);
        for frame in &frames {
            buf.put_slice(frame);
        }
        Ok(buf.freeze())
    }

    /// Decode from a header frame and its assembled trailing payload.
    pub fn decode(frame: &[u8], payload: &[u8]) -> Result<Self> {
        if frame.len() != MESSAGE_SIZE {
            return Err(EpmapError::Protocol(format!(
                "Header frame is {} bytes, expected {}",
                frame.len(),
                MESSAGE_SIZE
            )));
        }
        let header = FrameHeader::decode(frame)?;
        if header.payload_size as usize != payload.len() {
            return Err(EpmapError::Protocol(format!(
                "Header announced {} payload bytes, got {}",
                header.payload_size,
                payload.len()
            )));
        }

        match header.message_type {
            MessageType::Liveness => {
                expect_no_payload(payload)?;
                Ok(Request::Liveness {
                    timeout_ms: read_u32(frame, FRAME_HEADER_SIZE),
                })
            }
            MessageType::RegisterEndpoints => {
                let (iface, payload) = decode_counted(frame, payload)?;
                Ok(Request::RegisterEndpoints {
                    iface,
                    payload,
                    no_replace: read_u32(frame, NO_REPLACE_OFFSET) != 0,
                })
            }
            MessageType::UnregisterEndpoints => {
                let (iface, payload) = decode_counted(frame, payload)?;
                Ok(Request::UnregisterEndpoints { iface, payload })
            }
            MessageType::ResolveEndpoint => {
                expect_no_payload(payload)?;
                let iface = decode_iface(frame)?;
                let object = ObjectId::decode(&frame[RESOLVE_OBJECT_OFFSET..])
                    .ok_or_else(|| EpmapError::Protocol("Truncated object id".to_string()))?;
                let protocol_sequence = decode_fixed_str(
                    &frame[RESOLVE_PROTSEQ_OFFSET..RESOLVE_PROTSEQ_OFFSET + MAX_PROTSEQ_LEN],
                )?;
                Ok(Request::ResolveEndpoint {
                    iface,
                    object,
                    protocol_sequence,
                })
            }
            MessageType::PayloadChunk => Err(EpmapError::Protocol(
                "Payload chunk received where a message header was expected".to_string(),
            )),
        }
    }
}

fn encode_counted(header: &mut MessageFrame, iface: &InterfaceId, payload: &TrailingPayload) -> Result<()> {
    let too_many = |len: usize| EpmapError::Protocol(format!("Too many items: {}", len));
    let object_count = u32::try_from(payload.objects.len()).map_err(|_| too_many(payload.objects.len()))?;
    let binding_count = u32::try_from(payload.bindings.len()).map_err(|_| too_many(payload.bindings.len()))?;

    header[IFACE_OFFSET..IFACE_OFFSET + INTERFACE_ID_SIZE].copy_from_slice(&iface.encode());
    write_u32(header, OBJECT_COUNT_OFFSET, object_count);
    write_u32(header, BINDING_COUNT_OFFSET, binding_count);
    Ok(())
}

fn decode_counted(frame: &[u8], payload: &[u8]) -> Result<(InterfaceId, TrailingPayload)> {
    let iface = decode_iface(frame)?;
    let object_count = read_u32(frame, OBJECT_COUNT_OFFSET);
    let binding_count = read_u32(frame, BINDING_COUNT_OFFSET);
    let payload = TrailingPayload::decode(payload, object_count, binding_count)?;
    Ok((iface, payload))
}

fn decode_iface(frame: &[u8]) -> Result<InterfaceId> {
    InterfaceId::decode(&frame[IFACE_OFFSET..])
        .ok_or_else(|| EpmapError::Protocol("Truncated interface id".to_string()))
}

fn expect_no_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(EpmapError::Protocol(
            "Message type does not take a trailing payload".to_string(),
        ))
    }
}

/// Reply to a request. Resolve gets `Endpoint`, everything else `Status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(u32),
    Endpoint(Option<String>),
}

impl Reply {
    /// Successful status reply.
    pub fn ok() -> Self {
        Reply::Status(STATUS_OK)
    }

    /// Encode into a fixed reply frame.
    ///
    /// Endpoints longer than `MAX_REPLY_LEN` are cut at the last character
    /// boundary that fits.
    pub fn encode(&self) -> ReplyFrame {
        let mut frame = [0u8; REPLY_SIZE];
        match self {
            Reply::Status(status) => write_u32(&mut frame, 0, *status),
            Reply::Endpoint(None) => write_u32(&mut frame, 0, NOT_FOUND),
            Reply::Endpoint(Some(endpoint)) => {
                let mut len = endpoint.len().min(MAX_REPLY_LEN);
                while !endpoint.is_char_boundary(len) {
                    len -= 1;
                }
                write_u32(&mut frame, 0, len as u32);
                frame[4..4 + len].copy_from_slice(&endpoint.as_bytes()[..len]);
            }
        }
        frame
    }

    /// Decode a reply frame sent in answer to a `request_type` message.
    pub fn decode(frame: &[u8], request_type: MessageType) -> Result<Self> {
        if frame.len() != REPLY_SIZE {
            return Err(EpmapError::Protocol(format!(
                "Reply frame is {} bytes, expected {}",
                frame.len(),
                REPLY_SIZE
            )));
        }
        let word = read_u32(frame, 0);

        if request_type != MessageType::ResolveEndpoint {
            return Ok(Reply::Status(word));
        }
        if word == NOT_FOUND {
            return Ok(Reply::Endpoint(None));
        }

        let len = word as usize;
        if len > MAX_REPLY_LEN {
            return Err(EpmapError::Protocol(format!(
                "Reply length {} exceeds {}",
                len, MAX_REPLY_LEN
            )));
        }
        let endpoint = std::str::from_utf8(&frame[4..4 + len])
            .map_err(|e| EpmapError::Protocol(format!("Invalid UTF-8 in reply: {}", e)))?;
        Ok(Reply::Endpoint(Some(endpoint.to_string())))
    }
}

/// Convenience for building register/unregister payloads.
pub fn bindings<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<Binding> {
    pairs
        .into_iter()
        .map(|(protocol_sequence, endpoint)| Binding::new(protocol_sequence, endpoint))
        .collect()
}
