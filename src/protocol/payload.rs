//! Trailing payload of register/unregister requests.
//!
//! Layout:
//! ```text
//! object_count × 16-byte object UUID
//! binding_count × (protocol_sequence NUL endpoint NUL)
//! ```
//!
//! A protocol sequence must fit the fixed Resolve field and an endpoint must
//! fit a reply frame, so every registered binding can be resolved intact.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{MAX_PROTSEQ_LEN, MAX_REPLY_LEN};
use crate::error::{EpmapError, Result};
use crate::map::{ObjectId, OBJECT_ID_SIZE};

/// Longest protocol sequence, leaving room for the Resolve field's NUL.
pub const MAX_BINDING_PROTSEQ_LEN: usize = MAX_PROTSEQ_LEN - 1;

/// Longest endpoint a reply frame can carry.
pub const MAX_ENDPOINT_LEN: usize = MAX_REPLY_LEN;

/// A protocol sequence with the endpoint it is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub protocol_sequence: String,
    pub endpoint: String,
}

impl Binding {
    pub fn new(protocol_sequence: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            protocol_sequence: protocol_sequence.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Objects and bindings carried after a register/unregister header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailingPayload {
    pub objects: Vec<ObjectId>,
    pub bindings: Vec<Binding>,
}

impl TrailingPayload {
    pub fn new(objects: Vec<ObjectId>, bindings: Vec<Binding>) -> Self {
        Self { objects, bindings }
    }

    /// Size in bytes once encoded.
    pub fn encoded_len(&self) -> usize {
        self.objects.len() * OBJECT_ID_SIZE
            + self
                .bindings
                .iter()
                .map(|b| b.protocol_sequence.len() + b.endpoint.len() + 2)
                .sum::<usize>()
    }

    /// Encode objects followed by NUL-terminated binding strings.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        for object in &self.objects {
            buf.put_slice(object.as_bytes());
        }

        for binding in &self.bindings {
            put_terminated(&mut buf, &binding.protocol_sequence, MAX_BINDING_PROTSEQ_LEN)?;
            put_terminated(&mut buf, &binding.endpoint, MAX_ENDPOINT_LEN)?;
        }

        Ok(buf.freeze())
    }

    /// Decode a payload announced with the given counts.
    ///
    /// Fails if a string runs past the end of `buf` without a terminator,
    /// if a string is longer than its limit, or if bytes are left over once
    /// every declared item has been read.
    pub fn decode(buf: &[u8], object_count: u32, binding_count: u32) -> Result<Self> {
        let objects_len = (object_count as usize)
            .checked_mul(OBJECT_ID_SIZE)
            .filter(|&len| len <= buf.len())
            .ok_or_else(|| {
                EpmapError::Protocol(format!(
                    "{} objects do not fit in a {}-byte payload",
                    object_count,
                    buf.len()
                ))
            })?;

        let objects = buf[..objects_len]
            .chunks_exact(OBJECT_ID_SIZE)
            .filter_map(ObjectId::decode)
            .collect();

        let mut rest = &buf[objects_len..];
        let mut bindings = Vec::with_capacity((binding_count as usize).min(64));
        for _ in 0..binding_count {
            let protocol_sequence = take_terminated(&mut rest, MAX_BINDING_PROTSEQ_LEN)?;
            let endpoint = take_terminated(&mut rest, MAX_ENDPOINT_LEN)?;
            bindings.push(Binding {
                protocol_sequence,
                endpoint,
            });
        }

        if !rest.is_empty() {
            return Err(EpmapError::Protocol(format!(
                "{} unexpected bytes after the last binding",
                rest.len()
            )));
        }

        Ok(Self { objects, bindings })
    }
}

fn put_terminated(buf: &mut BytesMut, s: &str, max: usize) -> Result<()> {
    if s.len() > max {
        return Err(EpmapError::StringTooLong { len: s.len(), max });
    }
    if s.as_bytes().contains(&0) {
        return Err(EpmapError::Protocol(
            "Binding strings cannot contain NUL".to_string(),
        ));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn take_terminated(rest: &mut &[u8], max: usize) -> Result<String> {
    let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
        EpmapError::Protocol("String terminator missing before payload end".to_string())
    })?;
    if end > max {
        return Err(EpmapError::Protocol(format!(
            "Binding string of {} bytes exceeds {}",
            end, max
        )));
    }
    let s = std::str::from_utf8(&rest[..end])
        .map_err(|e| EpmapError::Protocol(format!("Invalid UTF-8 in binding: {}", e)))?
        .to_string();
    *rest = &rest[end + 1..];
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_encode_layout() {
        let payload = TrailingPayload::new(
            vec![ObjectId(Uuid::from_u128(1))],
            vec![Binding::new("np", "p1")],
        );
        let bytes = payload.encode().unwrap();

        assert_eq!(bytes.len(), payload.encoded_len());
        assert_eq!(bytes[15], 1);
        assert_eq!(&bytes[16..], b"np\0p1\0");
    }

    #[test]
    fn test_decode_objects_and_bindings() {
        let payload = TrailingPayload::new(
            vec![ObjectId(Uuid::from_u128(1)), ObjectId(Uuid::from_u128(2))],
            vec![
                Binding::new("ncacn_np", r"\pipe\a"),
                Binding::new("ncalrpc", ""),
            ],
        );
        let bytes = payload.encode().unwrap();

        let decoded = TrailingPayload::decode(&bytes, 2, 2).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_empty() {
        let decoded = TrailingPayload::decode(&[], 0, 0).unwrap();
        assert!(decoded.objects.is_empty());
        assert!(decoded.bindings.is_empty());
    }

    #[test]
    fn test_decode_missing_terminator() {
        let err = TrailingPayload::decode(b"np\0endpoint", 0, 1).unwrap_err();
        assert!(err.to_string().contains("terminator missing"));
    }

    #[test]
    fn test_decode_objects_exceed_payload() {
        let err = TrailingPayload::decode(&[0u8; 20], 2, 0).unwrap_err();
        assert!(err.to_string().contains("do not fit"));
    }

    #[test]
    fn test_decode_trailing_garbage() {
        assert!(TrailingPayload::decode(b"a\0b\0junk", 0, 1).is_err());
    }

    #[test]
    fn test_encode_rejects_oversize_endpoint() {
        let fits = TrailingPayload::new(
            vec![],
            vec![Binding::new("ncacn_np", "e".repeat(MAX_ENDPOINT_LEN))],
        );
        assert!(fits.encode().is_ok());

        let too_long = TrailingPayload::new(
            vec![],
            vec![Binding::new("ncacn_np", "e".repeat(MAX_ENDPOINT_LEN + 1))],
        );
        assert!(matches!(
            too_long.encode(),
            Err(EpmapError::StringTooLong { len, max }) if len == 513 && max == MAX_ENDPOINT_LEN
        ));
    }

    #[test]
    fn test_encode_rejects_oversize_protocol_sequence() {
        let payload = TrailingPayload::new(
            vec![],
            vec![Binding::new("p".repeat(MAX_PROTSEQ_LEN), "x")],
        );
        assert!(matches!(payload.encode(), Err(EpmapError::StringTooLong { .. })));
    }

    #[test]
    fn test_decode_rejects_oversize_endpoint() {
        let mut raw = b"ncacn_np\0".to_vec();
        raw.extend(std::iter::repeat(b'e').take(600));
        raw.push(0);

        let err = TrailingPayload::decode(&raw, 0, 1).unwrap_err();
        assert!(matches!(err, EpmapError::Protocol(_)));
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_encode_rejects_embedded_nul() {
        let payload = TrailingPayload::new(vec![], vec![Binding::new("n\0p", "x")]);
        assert!(payload.encode().is_err());
    }
}
