//! Endpoint map: `(interface, protocol sequence, object) -> endpoint`.
//!
//! The map is plain data. Callers serialize access to it (the server keeps
//! it behind a single mutex, see [`ServiceState`](crate::server::ServiceState)).
//!
//! # Example
//!
//! ```
//! use epmapd::map::{EndpointMap, InterfaceId, ObjectId};
//! use uuid::Uuid;
//!
//! let iface = InterfaceId::new(Uuid::from_u128(0x1234), 1, 0);
//! let mut map = EndpointMap::new();
//!
//! map.register(&iface, "ncacn_np", r"\\.\pipe\foo", &[], false);
//! assert_eq!(
//!     map.resolve(&iface, "ncacn_np", &ObjectId::NIL).as_deref(),
//!     Some(r"\\.\pipe\foo")
//! );
//! ```

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// Encoded size of an [`InterfaceId`] (uuid + major + minor).
pub const INTERFACE_ID_SIZE: usize = 20;

/// Encoded size of an [`ObjectId`].
pub const OBJECT_ID_SIZE: usize = 16;

/// Interface identifier: UUID plus a (major, minor) version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    /// Interface UUID.
    pub uuid: Uuid,
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl InterfaceId {
    /// Create a new interface id.
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self { uuid, major, minor }
    }

    /// Encode as 16 UUID bytes followed by major and minor (little endian).
    pub fn encode(&self) -> [u8; INTERFACE_ID_SIZE] {
        let mut buf = [0u8; INTERFACE_ID_SIZE];
        buf[0..16].copy_from_slice(self.uuid.as_bytes());
        buf[16..18].copy_from_slice(&self.major.to_le_bytes());
        buf[18..20].copy_from_slice(&self.minor.to_le_bytes());
        buf
    }

    /// Decode from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < INTERFACE_ID_SIZE {
            return None;
        }
        let uuid = Uuid::from_slice(&buf[0..16]).ok()?;
        Some(Self {
            uuid,
            major: u16::from_le_bytes([buf[16], buf[17]]),
            minor: u16::from_le_bytes([buf[18], buf[19]]),
        })
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.uuid, self.major, self.minor)
    }
}

/// Object identifier. The all-zero value is the wildcard object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    /// The nil (wildcard) object.
    pub const NIL: ObjectId = ObjectId(Uuid::nil());

    /// Check if this is the wildcard object.
    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Raw UUID bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        self.0.as_bytes()
    }

    /// Decode from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; OBJECT_ID_SIZE] = buf.get(..OBJECT_ID_SIZE)?.try_into().ok()?;
        Some(Self(Uuid::from_bytes(bytes)))
    }
}

impl From<Uuid> for ObjectId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lookup key. Protocol sequences compare case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapKey {
    pub iface: InterfaceId,
    pub protocol_sequence: String,
    pub object: ObjectId,
}

impl MapKey {
    pub fn new(iface: &InterfaceId, protocol_sequence: &str, object: &ObjectId) -> Self {
        Self {
            iface: *iface,
            protocol_sequence: protocol_sequence.to_string(),
            object: *object,
        }
    }
}

/// A single mapping as returned by [`EndpointMap::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub key: MapKey,
    pub endpoint: String,
}

/// Registry of endpoint mappings.
///
/// Each key holds a list of endpoints. It only grows past one element when a
/// caller registers with `no_replace`; lookups return the oldest endpoint so
/// an earlier registration is never shadowed.
#[derive(Debug, Default)]
pub struct EndpointMap {
    entries: HashMap<MapKey, Vec<String>>,
}

impl EndpointMap {
    /// Create a new empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the entry for an exact key.
    pub fn find(
        &self,
        iface: &InterfaceId,
        protocol_sequence: &str,
        object: &ObjectId,
    ) -> Option<MapEntry> {
        let key = MapKey::new(iface, protocol_sequence, object);
        let endpoint = self.entries.get(&key)?.first()?.clone();
        Some(MapEntry { key, endpoint })
    }

    /// Register `endpoint` for every object in `objects` (nil if empty).
    ///
    /// Without `no_replace`, an existing entry has its endpoint overwritten in
    /// place. With `no_replace`, a new entry is always added, even if one with
    /// the same key already exists.
    pub fn register(
        &mut self,
        iface: &InterfaceId,
        protocol_sequence: &str,
        endpoint: &str,
        objects: &[ObjectId],
        no_replace: bool,
    ) {
        for object in expand_objects(objects) {
            let key = MapKey::new(iface, protocol_sequence, object);
            let endpoints = self.entries.entry(key).or_default();

            if !no_replace {
                if let Some(existing) = endpoints.first_mut() {
                    *existing = endpoint.to_string();
                    continue;
                }
            }
            endpoints.push(endpoint.to_string());
        }
    }

    /// Remove every entry for `(iface, protocol_sequence)` whose object is in
    /// `objects` (nil if empty). Returns the number of entries removed.
    pub fn unregister(
        &mut self,
        iface: &InterfaceId,
        protocol_sequence: &str,
        objects: &[ObjectId],
    ) -> usize {
        expand_objects(objects)
            .iter()
            .filter_map(|object| {
                self.entries
                    .remove(&MapKey::new(iface, protocol_sequence, object))
            })
            .map(|removed| removed.len())
            .sum()
    }

    /// Resolve an exact key to its endpoint.
    pub fn resolve(
        &self,
        iface: &InterfaceId,
        protocol_sequence: &str,
        object: &ObjectId,
    ) -> Option<String> {
        self.find(iface, protocol_sequence, object)
            .map(|entry| entry.endpoint)
    }

    /// Total number of entries, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static WILDCARD: [ObjectId; 1] = [ObjectId::NIL];

fn expand_objects(objects: &[ObjectId]) -> &[ObjectId] {
    if objects.is_empty() {
        &WILDCARD
    } else {
        objects
    }
}
