//! Stream identity: fixed-size keys derived from human-readable stream names.
//!
//! Backends index streams and projection streams by [`StreamKey`] rather
//! than by the variable-length name. The name is still stored next to the
//! key and must be compared on every hit, so a hash collision surfaces as
//! "not found" instead of silently merging two streams.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace UUID for event stream key derivation.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Separate namespace for projection streams, so `"$ce-product"` as a
/// projection never shares a key with an event stream of the same name.
const PROJECTION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x71, 0x0d, 0x52, 0xe8, 0x9b, 0x4c, 0x11, 0xa2, 0x47, 0x6e, 0xd0, 0x19, 0x5b, 0xc3, 0x8a,
]);

/// Deterministic, collision-resistant key for a stream name.
///
/// A UUID v5 (SHA-1 based) over the name. The same name always maps to the
/// same key regardless of which process performs the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(Uuid);

impl StreamKey {
    /// Derive the key of an event stream.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventstream_es::StreamKey;
    /// assert_eq!(StreamKey::of("product-1"), StreamKey::of("product-1"));
    /// assert_ne!(StreamKey::of("product-1"), StreamKey::of("product-2"));
    /// ```
    pub fn of(stream_id: &str) -> Self {
        Self(Uuid::new_v5(&STREAM_NAMESPACE, stream_id.as_bytes()))
    }

    /// Derive the key of a projection stream.
    pub fn of_projection(name: &str) -> Self {
        Self(Uuid::new_v5(&PROJECTION_NAMESPACE, name.as_bytes()))
    }

    /// Wrap a raw UUID. Intended for backends reading keys back from storage.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Build the stream name of an aggregate instance.
///
/// # Arguments
///
/// * `aggregate_type` - The aggregate type name (e.g., "product").
/// * `instance_id` - The aggregate instance identifier (e.g., "p-1").
///
/// # Returns
///
/// `"{aggregate_type}-{instance_id}"`, so the aggregate type doubles as the
/// stream's category.
pub fn stream_name(aggregate_type: &str, instance_id: &str) -> String {
    format!("{aggregate_type}-{instance_id}")
}

/// The category of a stream: everything before the first `-`.
///
/// A stream name without a `-` is its own category.
pub fn category_of(stream_id: &str) -> &str {
    stream_id
        .split_once('-')
        .map_or(stream_id, |(category, _)| category)
}
