//! Event records, proposed events, and the JSON codec that bridges them to
//! typed domain events.
//!
//! This module provides the foundational data types that the storage,
//! actor, indexer, and projection modules all depend on. No I/O occurs here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::identity::category_of;

/// Opaque key-value metadata attached to every event.
pub type Metadata = BTreeMap<String, String>;

/// Payload format tag written by [`encode_domain_event`].
pub const JSON_FORMAT: &str = "json/1";

/// An event the engine wants to append to a stream.
///
/// The event ID is assigned here, before persistence, and doubles as an
/// idempotency key: the store rejects a second event with the same ID.
/// Sequences are assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Process-wide unique identifier.
    pub event_id: Uuid,
    /// Logical name distinguishing the payload schema.
    pub event_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Serialized [`Metadata`].
    pub metadata: Vec<u8>,
    /// Serialized domain event.
    pub payload: Vec<u8>,
    /// Codec/version tag for `payload`.
    pub payload_format: String,
}

impl NewEvent {
    /// Create a JSON-tagged event with a fresh UUID v4, empty metadata, and
    /// the current time.
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            metadata: Vec::new(),
            payload,
            payload_format: JSON_FORMAT.to_owned(),
        }
    }

    /// Replace the event ID.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Serialize and attach metadata.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the map cannot be serialized.
    pub fn with_metadata(mut self, metadata: &Metadata) -> serde_json::Result<Self> {
        self.metadata = encode_metadata(metadata)?;
        Ok(self)
    }
}

/// An immutable, persisted event.
///
/// `stream_sequence` is 1-based and gap-free per stream; `global_sequence`
/// is 1-based and gap-free across the whole log, strictly increasing in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Process-wide unique identifier.
    pub event_id: Uuid,
    /// Human-readable stream name.
    pub stream_id: String,
    /// Position within the stream, starting at 1.
    pub stream_sequence: u64,
    /// Position in the global log, starting at 1.
    pub global_sequence: u64,
    /// Logical event name (e.g., "Renamed").
    pub event_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Serialized [`Metadata`].
    pub metadata: Vec<u8>,
    /// Serialized domain event.
    pub payload: Vec<u8>,
    /// Codec/version tag for `payload`.
    pub payload_format: String,
}

impl EventRecord {
    /// Build the record a backend stores for `event` at the given positions.
    pub fn from_new(
        event: NewEvent,
        stream_id: &str,
        stream_sequence: u64,
        global_sequence: u64,
    ) -> Self {
        Self {
            event_id: event.event_id,
            stream_id: stream_id.to_owned(),
            stream_sequence,
            global_sequence,
            event_type: event.event_type,
            timestamp: event.timestamp,
            metadata: event.metadata,
            payload: event.payload,
            payload_format: event.payload_format,
        }
    }

    /// The category of this event's stream.
    pub fn category(&self) -> &str {
        category_of(&self.stream_id)
    }

    /// Decode the metadata. Undecodable metadata reads as empty.
    pub fn metadata_map(&self) -> Metadata {
        decode_metadata(&self.metadata).unwrap_or_default()
    }

    /// Decode a JSON payload into a `serde_json::Value`.
    ///
    /// Returns `None` when the payload is not JSON-tagged or does not parse.
    /// An empty JSON payload reads as `Null`.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        if self.payload_format != JSON_FORMAT {
            return None;
        }
        if self.payload.is_empty() {
            return Some(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Serialize metadata to bytes.
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails.
pub fn encode_metadata(metadata: &Metadata) -> serde_json::Result<Vec<u8>> {
    if metadata.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(metadata)
}

/// Deserialize metadata bytes. Empty bytes are an empty map.
///
/// # Errors
///
/// Returns `serde_json::Error` if the bytes are not a JSON string map.
pub fn decode_metadata(bytes: &[u8]) -> serde_json::Result<Metadata> {
    if bytes.is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_slice(bytes)
}

/// Encode a domain event into a [`NewEvent`] ready for appending.
///
/// The domain event must use adjacently tagged serde
/// (`#[serde(tag = "type", content = "data")]`). The `"type"` field becomes
/// the event type and the `"data"` field becomes the payload; unit variants
/// have an empty payload.
///
/// # Arguments
///
/// * `event` - Reference to the domain event to encode.
/// * `metadata` - Key-value metadata to stamp on the event.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or is not
/// an adjacently tagged enum.
pub fn encode_domain_event<E: Serialize>(
    event: &E,
    metadata: &Metadata,
) -> serde_json::Result<NewEvent> {
    use serde::ser::Error as _;

    // Produces `{"type": "Renamed", "data": {...}}` or `{"type": "Deleted"}`.
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .ok_or_else(|| serde_json::Error::custom("domain event must serialize to a JSON object"))?;
    let event_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| serde_json::Error::custom("domain event must have a string 'type' field"))?;

    let payload = match obj.get("data") {
        Some(data) => serde_json::to_vec(data)?,
        None => Vec::new(),
    };

    NewEvent::new(event_type, payload).with_metadata(metadata)
}

/// Decode a stored record back into a typed domain event.
///
/// Reconstructs the adjacently tagged JSON object from the record's event
/// type and payload. Returns `None` for records in another payload format,
/// unknown event types, or malformed payloads, so reducers can skip them
/// for forward compatibility.
pub fn decode_domain_event<E: DeserializeOwned>(record: &EventRecord) -> Option<E> {
    let data = record.payload_json()?;
    let tagged = if data.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({ "type": record.event_type, "data": data })
    };
    serde_json::from_value(tagged).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::CounterEvent;

    fn record_from(event: NewEvent, stream_id: &str) -> EventRecord {
        EventRecord::from_new(event, stream_id, 1, 1)
    }

    #[test]
    fn encode_fieldless_variant_has_empty_payload() {
        let event = encode_domain_event(&CounterEvent::Incremented, &Metadata::new())
            .expect("encode should succeed");
        assert_eq!(event.event_type, "Incremented");
        assert!(event.payload.is_empty());
        assert!(event.metadata.is_empty());
        assert_eq!(event.payload_format, JSON_FORMAT);
    }

    #[test]
    fn encode_variant_with_data_extracts_payload() {
        let event = encode_domain_event(&CounterEvent::Added { amount: 5 }, &Metadata::new())
            .expect("encode should succeed");
        assert_eq!(event.event_type, "Added");
        let payload: serde_json::Value =
            serde_json::from_slice(&event.payload).expect("payload should be JSON");
        assert_eq!(payload["amount"], 5);
    }

    #[test]
    fn encode_generates_unique_event_ids() {
        let a = encode_domain_event(&CounterEvent::Incremented, &Metadata::new()).unwrap();
        let b = encode_domain_event(&CounterEvent::Incremented, &Metadata::new()).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn encode_rejects_non_tagged_values() {
        let result = encode_domain_event(&42u32, &Metadata::new());
        assert!(result.is_err());
    }

    #[test]
    fn decode_restores_domain_event() {
        for original in [CounterEvent::Incremented, CounterEvent::Added { amount: 9 }] {
            let stored = record_from(
                encode_domain_event(&original, &Metadata::new()).unwrap(),
                "counter-c-1",
            );
            let decoded: CounterEvent = decode_domain_event(&stored).expect("should decode");
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn decode_unknown_type_returns_none() {
        let stored = record_from(NewEvent::new("UnknownType", b"{}".to_vec()), "counter-c-1");
        assert!(decode_domain_event::<CounterEvent>(&stored).is_none());
    }

    #[test]
    fn decode_foreign_format_returns_none() {
        let mut event = NewEvent::new("Incremented", Vec::new());
        event.payload_format = "protobuf/3".to_owned();
        let stored = record_from(event, "counter-c-1");
        assert!(decode_domain_event::<CounterEvent>(&stored).is_none());
    }

    #[test]
    fn metadata_roundtrips_through_record() {
        let mut meta = Metadata::new();
        meta.insert("actor".into(), "user-1".into());
        let stored = record_from(
            encode_domain_event(&CounterEvent::Incremented, &meta).unwrap(),
            "counter-c-1",
        );
        assert_eq!(stored.metadata_map(), meta);
    }

    #[test]
    fn undecodable_metadata_reads_as_empty() {
        let mut event = NewEvent::new("Incremented", Vec::new());
        event.metadata = b"not json".to_vec();
        assert!(record_from(event, "counter-c-1").metadata_map().is_empty());
    }

    #[test]
    fn record_category_comes_from_stream_name() {
        let stored = record_from(NewEvent::new("Incremented", Vec::new()), "counter-c-1");
        assert_eq!(stored.category(), "counter");
    }
}
