//! The outbound product event envelope.

use serde::{Deserialize, Serialize};

use crate::codec::RecordCodec;
use crate::error::Result;
use crate::value::Record;

/// The kind of change an event applies to a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMethod {
    /// A new row.
    Create,
    /// A full or partial update to an existing row.
    Update,
    /// A row deletion.
    Delete,
    /// A point-in-time full-state emission.
    Snapshot,
}

impl Default for EventMethod {
    fn default() -> Self {
        Self::Create
    }
}

impl std::fmt::Display for EventMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// The canonical output of the processing pipeline: one transformed record
/// bound for a product's durable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEvent {
    /// Event name this record was produced from.
    pub event_name: String,
    /// Destination table (the product name).
    pub table: String,
    /// The change kind.
    pub method: EventMethod,
    /// Primary-key value: PK field values joined with the `0x1F` separator.
    pub primary_key: String,
    /// Stable hash of the primary key, used for partitioning.
    pub partition_key: u64,
    /// Codec-encoded record payload.
    pub payload: Vec<u8>,
}

impl ProductEvent {
    /// Decodes the record payload back through the given codec.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Decode` if the payload is not a valid encoded
    /// record.
    pub fn content(&self, codec: &dyn RecordCodec) -> Result<Record> {
        codec.decode_record(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::value::Value;

    #[test]
    fn test_method_display() {
        assert_eq!(EventMethod::Create.to_string(), "create");
        assert_eq!(EventMethod::Snapshot.to_string(), "snapshot");
    }

    #[test]
    fn test_method_serde_lowercase() {
        let json = serde_json::to_string(&EventMethod::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        let back: EventMethod = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(back, EventMethod::Update);
    }

    #[test]
    fn test_event_content_round_trip() {
        let codec = JsonCodec::new();
        let mut record = Record::new();
        record.set("id", Value::Int(101));
        record.set("name", Value::Str("fred".into()));

        let event = ProductEvent {
            event_name: "dataCreated".into(),
            table: "TestDataProduct".into(),
            method: EventMethod::Create,
            primary_key: "101".into(),
            partition_key: 42,
            payload: codec.encode_record(&record).unwrap(),
        };

        let content = event.content(&codec).unwrap();
        assert_eq!(content, record);
    }
}
