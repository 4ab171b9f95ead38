//! Pluggable wire codec for records and product events.
//!
//! The dispatcher treats the wire format as an external concern: anything
//! implementing [`RecordCodec`] can carry the canonical record model.
//! [`JsonCodec`] is the default: self-describing, so every [`Value`]
//! variant (including `Any` passthrough) round-trips without a schema.
//!
//! [`Value`]: crate::value::Value

use crate::error::{RecordError, Result};
use crate::event::ProductEvent;
use crate::value::Record;

/// Serializes and deserializes the canonical record format.
///
/// Implementations must be stateless or internally synchronized; one codec
/// instance is shared per processor.
pub trait RecordCodec: Send + Sync {
    /// Encodes a record.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Encode` if the record cannot be represented in
    /// the wire format.
    fn encode_record(&self, record: &Record) -> Result<Vec<u8>>;

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Decode` on malformed input.
    fn decode_record(&self, bytes: &[u8]) -> Result<Record>;

    /// Encodes a full product event for publishing.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Encode` if the event cannot be represented.
    fn encode_event(&self, event: &ProductEvent) -> Result<Vec<u8>>;

    /// Decodes a published product event.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Decode` on malformed input.
    fn decode_event(&self, bytes: &[u8]) -> Result<ProductEvent>;
}

/// JSON-backed codec over the record serde model.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates a new JSON codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordCodec for JsonCodec {
    fn encode_record(&self, record: &Record) -> Result<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| RecordError::Encode(e.to_string()))
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record> {
        serde_json::from_slice(bytes).map_err(|e| RecordError::Decode(e.to_string()))
    }

    fn encode_event(&self, event: &ProductEvent) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(|e| RecordError::Encode(e.to_string()))
    }

    fn decode_event(&self, bytes: &[u8]) -> Result<ProductEvent> {
        serde_json::from_slice(bytes).map_err(|e| RecordError::Decode(e.to_string()))
    }
}
