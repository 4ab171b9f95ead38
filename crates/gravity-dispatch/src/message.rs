//! The in-flight message envelope.
//!
//! A [`Message`] carries a raw inbound payload through the pipeline,
//! accumulating state as stages run: the resolved rule after parse, the
//! decoded record, and finally the encoded [`ProductEvent`]. The attached
//! [`Delivery`] is the bus-side acknowledgement token; it is settled
//! exactly once, when the message (and every fan-out child it produced)
//! finishes or fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use gravity_record::{ProductEvent, Record};
use serde::{Deserialize, Serialize};

use crate::rule::Rule;

/// The wire shape of an inbound raw message: the event name plus the
/// user's JSON payload as an opaque (base64-encoded) byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRawData {
    /// Event name, resolved against the product's rules.
    pub event: String,

    /// The user's JSON payload.
    #[serde(rename = "rawPayload", with = "base64_bytes")]
    pub raw_payload: Vec<u8>,
}

/// Serde adapter matching the wire convention of base64-encoded bytes.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Bus-side acknowledgement token for one inbound message.
///
/// Implementations log their own failures; the pipeline treats settlement
/// as infallible and never retries an ack.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Positively acknowledges the message (done, or parked in the DLQ).
    async fn ack(&self);

    /// Negatively acknowledges the message so the bus redelivers it.
    async fn nack(&self);
}

/// No-op delivery for locally constructed messages.
#[derive(Debug, Default)]
pub struct NoopDelivery;

#[async_trait]
impl Delivery for NoopDelivery {
    async fn ack(&self) {}
    async fn nack(&self) {}
}

/// Test delivery that counts settlements.
#[derive(Debug, Default)]
pub struct TestDelivery {
    acks: AtomicU32,
    nacks: AtomicU32,
}

impl TestDelivery {
    /// Creates a fresh counter.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of acks observed.
    #[must_use]
    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::Acquire)
    }

    /// Number of nacks observed.
    #[must_use]
    pub fn nacks(&self) -> u32 {
        self.nacks.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Delivery for TestDelivery {
    async fn ack(&self) {
        self.acks.fetch_add(1, Ordering::AcqRel);
    }

    async fn nack(&self) {
        self.nacks.fetch_add(1, Ordering::AcqRel);
    }
}

/// The in-flight envelope owned by whichever pipeline stage currently
/// holds it.
pub struct Message {
    /// The raw inbound payload (a serialized [`MessageRawData`]).
    pub raw: Bytes,

    /// `Nats-Msg-Id` style dedup header, propagated to the output.
    pub msg_id: Option<String>,

    /// The resolved rule. Pre-set by tests or the subscriber; otherwise
    /// resolved during parse.
    pub rule: Option<Arc<Rule>>,

    /// The decoded record, present after parse.
    pub record: Option<Record>,

    /// Whether the decoded payload was a partial update. Partial updates
    /// tolerate missing primary-key components (the key may have been
    /// deleted by the update itself).
    pub partial: bool,

    /// The encoded output, present after the encode stage.
    pub product_event: Option<ProductEvent>,

    /// Acknowledgement token.
    pub delivery: Arc<dyn Delivery>,
}

impl Message {
    /// Creates a message with a no-op delivery.
    #[must_use]
    pub fn new(raw: Bytes) -> Self {
        Self::with_delivery(raw, Arc::new(NoopDelivery))
    }

    /// Creates a message bound to a delivery token.
    #[must_use]
    pub fn with_delivery(raw: Bytes, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            raw,
            msg_id: None,
            rule: None,
            record: None,
            partial: false,
            product_event: None,
            delivery,
        }
    }

    /// Sets the dedup message id.
    #[must_use]
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    /// Pre-assigns the rule, skipping resolution during parse.
    #[must_use]
    pub fn with_rule(mut self, rule: Arc<Rule>) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Builds the raw payload for an event + JSON body pair, mirroring the
    /// producer-side encoding.
    #[must_use]
    pub fn encode_raw(event: &str, payload: &[u8]) -> Bytes {
        let raw = serde_json::json!({
            "event": event,
            "rawPayload": base64::engine::general_purpose::STANDARD.encode(payload),
        });
        Bytes::from(raw.to_string())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("raw_len", &self.raw.len())
            .field("msg_id", &self.msg_id)
            .field("rule", &self.rule.as_ref().map(|r| format!("{}/{}", r.product, r.event)))
            .field("decoded", &self.record.is_some())
            .field("encoded", &self.product_event.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_data_round_trip() {
        let data = MessageRawData {
            event: "dataCreated".into(),
            raw_payload: br#"{"id":101}"#.to_vec(),
        };

        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("rawPayload"));
        // The payload travels base64-encoded, not as a JSON byte array.
        assert!(json.contains(&base64::engine::general_purpose::STANDARD.encode(br#"{"id":101}"#)));

        let back: MessageRawData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_encode_raw_matches_wire_shape() {
        let raw = Message::encode_raw("dataCreated", br#"{"id":1}"#);
        let parsed: MessageRawData = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed.event, "dataCreated");
        assert_eq!(parsed.raw_payload, br#"{"id":1}"#.to_vec());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<MessageRawData, _> =
            serde_json::from_str(r#"{"event":"e","rawPayload":"!!!"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_test_delivery_counts() {
        let delivery = TestDelivery::new();
        delivery.ack().await;
        delivery.ack().await;
        delivery.nack().await;
        assert_eq!(delivery.acks(), 2);
        assert_eq!(delivery.nacks(), 1);
    }
}
