//! Bus-facing interfaces.
//!
//! The dispatcher talks to the message bus through three seams (event
//! publishing, subject subscription, and the watched configuration store)
//! so the pipeline itself never depends on a live broker. [`nats`] binds
//! them to NATS JetStream; [`memory`] provides in-process implementations
//! for tests and development.

pub mod memory;
pub mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::message::Delivery;

/// Outbound header carrying the event name.
pub const HEADER_EVENT_NAME: &str = "Gravity-Event-Name";
/// Outbound header carrying the hex partition-key hash.
pub const HEADER_PARTITION_KEY: &str = "Gravity-Partition-Key";
/// Dedup header, propagated from inbound to outbound when present.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";

/// Headers attached to an outbound event publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishHeaders {
    /// Event name (`Gravity-Event-Name`).
    pub event_name: String,
    /// Partition-key hash (`Gravity-Partition-Key`, hex-encoded).
    pub partition_key: u64,
    /// Dedup id (`Nats-Msg-Id`), propagated if the inbound message had one.
    pub msg_id: Option<String>,
}

impl PublishHeaders {
    /// The partition key as it appears on the wire.
    #[must_use]
    pub fn partition_key_hex(&self) -> String {
        format!("{:016x}", self.partition_key)
    }
}

/// Publishes encoded events to a durable stream subject.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one payload.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::PublishFailure` on a failed or unacked
    /// publish; the caller retries with backoff.
    async fn publish(&self, subject: &str, headers: &PublishHeaders, payload: Bytes)
        -> Result<()>;
}

/// One message delivered from a subject subscription.
pub struct InboundMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Dedup id from the `Nats-Msg-Id` header, if present.
    pub msg_id: Option<String>,
    /// Acknowledgement token.
    pub delivery: Arc<dyn Delivery>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("msg_id", &self.msg_id)
            .finish_non_exhaustive()
    }
}

/// An active subject subscription.
#[async_trait]
pub trait BusSubscription: Send {
    /// Pulls the next message; `None` once the subscription ends.
    async fn next(&mut self) -> Option<InboundMessage>;

    /// Stops the subscription.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` if the bus rejects the unsubscribe.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Creates subject subscriptions.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Subscribes to a subject.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` if the subscription cannot be created.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>>;
}

/// A change observed on the configuration store.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A key was created or updated.
    Put {
        /// The product name (store key).
        name: String,
        /// The raw setting payload.
        data: Bytes,
    },
    /// A key was deleted.
    Delete {
        /// The product name (store key).
        name: String,
    },
}

/// The watched key-value store holding product settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads one entry.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` on store failures.
    async fn get(&self, name: &str) -> Result<Option<Bytes>>;

    /// Writes one entry.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` on store failures.
    async fn put(&self, name: &str, data: Bytes) -> Result<()>;

    /// Deletes one entry.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` on store failures.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Lists all keys.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` on store failures.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Opens a change stream over the store.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` if the watch cannot be established.
    async fn watch(&self) -> Result<BoxStream<'static, ConfigEvent>>;
}
