//! NATS JetStream bindings for the bus interfaces.
//!
//! One [`NatsBus`] wraps a client connection and its JetStream context and
//! implements event publishing (durable, header-carrying publishes),
//! subject subscription (pull consumers on the domain event stream with
//! explicit ack/nak), the product configuration store (a KV bucket with
//! watch), and the dead-letter sink.

use std::sync::Arc;

use async_nats::jetstream::{self, consumer, kv, stream, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use super::{
    BusConsumer, BusSubscription, ConfigEvent, ConfigStore, EventPublisher, InboundMessage,
    PublishHeaders, HEADER_EVENT_NAME, HEADER_MSG_ID, HEADER_PARTITION_KEY,
};
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::error::{DispatchError, Result};
use crate::message::Delivery;

/// KV catalog holding product settings.
const PRODUCT_CATALOG: &str = "PRODUCT";

/// A NATS connection scoped to one Gravity domain.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    domain: String,
}

impl NatsBus {
    /// Connects to the bus.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` if the connection fails.
    pub async fn connect(url: &str, domain: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| DispatchError::Bus(format!("connect to '{url}' failed: {e}")))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            domain: domain.into(),
        })
    }

    /// The Gravity domain this bus is scoped to.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn event_stream_name(&self) -> String {
        format!("GVT_{}", self.domain)
    }

    /// Ensures the domain event stream exists, covering every
    /// `$GVT.<domain>.…` subject (events and dead letters alike).
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` on stream setup failure.
    pub async fn ensure_event_stream(&self) -> Result<()> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: self.event_stream_name(),
                subjects: vec![format!("$GVT.{}.>", self.domain)],
                retention: stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| DispatchError::Bus(format!("event stream setup failed: {e}")))?;
        Ok(())
    }

    /// Opens the product settings store for this domain.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Bus` if the KV bucket cannot be created.
    pub async fn product_store(&self) -> Result<NatsConfigStore> {
        let bucket = format!("GVT_{}_{}", self.domain, PRODUCT_CATALOG);
        let store = match self.jetstream.get_key_value(&bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    DispatchError::Bus(format!("config bucket '{bucket}' setup failed: {e}"))
                })?,
        };
        Ok(NatsConfigStore { store })
    }
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventPublisher for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        headers: &PublishHeaders,
        payload: Bytes,
    ) -> Result<()> {
        let mut header_map = HeaderMap::new();
        header_map.insert(HEADER_EVENT_NAME, headers.event_name.as_str());
        header_map.insert(HEADER_PARTITION_KEY, headers.partition_key_hex().as_str());
        if let Some(msg_id) = &headers.msg_id {
            header_map.insert(HEADER_MSG_ID, msg_id.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| DispatchError::PublishFailure(format!("publish to '{subject}': {e}")))?;
        ack.await
            .map_err(|e| DispatchError::PublishFailure(format!("ack from '{subject}': {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for NatsBus {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>> {
        let stream = self
            .jetstream
            .get_stream(self.event_stream_name())
            .await
            .map_err(|e| DispatchError::Bus(format!("event stream lookup failed: {e}")))?;

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(durable_name(subject)),
                filter_subject: subject.to_string(),
                ack_policy: consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                DispatchError::Bus(format!("consumer setup for '{subject}' failed: {e}"))
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| DispatchError::Bus(format!("consumer stream for '{subject}': {e}")))?;

        debug!(subject, "bus subscription established");
        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            messages: Some(messages),
        }))
    }
}

/// Durable consumer names may not contain subject tokens.
fn durable_name(subject: &str) -> String {
    subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// A pull-consumer subscription.
pub struct NatsSubscription {
    subject: String,
    messages: Option<consumer::pull::Stream>,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next(&mut self) -> Option<InboundMessage> {
        let messages = self.messages.as_mut()?;
        loop {
            match messages.next().await? {
                Ok(message) => {
                    let msg_id = message
                        .headers
                        .as_ref()
                        .and_then(|h| h.get(HEADER_MSG_ID))
                        .map(|v| v.as_str().to_string());
                    return Some(InboundMessage {
                        subject: message.subject.to_string(),
                        payload: message.payload.clone(),
                        msg_id,
                        delivery: Arc::new(NatsDelivery { message }),
                    });
                }
                Err(e) => {
                    warn!(subject = %self.subject, error = %e, "subscription read error");
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.messages = None;
        Ok(())
    }
}

/// Delivery token wrapping a JetStream message.
struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    async fn ack(&self) {
        if let Err(e) = self.message.ack().await {
            warn!(error = %e, "message ack failed");
        }
    }

    async fn nack(&self) {
        if let Err(e) = self.message.ack_with(AckKind::Nak(None)).await {
            warn!(error = %e, "message nak failed");
        }
    }
}

/// Product settings store backed by a JetStream KV bucket.
pub struct NatsConfigStore {
    store: kv::Store,
}

#[async_trait]
impl ConfigStore for NatsConfigStore {
    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        self.store
            .get(name)
            .await
            .map_err(|e| DispatchError::Bus(format!("config get '{name}': {e}")))
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.store
            .put(name, data)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::Bus(format!("config put '{name}': {e}")))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.store
            .delete(name)
            .await
            .map_err(|e| DispatchError::Bus(format!("config delete '{name}': {e}")))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let keys = self
            .store
            .keys()
            .await
            .map_err(|e| DispatchError::Bus(format!("config keys: {e}")))?;
        keys.try_collect::<Vec<_>>()
            .await
            .map_err(|e| DispatchError::Bus(format!("config keys: {e}")))
    }

    async fn watch(&self) -> Result<BoxStream<'static, ConfigEvent>> {
        let watch = self
            .store
            .watch_all()
            .await
            .map_err(|e| DispatchError::Bus(format!("config watch: {e}")))?;

        let stream = watch.filter_map(|entry| async move {
            match entry {
                Ok(entry) => match entry.operation {
                    kv::Operation::Put => Some(ConfigEvent::Put {
                        name: entry.key,
                        data: entry.value,
                    }),
                    kv::Operation::Delete | kv::Operation::Purge => {
                        Some(ConfigEvent::Delete { name: entry.key })
                    }
                },
                Err(e) => {
                    warn!(error = %e, "config watch entry error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Dead-letter sink publishing to `$GVT.<domain>.DLQ.<product>`.
pub struct NatsDeadLetterSink {
    bus: NatsBus,
}

impl NatsDeadLetterSink {
    /// Creates a sink over an existing bus connection.
    #[must_use]
    pub fn new(bus: NatsBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeadLetterSink for NatsDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        let subject = format!("$GVT.{}.DLQ.{}", self.bus.domain, letter.product);
        let payload = letter.to_payload();
        let ack = self
            .bus
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| DispatchError::Bus(format!("dlq publish to '{subject}': {e}")))?;
        ack.await
            .map_err(|e| DispatchError::Bus(format!("dlq ack from '{subject}': {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_name_strips_subject_tokens() {
        assert_eq!(
            durable_name("$GVT.default.EVENT.orders"),
            "_GVT_default_EVENT_orders"
        );
        assert_eq!(durable_name("plain"), "plain");
    }
}
