//! In-process bus implementations for tests and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BusConsumer, BusSubscription, ConfigEvent, ConfigStore, EventPublisher, InboundMessage,
    PublishHeaders,
};
use crate::error::Result;
use crate::message::NoopDelivery;

/// One event captured by the [`MemoryPublisher`].
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Destination subject.
    pub subject: String,
    /// Publish headers.
    pub headers: PublishHeaders,
    /// Encoded payload.
    pub payload: Bytes,
}

/// Publisher that records every publish in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<PublishedEvent>>,
}

impl MemoryPublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a copy of everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().clone()
    }

    /// Number of publishes observed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(
        &self,
        subject: &str,
        headers: &PublishHeaders,
        payload: Bytes,
    ) -> Result<()> {
        self.events.lock().push(PublishedEvent {
            subject: subject.to_string(),
            headers: headers.clone(),
            payload,
        });
        Ok(())
    }
}

/// In-process subject bus: tests inject messages, subscribers receive them.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<InboundMessage>>>>,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers a payload to every subscriber of `subject`. Returns the
    /// number of subscribers reached.
    pub fn deliver(&self, subject: &str, payload: Bytes) -> usize {
        self.deliver_message(subject, payload, Arc::new(NoopDelivery))
    }

    /// Delivers a payload with an explicit delivery token.
    pub fn deliver_message(
        &self,
        subject: &str,
        payload: Bytes,
        delivery: Arc<dyn crate::message::Delivery>,
    ) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(subject) else {
            return 0;
        };
        senders.retain(|tx| {
            tx.send(InboundMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
                msg_id: None,
                delivery: Arc::clone(&delivery),
            })
            .is_ok()
        });
        senders.len()
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BusSubscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(MemorySubscription { rx }))
    }
}

/// Subscription end of the [`MemoryBus`].
pub struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// In-memory configuration store with watch support.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: Mutex<HashMap<String, Bytes>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ConfigEvent>>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn notify(&self, event: &ConfigEvent) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().get(name).cloned())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.entries.lock().insert(name.to_string(), data.clone());
        self.notify(&ConfigEvent::Put {
            name: name.to_string(),
            data,
        });
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.entries.lock().remove(name);
        self.notify(&ConfigEvent::Delete {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    async fn watch(&self) -> Result<BoxStream<'static, ConfigEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
