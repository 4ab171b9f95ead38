//! Per-product subscribers and their lifecycle manager.
//!
//! A [`ProductSubscriber`] binds one product's inbound subject to a
//! [`Processor`] and publishes the pipeline's output to the product's
//! event subject. The [`SubscriberManager`] reacts to watcher
//! notifications: added products start a subscriber, removed products
//! drain and close theirs, and updated products are replaced (the old
//! subscriber is drained first, so no message is processed under a stale
//! subscription while the new rules are already live in the rule index).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gravity_record::RecordCodec;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bus::{BusConsumer, EventPublisher, PublishHeaders};
use crate::config::DispatcherConfig;
use crate::dlq::{DeadLetterQueue, DeadLetterSink};
use crate::error::{DispatchError, Result};
use crate::message::Message;
use crate::processor::{OutputHandler, Processor};
use crate::product::ProductSetting;
use crate::rule_manager::RuleManager;
use crate::watcher::ProductLifecycle;

/// Output handler that publishes encoded events to a fixed subject.
struct StreamOutput {
    publisher: Arc<dyn EventPublisher>,
    subject: String,
    codec: Arc<dyn RecordCodec>,
}

#[async_trait]
impl OutputHandler for StreamOutput {
    async fn handle(&self, message: &Message) -> Result<()> {
        let Some(event) = &message.product_event else {
            return Ok(());
        };
        let payload = self.codec.encode_event(event)?;
        let headers = PublishHeaders {
            event_name: event.event_name.clone(),
            partition_key: event.partition_key,
            msg_id: message.msg_id.clone(),
        };
        self.publisher
            .publish(&self.subject, &headers, payload.into())
            .await
    }
}

/// One product's inbound subscription, processor, and output binding.
pub struct ProductSubscriber {
    name: String,
    processor: Arc<Processor>,
    shutdown: Arc<Notify>,
    consume_task: tokio::task::JoinHandle<()>,
}

impl ProductSubscriber {
    /// Subscribes to the product's subject and starts its pipeline.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` when the setting has no inbound
    /// subject and `DispatchError::Bus` if the subscription fails.
    pub async fn start(
        setting: &ProductSetting,
        consumer: &Arc<dyn BusConsumer>,
        publisher: Arc<dyn EventPublisher>,
        codec: Arc<dyn RecordCodec>,
        dlq: Arc<DeadLetterQueue>,
        rule_manager: Arc<RuleManager>,
        config: &DispatcherConfig,
    ) -> Result<Self> {
        let subject = setting.subscription.subject.clone();
        if subject.is_empty() {
            return Err(DispatchError::Config(format!(
                "product '{}': no subscription subject",
                setting.name
            )));
        }

        let mut subscription = consumer.subscribe(&subject).await?;

        let output = Arc::new(StreamOutput {
            publisher,
            subject: config.event_subject(&setting.name),
            codec,
        });
        let processor = Arc::new(
            Processor::builder(&setting.name)
                .with_config(config.processor.clone())
                .with_rule_manager(rule_manager)
                .with_output_handler(output)
                .with_dead_letter_queue(dlq)
                .build(),
        );

        let shutdown = Arc::new(Notify::new());
        let consume_task = {
            let name = setting.name.clone();
            let processor = Arc::clone(&processor);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                loop {
                    let inbound = tokio::select! {
                        biased;
                        () = shutdown.notified() => break,
                        inbound = subscription.next() => match inbound {
                            Some(inbound) => inbound,
                            None => {
                                debug!(product = %name, "subscription ended");
                                break;
                            }
                        },
                    };

                    let mut message =
                        Message::with_delivery(inbound.payload, inbound.delivery);
                    message.msg_id = inbound.msg_id;
                    if let Err(e) = processor.push(message).await {
                        warn!(product = %name, error = %e, "push rejected, stopping consume loop");
                        break;
                    }
                }
                if let Err(e) = subscription.unsubscribe().await {
                    warn!(product = %name, error = %e, "unsubscribe failed");
                }
            })
        };

        info!(product = %setting.name, subject = %subject, "product subscriber started");
        Ok(Self {
            name: setting.name.clone(),
            processor,
            shutdown,
            consume_task,
        })
    }

    /// The product name this subscriber serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops consuming and drains the pipeline.
    pub async fn stop(self, config: &DispatcherConfig) {
        self.shutdown.notify_one();
        if let Err(e) = self.consume_task.await {
            warn!(product = %self.name, error = %e, "consume task join error");
        }
        self.processor.close(config.drain_timeout).await;
        info!(product = %self.name, "product subscriber stopped");
    }
}

/// Owns every product subscriber and applies lifecycle changes.
pub struct SubscriberManager {
    consumer: Arc<dyn BusConsumer>,
    publisher: Arc<dyn EventPublisher>,
    codec: Arc<dyn RecordCodec>,
    rule_manager: Arc<RuleManager>,
    config: DispatcherConfig,
    dlq: Arc<DeadLetterQueue>,
    subscribers: tokio::sync::Mutex<HashMap<String, ProductSubscriber>>,
}

impl SubscriberManager {
    /// Creates the manager and spawns the shared dead-letter writer.
    #[must_use]
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        publisher: Arc<dyn EventPublisher>,
        codec: Arc<dyn RecordCodec>,
        dlq_sink: Arc<dyn DeadLetterSink>,
        rule_manager: Arc<RuleManager>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (dlq, _writer) = DeadLetterQueue::spawn(dlq_sink, config.dlq_queue_depth);
        Arc::new(Self {
            consumer,
            publisher,
            codec,
            rule_manager,
            config,
            dlq,
            subscribers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Names of products with an active subscriber.
    pub async fn active_products(&self) -> Vec<String> {
        self.subscribers.lock().await.keys().cloned().collect()
    }

    /// Starts (or replaces) a product's subscriber.
    pub async fn upsert(&self, setting: ProductSetting) {
        let mut subscribers = self.subscribers.lock().await;

        // Replace: drain the old subscriber before binding the new one.
        if let Some(existing) = subscribers.remove(&setting.name) {
            existing.stop(&self.config).await;
        }

        match ProductSubscriber::start(
            &setting,
            &self.consumer,
            Arc::clone(&self.publisher),
            Arc::clone(&self.codec),
            Arc::clone(&self.dlq),
            Arc::clone(&self.rule_manager),
            &self.config,
        )
        .await
        {
            Ok(subscriber) => {
                subscribers.insert(setting.name.clone(), subscriber);
            }
            Err(e) => {
                warn!(product = %setting.name, error = %e, "failed to start product subscriber");
            }
        }
    }

    /// Drains and removes a product's subscriber.
    pub async fn remove(&self, name: &str) {
        let subscriber = self.subscribers.lock().await.remove(name);
        if let Some(subscriber) = subscriber {
            subscriber.stop(&self.config).await;
        }
    }

    /// Drains every subscriber (dispatcher shutdown).
    pub async fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock().await;
        for (_, subscriber) in subscribers.drain() {
            subscriber.stop(&self.config).await;
        }
    }
}

#[async_trait]
impl ProductLifecycle for SubscriberManager {
    async fn product_updated(&self, setting: ProductSetting) {
        self.upsert(setting).await;
    }

    async fn product_removed(&self, name: &str) {
        self.remove(name).await;
    }
}
