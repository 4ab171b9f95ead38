//! # Gravity Dispatch
//!
//! The per-event processing core of the Gravity data-products platform.
//! For each configured product it consumes raw events from an inbound
//! subject, validates and transforms them against the product's rules, and
//! publishes canonical records to the product's durable stream.
//!
//! ## Architecture
//!
//! ```text
//! bus subject ─▶ ProductSubscriber ─▶ Processor.push
//!                   parse ─▶ transform ─▶ project ─▶ encode ─▶ emit
//!                     │          │ (DLQ on deterministic failure)
//!                     ▼          ▼
//!                RuleManager   Transformer (rhai sandbox)
//!
//! config store ─▶ ConfigWatcher ─▶ RuleManager replace
//!                               └▶ SubscriberManager (re)bind
//! ```
//!
//! The pipeline guarantees per-partition-key FIFO ordering, bounded
//! back-pressure from the admission queue outward, and the dead-letter
//! policy described in [`error`]: deterministic failures park in the DLQ
//! and ACK, transient publish failures retry with backoff, and shutdown
//! NACKs so the bus redelivers.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod dlq;
pub mod error;
pub mod message;
pub mod processor;
pub mod product;
pub mod rule;
pub mod rule_manager;
pub mod schema;
pub mod subscriber;
pub mod transform;
pub mod watcher;

pub use config::{DispatcherConfig, ProcessorConfig, RetryConfig};
pub use error::{DispatchError, Result};
pub use message::{Delivery, Message, MessageRawData};
pub use processor::{OutputHandler, Processor};
pub use product::ProductSetting;
pub use rule::{Handler, Rule};
pub use rule_manager::RuleManager;
pub use schema::Schema;
pub use subscriber::{ProductSubscriber, SubscriberManager};
pub use transform::Transformer;
pub use watcher::{ConfigWatcher, ProductLifecycle};
