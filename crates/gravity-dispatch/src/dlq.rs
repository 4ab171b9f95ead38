//! Dead-letter queue: the parking lot for deterministically failed
//! messages.
//!
//! Pipeline stages report failures through a bounded channel; an async
//! writer task drains it into a pluggable [`DeadLetterSink`], so a slow or
//! unreachable DLQ destination never blocks the hot path. A full channel
//! drops the letter (counted and logged) rather than stalling a worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

/// The pipeline stage a failure was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Unmarshal + rule resolution + schema decode.
    Parse,
    /// Script execution (including filter drops).
    Transform,
    /// Column projection and primary-key computation.
    Project,
    /// Record codec serialization.
    Encode,
    /// Output handler invocation.
    Emit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Parse => write!(f, "parse"),
            Stage::Transform => write!(f, "transform"),
            Stage::Project => write!(f, "project"),
            Stage::Encode => write!(f, "encode"),
            Stage::Emit => write!(f, "emit"),
        }
    }
}

/// A permanently failed message, parked for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Product the message belonged to.
    pub product: String,
    /// Event name, when it was resolvable.
    pub event: Option<String>,
    /// The original inbound payload.
    pub raw: Bytes,
    /// The stage that failed.
    pub stage: Stage,
    /// Stable error kind (see `DispatchError::kind`).
    pub reason: &'static str,
    /// Human-readable error description.
    pub error: String,
}

impl DeadLetter {
    /// Serializes the letter for publishing: the original payload plus the
    /// failure metadata.
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        let body = serde_json::json!({
            "product": self.product,
            "event": self.event,
            "stage": self.stage.to_string(),
            "reason": self.reason,
            "error": self.error,
            "payload": base64::engine::general_purpose::STANDARD.encode(&self.raw),
        });
        Bytes::from(body.to_string())
    }
}

/// Destination backend for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Writes one dead letter to the destination.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the write fails; the writer logs and moves on.
    async fn publish(&self, letter: DeadLetter) -> Result<()>;
}

/// In-memory sink for tests and development.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: parking_lot::Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a copy of the collected letters.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Number of collected letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Returns `true` if no letters were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Front end of the DLQ: a bounded, non-blocking hand-off from pipeline
/// workers to the async writer task.
#[derive(Debug)]
pub struct DeadLetterQueue {
    tx: mpsc::Sender<DeadLetter>,
    dropped: AtomicU64,
}

impl DeadLetterQueue {
    /// Spawns the writer task and returns the queue handle.
    ///
    /// The writer runs until every queue handle is dropped, then exits.
    pub fn spawn(
        sink: Arc<dyn DeadLetterSink>,
        depth: usize,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DeadLetter>(depth.max(1));
        let writer = tokio::spawn(async move {
            while let Some(letter) = rx.recv().await {
                if let Err(e) = sink.publish(letter).await {
                    warn!(error = %e, "failed to write dead letter");
                }
            }
        });
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            writer,
        )
    }

    /// Enqueues a letter without blocking. A full queue drops the letter.
    pub fn report(&self, letter: DeadLetter) {
        if let Err(mpsc::error::TrySendError::Full(letter)) = self.tx.try_send(letter) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                product = %letter.product,
                stage = %letter.stage,
                dropped_total = total,
                "dead letter queue full, dropping letter"
            );
        }
    }

    /// Number of letters dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(stage: Stage) -> DeadLetter {
        DeadLetter {
            product: "TestDataProduct".into(),
            event: Some("dataCreated".into()),
            raw: Bytes::from_static(b"{\"id\":1}"),
            stage,
            reason: "bad_input",
            error: "payload is not valid JSON".into(),
        }
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Parse.to_string(), "parse");
        assert_eq!(Stage::Emit.to_string(), "emit");
    }

    #[test]
    fn test_letter_payload_shape() {
        let payload = letter(Stage::Parse).to_payload();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["product"], "TestDataProduct");
        assert_eq!(json["event"], "dataCreated");
        assert_eq!(json["stage"], "parse");
        assert_eq!(json["reason"], "bad_input");
        let original = base64::engine::general_purpose::STANDARD
            .decode(json["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(original, b"{\"id\":1}");
    }

    #[tokio::test]
    async fn test_queue_delivers_to_sink() {
        let sink = MemoryDeadLetterSink::new();
        let (queue, writer) = DeadLetterQueue::spawn(Arc::clone(&sink) as _, 16);

        queue.report(letter(Stage::Parse));
        queue.report(letter(Stage::Emit));
        drop(queue);
        writer.await.unwrap();

        let letters = sink.letters();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].stage, Stage::Parse);
        assert_eq!(letters[1].stage, Stage::Emit);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        struct StuckSink(tokio::sync::Notify);

        #[async_trait]
        impl DeadLetterSink for StuckSink {
            async fn publish(&self, _letter: DeadLetter) -> Result<()> {
                self.0.notified().await;
                Ok(())
            }
        }

        let sink = Arc::new(StuckSink(tokio::sync::Notify::new()));
        let (queue, writer) = DeadLetterQueue::spawn(Arc::clone(&sink) as _, 1);

        // One letter fills the channel (the writer is stuck in publish for
        // the first), further reports drop.
        for _ in 0..4 {
            queue.report(letter(Stage::Parse));
        }
        assert!(queue.dropped() >= 2);

        sink.0.notify_waiters();
        drop(queue);
        drop(sink);
        writer.abort();
        let _ = writer.await;
    }
}
