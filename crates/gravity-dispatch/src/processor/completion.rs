//! Group acknowledgement for fan-out transforms.
//!
//! A transform that produces N output records turns one inbound message
//! into N independent children. The source message must settle exactly
//! once, after the last child finishes: each child reports success (or a
//! dead-lettered failure, which still ACKs) or a shutdown (which NACKs),
//! and the final report settles the delivery. Any NACK wins over ACKs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::message::Delivery;

/// Per-parent completion counter.
pub struct Completion {
    delivery: Arc<dyn Delivery>,
    pending: AtomicUsize,
    nack: AtomicBool,
}

impl Completion {
    /// Creates a completion tracking `children` outstanding outputs.
    #[must_use]
    pub fn new(delivery: Arc<dyn Delivery>, children: usize) -> Arc<Self> {
        Arc::new(Self {
            delivery,
            pending: AtomicUsize::new(children.max(1)),
            nack: AtomicBool::new(false),
        })
    }

    /// Reports one child finished in an ACKable way (published, filtered,
    /// or dead-lettered).
    pub async fn child_done(&self) {
        self.settle().await;
    }

    /// Reports one child hit a transient/shutdown failure; the source
    /// message will NACK once all children report.
    pub async fn child_nack(&self) {
        self.nack.store(true, Ordering::Release);
        self.settle().await;
    }

    async fn settle(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self.nack.load(Ordering::Acquire) {
                self.delivery.nack().await;
            } else {
                self.delivery.ack().await;
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("nack", &self.nack.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
