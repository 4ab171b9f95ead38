//! Dispatcher configuration.

use std::time::Duration;

/// Configuration for a [`Processor`](crate::processor::Processor) instance.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of transform workers and emit workers (each stage gets its
    /// own pool of this size). Per-PK ordering holds for any value.
    pub worker_count: usize,

    /// Admission queue depth. `push` blocks once this many messages are
    /// queued ahead of the parse stage.
    pub queue_depth: usize,

    /// Per-invocation wall-clock budget for transform scripts.
    pub script_timeout: Duration,

    /// Retry policy for transient publish failures in the emit stage.
    pub retry: RetryConfig,
}

impl ProcessorConfig {
    /// Sets the worker count (minimum 1).
    #[must_use]
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    /// Sets the admission queue depth (minimum 1).
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Sets the script timeout.
    #[must_use]
    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Capacity of each inter-stage channel: at least twice the worker
    /// count so a full pool never starves its feeding stage.
    #[must_use]
    pub fn stage_channel_capacity(&self) -> usize {
        (self.worker_count * 2).max(self.queue_depth / self.worker_count.max(1)).max(2)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            queue_depth: 1024,
            script_timeout: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential-backoff retry policy for transient emit failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts (first try included) before dead-lettering.
    pub max_attempts: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound on the backoff between attempts.
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Returns the backoff to sleep before retry number `retry` (1-based),
    /// doubling each time and capped at `max_backoff`.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let backoff = self.initial_backoff.saturating_mul(1_u32 << exp);
        backoff.min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Top-level dispatcher configuration shared by all product subscribers.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Gravity domain; scopes every subject (`$GVT.<domain>.…`).
    pub domain: String,

    /// Per-product processor configuration.
    pub processor: ProcessorConfig,

    /// How long a drain waits for in-flight messages before force-closing
    /// them with a shutdown error.
    pub drain_timeout: Duration,

    /// Queue depth for the asynchronous dead-letter writer.
    pub dlq_queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            domain: "default".into(),
            processor: ProcessorConfig::default(),
            drain_timeout: Duration::from_secs(30),
            dlq_queue_depth: 4096,
        }
    }
}

impl DispatcherConfig {
    /// Subject events for `product` are published to.
    #[must_use]
    pub fn event_subject(&self, product: &str) -> String {
        format!("$GVT.{}.EVENT.{}", self.domain, product)
    }

    /// Subject permanently-failed messages for `product` are parked on.
    #[must_use]
    pub fn dlq_subject(&self, product: &str) -> String {
        format!("$GVT.{}.DLQ.{}", self.domain, product)
    }
}
