//! Dispatcher error taxonomy.
//!
//! The policy split matters more than the variants themselves: anything
//! deterministic given the input (`BadInput`, `NoRule`, `ScriptTimeout`,
//! `ScriptError`, `MissingPK`, `CodecFailure`) is dead-lettered and ACKed,
//! since redelivery cannot fix it. Only transient infrastructure failures
//! (`PublishFailure`, `Bus`) are retried, and only `Shutdown` NACKs so the
//! bus redelivers.

use std::time::Duration;

use thiserror::Error;

/// Result alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The inbound payload is not structurally parseable.
    #[error("bad input: {0}")]
    BadInput(String),

    /// No rule is configured for the `(product, event)` pair.
    #[error("no rule for event '{event}' in product '{product}'")]
    NoRule {
        /// Product the message arrived on.
        product: String,
        /// Event name carried by the message.
        event: String,
    },

    /// A schema definition could not be parsed.
    #[error("bad schema: {0}")]
    BadSchema(String),

    /// A transform script exceeded its wall-clock budget.
    #[error("script timed out after {0:?}")]
    ScriptTimeout(Duration),

    /// A transform script failed or returned an unusable value.
    #[error("script failed: {0}")]
    ScriptError(String),

    /// A primary-key field is absent from the output record.
    #[error("missing primary key field '{0}'")]
    MissingPk(String),

    /// The record codec rejected a record or event.
    #[error("codec failure: {0}")]
    Codec(#[from] gravity_record::RecordError),

    /// Publishing to the bus failed; retried with backoff before
    /// dead-lettering.
    #[error("publish failed: {0}")]
    PublishFailure(String),

    /// The dispatcher is draining; the message is NACKed for redelivery.
    #[error("dispatcher shutting down")]
    Shutdown,

    /// Invalid product, rule, or dispatcher configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A bus operation other than publish failed.
    #[error("bus error: {0}")]
    Bus(String),
}

impl DispatchError {
    /// Returns `true` when retrying may succeed (transient infrastructure
    /// failure, not a property of the message itself).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::PublishFailure(_) | DispatchError::Bus(_)
        )
    }

    /// Short stable name for DLQ records and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::BadInput(_) => "bad_input",
            DispatchError::NoRule { .. } => "no_rule",
            DispatchError::BadSchema(_) => "bad_schema",
            DispatchError::ScriptTimeout(_) => "script_timeout",
            DispatchError::ScriptError(_) => "script_error",
            DispatchError::MissingPk(_) => "missing_pk",
            DispatchError::Codec(_) => "codec_failure",
            DispatchError::PublishFailure(_) => "publish_failure",
            DispatchError::Shutdown => "shutdown",
            DispatchError::Config(_) => "config",
            DispatchError::Bus(_) => "bus",
        }
    }
}
