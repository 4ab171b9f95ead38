//! Record error types.

use thiserror::Error;

/// Result alias for record operations.
pub type Result<T> = std::result::Result<T, RecordError>;

/// Errors that can occur while encoding, decoding, or addressing records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The codec failed to serialize a record or event.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The codec failed to deserialize a record or event.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A dotted field path could not be parsed.
    #[error("invalid field path '{0}'")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecordError::Encode("unexpected NaN".into());
        assert_eq!(err.to_string(), "encode failed: unexpected NaN");

        let err = RecordError::InvalidPath("a..b".into());
        assert!(err.to_string().contains("a..b"));
    }
}
