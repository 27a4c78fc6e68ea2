//! Library error types.
//!
//! Two kinds of failure exist in this crate and they never mix:
//!
//! - [`FailKind`](crate::protocol::FailKind): protocol outcomes (wrong
//!   manager, stale version, unknown document). These are plain values that
//!   travel inside response envelopes.
//! - [`CollabError`]: local faults: bad configuration, codec failures, and
//!   requests that were cancelled or timed out before a response arrived.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Request {uid} cancelled")]
    Cancelled { uid: String },
    #[error("Request {uid} timed out after {timeout:?}")]
    Timeout { uid: String, timeout: Duration },
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::InvalidConfig("wait >= keep".into());
        assert_eq!(err.to_string(), "Invalid configuration: wait >= keep");

        let err = CollabError::Timeout {
            uid: "abc".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Request abc timed out after 250ms");
    }
}
