//! Error types for switchboard operations.
//!
//! All fallible operations in the crate return [`SwitchboardError`]. Redis
//! command errors that are expected during normal operation (BUSYGROUP on
//! group creation, missing ids on ack/delete) never surface here; the command
//! facade suppresses them before they reach a caller.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the switchboard core.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// The coordinator was asked to do something its setup does not allow:
    /// connecting without handlers, connecting twice, starting a dispatcher
    /// with no available workers.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation that requires a live connection was invoked on a
    /// coordinator that is not connected.
    #[error("not connected to a stream")]
    NotConnected,

    /// The Redis connection pool could not produce a usable connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A Redis command failed for a non-benign reason.
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    /// Entry content could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bounded wait on a request's mailbox expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A request with this id is already waiting on a reply.
    #[error("entry '{0}' already has a waiting caller")]
    DuplicateEntry(String),

    /// A stream entry carried a status outside the valid set.
    #[error("invalid entry status '{0}'")]
    InvalidStatus(String),

    /// A stream entry was missing one of the required fields.
    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A user request handler failed.
    #[error("handler error: {0}")]
    Handler(String),
}

impl From<deadpool_redis::PoolError> for SwitchboardError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

impl SwitchboardError {
    /// True if this error is the expiry of a send's bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detection() {
        let err = SwitchboardError::Timeout(Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(!SwitchboardError::NotConnected.is_timeout());
    }

    #[test]
    fn test_display_messages() {
        let err = SwitchboardError::Configuration("no request handler".to_string());
        assert_eq!(err.to_string(), "configuration error: no request handler");

        let err = SwitchboardError::DuplicateEntry("abc123".to_string());
        assert!(err.to_string().contains("abc123"));
    }
}
