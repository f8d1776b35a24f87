//! Error types for the counter-sync client.

use thiserror::Error;

/// Errors that can occur when using the counter-sync client.
#[derive(Debug, Error)]
pub enum CounterSyncError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A local increment was attempted before a player name was chosen.
    #[error("no player name has been chosen yet")]
    NotReady,

    /// A player name must contain at least one non-whitespace character.
    #[error("player name must not be empty")]
    EmptyName,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for counter-sync operations.
pub type Result<T> = std::result::Result<T, CounterSyncError>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            CounterSyncError::TransportSend("broken pipe".into()).to_string(),
            "transport send error: broken pipe"
        );
        assert_eq!(
            CounterSyncError::NotReady.to_string(),
            "no player name has been chosen yet"
        );
        assert_eq!(CounterSyncError::Timeout.to_string(), "operation timed out");
    }

    #[test]
    fn converts_from_serde_and_io() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            CounterSyncError::from(serde_err),
            CounterSyncError::Serialization(_)
        ));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(matches!(CounterSyncError::from(io_err), CounterSyncError::Io(_)));
    }
}
