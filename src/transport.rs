//! Transport abstraction for the counter game protocol.
//!
//! The [`Transport`] trait defines one live bidirectional text message channel
//! between the client and server. The protocol uses JSON text messages, so
//! every transport implementation must handle message framing internally
//! (e.g., WebSocket frames, length-prefixed TCP).
//!
//! # Connection Setup
//!
//! A [`Transport`] is a single connection and is never reopened. Because the
//! [`ConnectionManager`](crate::connection::ConnectionManager) replaces the
//! connection wholesale on every reconnect attempt, it is handed a
//! [`Connector`] instead: a factory that opens a fresh transport each time it
//! is asked to.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use counter_sync::error::CounterSyncError;
//! use counter_sync::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), CounterSyncError> {
//!         // Send the JSON text message over your transport
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, CounterSyncError>> {
//!         // Receive the next JSON text message
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), CounterSyncError> {
//!         // Gracefully shut down the connection
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector { address: String }
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     type Transport = MyTransport;
//!
//!     async fn connect(&self) -> Result<MyTransport, CounterSyncError> {
//!         // Open a brand new connection to `self.address`
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::CounterSyncError;

/// A bidirectional text message transport for the counter game protocol.
///
/// Implementors shuttle serialized JSON strings between the client and server.
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`CounterSyncError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), CounterSyncError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, CounterSyncError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), CounterSyncError>;
}

/// Opens fresh [`Transport`]s to one fixed endpoint.
///
/// A returned transport counts as "open": `connect` resolving with `Ok` is the
/// established signal, resolving with `Err` is the error signal. The manager
/// bounds every call with its attempt timeout and drops the future when the
/// deadline passes, so an abandoned attempt can never be adopted later.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The transport type produced by this connector.
    type Transport: Transport;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns any error raised while establishing the connection; the
    /// manager treats every error as recoverable.
    async fn connect(&self) -> Result<Self::Transport, CounterSyncError>;
}
