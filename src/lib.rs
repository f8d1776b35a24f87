//! # counter-sync
//!
//! Client-side synchronization engine for a real-time multiplayer counter
//! game: every player increments their own score, sees everyone else's score
//! update live, and chats.
//!
//! ## Components
//!
//! - [`ConnectionManager`]: keeps one transport open, reconnects with a
//!   bounded-rate retry loop, and fans inbound messages out to listeners.
//! - [`SyncEngine`]: applies local increments optimistically, reconciles
//!   them with authoritative snapshots, animates an interpolated view and
//!   batches outbound `AddCount` messages.
//! - [`ActivityFeed`]: collects server log lines and chat.
//!
//! Components are constructed explicitly and wired together by passing a
//! [`ConnectionHandle`]; there is no global state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), counter_sync::CounterSyncError> {
//! use std::sync::Arc;
//! use counter_sync::{
//!     ConnectionConfig, ConnectionManager, MemoryNameStore, SyncConfig, SyncEngine,
//!     WebSocketConnector,
//! };
//!
//! let manager = ConnectionManager::start(
//!     WebSocketConnector::new("ws://127.0.0.1:7776"),
//!     ConnectionConfig::new(),
//! );
//! let engine = SyncEngine::start(
//!     manager.handle(),
//!     Arc::new(MemoryNameStore::new()),
//!     SyncConfig::new(),
//! );
//!
//! engine.set_name("Alice")?;
//! engine.apply_local_increment(1)?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod feed;
pub mod identity;
pub mod listeners;
pub mod protocol;
pub mod scores;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{
    CloseKind, ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStatus,
};
pub use engine::{GameView, SyncConfig, SyncEngine};
pub use error::CounterSyncError;
pub use feed::{ActivityFeed, FeedConfig, FeedEntry};
pub use identity::{FileNameStore, MemoryNameStore, NameStore};
pub use listeners::{listener, Listener};
pub use protocol::{ClientMessage, MessageKind, ScoreMap, ServerMessage};
pub use scores::{ScoreBoard, Totals};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
