//! Server log lines and chat, collected for display.
//!
//! [`ActivityFeed`] subscribes to `Log` and `ChatMessage` on a
//! [`ConnectionHandle`] and keeps the most recent entries. The server does not
//! echo chat back to its sender, so [`ActivityFeed::send_chat`] records the
//! local line itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::connection::ConnectionHandle;
use crate::listeners::{listener, Listener};
use crate::protocol::{ClientMessage, MessageKind, ServerMessage};

/// Default number of entries kept by an [`ActivityFeed`].
pub const DEFAULT_FEED_CAPACITY: usize = 200;

/// Capacity of the live update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// One line in the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Log {
        message: String,
        received_at: SystemTime,
    },
    Chat {
        username: String,
        message: String,
        received_at: SystemTime,
        /// Sent by the local player.
        local: bool,
    },
}

impl FeedEntry {
    pub fn message(&self) -> &str {
        match self {
            Self::Log { message, .. } | Self::Chat { message, .. } => message,
        }
    }
}

/// Configuration for an [`ActivityFeed`].
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Oldest entries are dropped beyond this many. Values below 1 are
    /// clamped to 1.
    ///
    /// Defaults to **200**.
    pub capacity: usize,
}

impl FeedConfig {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct FeedInner {
    entries: Mutex<VecDeque<FeedEntry>>,
    capacity: usize,
    updates: broadcast::Sender<FeedEntry>,
}

impl FeedInner {
    fn entries(&self) -> MutexGuard<'_, VecDeque<FeedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: FeedEntry) {
        {
            let mut entries = self.entries();
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = self.updates.send(entry);
    }
}

/// Bounded history of log and chat lines.
pub struct ActivityFeed {
    inner: Arc<FeedInner>,
    connection: ConnectionHandle,
    listeners: Vec<(MessageKind, Listener)>,
}

impl ActivityFeed {
    /// Start collecting `Log` and `ChatMessage` lines from `connection`.
    pub fn attach(connection: ConnectionHandle, config: FeedConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let inner = Arc::new(FeedInner {
            entries: Mutex::new(VecDeque::new()),
            capacity: config.capacity.max(1),
            updates,
        });

        let on_message = {
            let inner = Arc::clone(&inner);
            listener(move |message| {
                let received_at = SystemTime::now();
                let entry = match message {
                    ServerMessage::Log { message } => FeedEntry::Log {
                        message: message.clone(),
                        received_at,
                    },
                    ServerMessage::ChatMessage { message, username } => FeedEntry::Chat {
                        username: username.clone(),
                        message: message.clone(),
                        received_at,
                        local: false,
                    },
                    ServerMessage::UpdateState { .. } => return,
                };
                inner.push(entry);
            })
        };

        let listeners = vec![
            (MessageKind::Log, Arc::clone(&on_message)),
            (MessageKind::ChatMessage, on_message),
        ];
        for (kind, l) in &listeners {
            connection.add_listener(*kind, Arc::clone(l));
        }

        Self {
            inner,
            connection,
            listeners,
        }
    }

    /// Send a chat line as `name`.
    ///
    /// The text is trimmed. Nothing happens for blank text or when no name
    /// has been chosen. Returns `true` if the line was handed to the
    /// connection.
    pub fn send_chat(&self, name: Option<&str>, text: &str) -> bool {
        let text = text.trim();
        let Some(name) = name else {
            return false;
        };
        if text.is_empty() {
            return false;
        }
        self.inner.push(FeedEntry::Chat {
            username: name.to_string(),
            message: text.to_string(),
            received_at: SystemTime::now(),
            local: true,
        });
        self.connection.send(ClientMessage::SendMessage {
            data: text.to_string(),
        })
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<FeedEntry> {
        self.inner.entries().iter().cloned().collect()
    }

    /// Retained chat entries, oldest first.
    pub fn chat(&self) -> Vec<FeedEntry> {
        self.inner
            .entries()
            .iter()
            .filter(|e| matches!(e, FeedEntry::Chat { .. }))
            .cloned()
            .collect()
    }

    /// Retained log entries, oldest first.
    pub fn logs(&self) -> Vec<FeedEntry> {
        self.inner
            .entries()
            .iter()
            .filter(|e| matches!(e, FeedEntry::Log { .. }))
            .cloned()
            .collect()
    }

    /// Receive every new entry as it is recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEntry> {
        self.inner.updates.subscribe()
    }
}

impl std::fmt::Debug for ActivityFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityFeed")
            .field("entries", &self.inner.entries().len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        for (kind, l) in &self.listeners {
            self.connection.remove_listener(*kind, l);
        }
    }
}
