//! Wire-compatible protocol types for the counter game server.
//!
//! Every message is a JSON object discriminated by a `"type"` field. Payload
//! fields sit next to the tag (internally tagged), e.g.
//! `{"type":"AddCount","data":3}` or
//! `{"type":"UpdateState","new_state":{"Alice":4}}`.
//!
//! There are no acknowledgements or sequence numbers; delivery is best-effort.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Player display name. Unique key of every score map.
pub type PlayerName = String;

/// Score value (and score delta) for a single player.
pub type Score = i64;

/// Mapping from player name to score.
///
/// Ordered so that iteration (and therefore logging and test output) is
/// deterministic.
pub type ScoreMap = BTreeMap<PlayerName, Score>;

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Full authoritative snapshot of every player's score.
    UpdateState { new_state: ScoreMap },
    /// Informational log line (logins, logoffs, connection ids).
    Log { message: String },
    /// Chat line broadcast by another player.
    ChatMessage { message: String, username: String },
}

impl ServerMessage {
    /// Returns the tag this message is dispatched under.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::UpdateState { .. } => MessageKind::UpdateState,
            Self::Log { .. } => MessageKind::Log,
            Self::ChatMessage { .. } => MessageKind::ChatMessage,
        }
    }
}

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Declare (or change) the display name of this connection.
    SetName { data: PlayerName },
    /// Increment the authoritative score of the current name by `data`.
    AddCount { data: Score },
    /// Broadcast a chat line as the current name.
    SendMessage { data: String },
}

/// Tag of a [`ServerMessage`], used as the listener registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    UpdateState,
    Log,
    ChatMessage,
}

impl MessageKind {
    /// The wire value of the `"type"` field for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdateState => "UpdateState",
            Self::Log => "Log",
            Self::ChatMessage => "ChatMessage",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

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
    fn update_state_matches_server_format() {
        let json = r#"{"type":"UpdateState","new_state":{"Alice":4,"Bob":0}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::UpdateState { new_state } = &msg else {
            panic!("expected UpdateState, got {msg:?}");
        };
        assert_eq!(new_state.get("Alice"), Some(&4));
        assert_eq!(new_state.get("Bob"), Some(&0));
        assert_eq!(msg.kind(), MessageKind::UpdateState);
    }

    #[test]
    fn chat_message_matches_server_format() {
        let json = r#"{"type":"ChatMessage","message":"hi","username":"Bob"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::ChatMessage {
                message: "hi".into(),
                username: "Bob".into(),
            }
        );
        assert_eq!(msg.kind().as_str(), "ChatMessage");
    }

    #[test]
    fn client_messages_serialize_with_data_field() {
        let json = serde_json::to_string(&ClientMessage::AddCount { data: 3 }).unwrap();
        assert_eq!(json, r#"{"type":"AddCount","data":3}"#);

        let json = serde_json::to_string(&ClientMessage::SetName {
            data: "Alice".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"SetName","data":"Alice"}"#);

        let json = serde_json::to_string(&ClientMessage::SendMessage {
            data: "gg".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"SendMessage","data":"gg"}"#);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = r#"{"type":"Scoreboard","rows":[]}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }

    #[test]
    fn missing_payload_is_rejected() {
        let json = r#"{"type":"UpdateState"}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }

    #[test]
    fn kind_display_matches_wire_tag() {
        assert_eq!(MessageKind::Log.to_string(), "Log");
        assert_eq!(MessageKind::UpdateState.to_string(), "UpdateState");
    }
}
