use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::ExecutionView;

// ── Room events (outbound wire format) ───────────────────────────────

/// Everything that can be broadcast to a project room. The serde
/// representation of this enum is exactly the frame sent to clients, so
/// variants are named after their wire `type` tags. Payloads are immutable
/// once constructed; the bus serializes them once per publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A user joined or left the room.
    UserEvent { event: UserEventPayload },
    /// A live edit in an open file, relayed verbatim between clients.
    FileEdit { edit: FileEditPayload },
    /// A file record was created, updated or deleted through the API.
    FileEvent { event: FileEventPayload },
    ChatMessage { message: ChatMessagePayload },
    /// An execution record changed status.
    ExecutionUpdate { execution: ExecutionView },
    /// Roster snapshot sent to a session right after it attaches.
    ActiveUsers { users: Vec<Presence> },
}

impl RoomEvent {
    pub fn user_joined(presence: Presence) -> Self {
        Self::UserEvent {
            event: UserEventPayload {
                action: UserAction::Joined,
                user_id: presence.user_id,
                username: presence.username,
            },
        }
    }

    pub fn user_left(presence: Presence) -> Self {
        Self::UserEvent {
            event: UserEventPayload {
                action: UserAction::Left,
                user_id: presence.user_id,
                username: presence.username,
            },
        }
    }

    pub fn execution_update(execution: ExecutionView) -> Self {
        Self::ExecutionUpdate { execution }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Joined,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Created,
    Updated,
    Deleted,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("Invalid file action: {}", s)),
        }
    }
}

/// Identity a connection announced with its `join` message. The fields come
/// from the client payload and are relayed as-is (see the identity note in
/// DESIGN.md); absent fields stay null on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventPayload {
    pub action: UserAction,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEditPayload {
    pub file_id: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub cursor_position: Option<Value>,
    pub content: Option<String>,
    pub selection: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<String>,
}

/// Emitted by the file API; identity here is the authenticated caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEventPayload {
    pub action: FileAction,
    pub file_id: String,
    pub file_path: String,
    pub user_id: String,
    pub username: String,
}

// ── Client messages (inbound) ────────────────────────────────────────

/// Messages a session accepts while open. There is deliberately no `leave`
/// variant; departure is transport-level disconnect only.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        user_id: Option<String>,
        username: Option<String>,
    },
    FileEdit(FileEditPayload),
    ChatMessage(ChatMessagePayload),
}
