use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, display_name: String },

    /// A new message was posted
    MessageCreate {
        id: i64,
        conversation_id: i64,
        sender_id: Uuid,
        sender_name: String,
        content: String,
        reply_to: Option<i64>,
        created_at: DateTime<Utc>,
    },

    /// A message was edited by its sender
    MessageUpdate {
        id: i64,
        conversation_id: i64,
        content: String,
        edited_at: DateTime<Utc>,
    },

    /// A message was soft-deleted; clients must render it as removed
    MessageDelete { id: i64, conversation_id: i64 },

    /// A reaction was added to a message
    ReactionAdd {
        conversation_id: i64,
        message_id: i64,
        user_id: Uuid,
        reaction_type: String,
    },

    /// A reaction was removed from a message
    ReactionRemove {
        conversation_id: i64,
        message_id: i64,
        user_id: Uuid,
        reaction_type: String,
    },

    /// A participant read a message for the first time
    ReadReceipt {
        conversation_id: i64,
        message_id: i64,
        user_id: Uuid,
    },

    /// A participant started typing. Connection state only, never persisted.
    TypingStart {
        conversation_id: i64,
        user_id: Uuid,
        display_name: String,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        display_name: String,
        online: bool,
    },
}

impl ChatEvent {
    /// Returns the conversation id if this event is scoped to a conversation.
    /// Events that return `None` are global and are delivered to all clients.
    pub fn conversation_id(&self) -> Option<i64> {
        match self {
            Self::MessageCreate { conversation_id, .. }
            | Self::MessageUpdate { conversation_id, .. }
            | Self::MessageDelete { conversation_id, .. }
            | Self::ReactionAdd { conversation_id, .. }
            | Self::ReactionRemove { conversation_id, .. }
            | Self::ReadReceipt { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. } => Some(*conversation_id),
            Self::Ready { .. } | Self::PresenceUpdate { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to events for specific conversations. The server only
    /// forwards conversation-scoped events for subscribed conversations.
    Subscribe { conversation_ids: Vec<i64> },

    /// Indicate typing in a conversation
    StartTyping { conversation_id: i64 },
}
