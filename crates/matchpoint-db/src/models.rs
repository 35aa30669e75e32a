//! Raw row types mapping directly to SQLite rows, plus their conversions into
//! the `matchpoint-types` domain models. Kept distinct so the storage layer's
//! string-encoded timestamps and uuids never leak past this crate.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use matchpoint_types::models::{
    Attachment, Conversation, ConversationType, Participant, ParticipantRole, Reaction,
};

use crate::error::{Result, StoreError};
use crate::parse_dt;

/// What readers see in place of a soft-deleted message's content. The stored
/// content is retained; masking is a display contract, not a storage one.
pub const MASKED_CONTENT: &str = "message removed";

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    s.parse()
        .map_err(|e| StoreError::Internal(format!("corrupt uuid {s:?}: {e}")))
}

pub(crate) struct ConversationRow {
    pub id: i64,
    pub conversation_type: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub(crate) fn into_conversation(self) -> Result<Conversation> {
        let conversation_type = ConversationType::parse(&self.conversation_type).ok_or_else(|| {
            StoreError::Internal(format!(
                "unknown conversation type {:?}",
                self.conversation_type
            ))
        })?;
        Ok(Conversation {
            id: self.id,
            conversation_type,
            title: self.title,
            created_at: parse_dt(&self.created_at)?,
            updated_at: parse_dt(&self.updated_at)?,
        })
    }
}

pub(crate) struct ParticipantRow {
    pub conversation_id: i64,
    pub user_id: String,
    pub display_name: Option<String>,
    pub role: String,
    pub joined_at: String,
    pub last_read_at: Option<String>,
    pub is_active: bool,
}

impl ParticipantRow {
    /// Convert into a domain participant plus the resolved display name
    /// (directory-stub rows fall back to "unknown").
    pub(crate) fn into_named(self) -> Result<(Participant, String)> {
        let role = ParticipantRole::parse(&self.role)
            .ok_or_else(|| StoreError::Internal(format!("unknown role {:?}", self.role)))?;
        let participant = Participant {
            conversation_id: self.conversation_id,
            user_id: parse_uuid(&self.user_id)?,
            role,
            joined_at: parse_dt(&self.joined_at)?,
            last_read_at: self.last_read_at.as_deref().map(parse_dt).transpose()?,
            is_active: self.is_active,
        };
        let display_name = self.display_name.unwrap_or_else(|| "unknown".to_string());
        Ok((participant, display_name))
    }
}

pub(crate) struct RawMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub reply_to: Option<i64>,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_size: Option<i64>,
    pub created_at: String,
}

impl RawMessage {
    pub(crate) fn into_record(self) -> Result<MessageRecord> {
        let attachment = self.attachment_type.map(|content_type| Attachment {
            content_type,
            size_bytes: self.attachment_size.unwrap_or(0),
        });
        Ok(MessageRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: parse_uuid(&self.sender_id)?,
            sender_name: self.sender_name.unwrap_or_else(|| "unknown".to_string()),
            content: self.content,
            reply_to: self.reply_to,
            is_edited: self.is_edited,
            edited_at: self.edited_at.as_deref().map(parse_dt).transpose()?,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at.as_deref().map(parse_dt).transpose()?,
            attachment,
            created_at: parse_dt(&self.created_at)?,
        })
    }
}

/// A stored message with its sender's display name resolved.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub reply_to: Option<i64>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Render-safe content: soft-deleted messages are masked for every reader.
    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            MASKED_CONTENT
        } else {
            &self.content
        }
    }
}

pub(crate) struct RawReaction {
    pub message_id: i64,
    pub user_id: String,
    pub reaction_type: String,
    pub created_at: String,
}

impl RawReaction {
    pub(crate) fn into_reaction(self) -> Result<Reaction> {
        Ok(Reaction {
            message_id: self.message_id,
            user_id: parse_uuid(&self.user_id)?,
            reaction_type: self.reaction_type,
            created_at: parse_dt(&self.created_at)?,
        })
    }
}
