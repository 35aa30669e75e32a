use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Attachment, ConversationType, ParticipantRole};

// -- Identity --

/// Token claims minted by the platform's identity service. Canonical
/// definition lives here so the REST middleware and the WebSocket gateway
/// validate the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub display_name: String,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectConversationRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub role: ParticipantRole,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TouchReadRequest {
    /// Client-observed read position. Defaults to the server clock. Updates
    /// that would move the position backwards are dropped.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    pub id: i64,
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Serialize)]
pub struct DirectConversationResponse {
    pub conversation: ConversationDetail,
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct MessagePreview {
    pub id: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub participant_count: i64,
    pub unread_count: i64,
    pub last_message: Option<MessagePreview>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub reply_to: Option<i64>,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub reply_to: Option<i64>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<ReactionGroup>,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub reaction_type: String,
}

#[derive(Debug, Serialize)]
pub struct ToggleReactionResponse {
    pub added: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub reaction_type: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}
