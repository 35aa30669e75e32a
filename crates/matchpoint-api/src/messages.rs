use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use matchpoint_db::models::MessageRecord;
use matchpoint_db::{MessageCursor, StoreError};
use matchpoint_types::api::{
    Claims, EditMessageRequest, MessageResponse, ReactionGroup, SendMessageRequest,
};
use matchpoint_types::events::ChatEvent;

use crate::error::{ApiError, blocking};
use crate::state::AppStateInner;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `created_at` of the last message
    /// from the previous page to fetch older messages.
    pub before: Option<DateTime<Utc>>,
    /// Tie-breaking message id for `before` when timestamps collide.
    pub before_id: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<Arc<AppStateInner>>,
    Path(conversation_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let db_state = state.clone();
    let record = blocking(move || {
        db_state.db.post_message(
            conversation_id,
            me,
            &req.content,
            req.reply_to,
            req.attachment.as_ref(),
        )
    })
    .await?;

    state.dispatcher.broadcast(ChatEvent::MessageCreate {
        id: record.id,
        conversation_id: record.conversation_id,
        sender_id: record.sender_id,
        sender_name: record.sender_name.clone(),
        content: record.display_content().to_string(),
        reply_to: record.reply_to,
        created_at: record.created_at,
    });

    Ok((
        StatusCode::CREATED,
        Json(message_response(record, Vec::new())),
    ))
}

pub async fn get_messages(
    State(state): State<Arc<AppStateInner>>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let (records, reaction_rows) = blocking(move || {
        if !state.db.can_access(conversation_id, me)? {
            return Err(StoreError::Authorization(
                "not a participant of this conversation".into(),
            ));
        }

        let cursor = query.before.map(|created_at| MessageCursor {
            created_at,
            id: query.before_id,
        });
        let records = state
            .db
            .list_messages(conversation_id, cursor.as_ref(), query.limit)?;

        let message_ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let reaction_rows = state.db.reactions_for_messages(&message_ids)?;

        Ok((records, reaction_rows))
    })
    .await?;

    // Group reactions by message -> type -> user ids (cheap in-memory work,
    // fine on the async thread)
    let mut reaction_map: HashMap<i64, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for r in reaction_rows {
        reaction_map
            .entry(r.message_id)
            .or_default()
            .entry(r.reaction_type)
            .or_default()
            .push(r.user_id);
    }

    let messages: Vec<MessageResponse> = records
        .into_iter()
        .map(|record| {
            let groups = reaction_map
                .remove(&record.id)
                .map(|by_type| {
                    by_type
                        .into_iter()
                        .map(|(reaction_type, user_ids)| ReactionGroup {
                            reaction_type,
                            count: user_ids.len(),
                            user_ids,
                        })
                        .collect()
                })
                .unwrap_or_default();
            message_response(record, groups)
        })
        .collect();

    Ok(Json(messages))
}

pub async fn edit_message(
    State(state): State<Arc<AppStateInner>>,
    Path((_conversation_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let db_state = state.clone();
    let record = blocking(move || db_state.db.edit_message(message_id, me, &req.content)).await?;

    state.dispatcher.broadcast(ChatEvent::MessageUpdate {
        id: record.id,
        conversation_id: record.conversation_id,
        content: record.display_content().to_string(),
        edited_at: record.edited_at.unwrap_or(record.created_at),
    });

    Ok(Json(message_response(record, Vec::new())))
}

pub async fn delete_message(
    State(state): State<Arc<AppStateInner>>,
    Path((_conversation_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let db_state = state.clone();
    let record = blocking(move || db_state.db.delete_message(message_id, me)).await?;

    state.dispatcher.broadcast(ChatEvent::MessageDelete {
        id: record.id,
        conversation_id: record.conversation_id,
    });

    Ok(StatusCode::NO_CONTENT)
}

fn message_response(record: MessageRecord, reactions: Vec<ReactionGroup>) -> MessageResponse {
    let content = record.display_content().to_string();
    MessageResponse {
        id: record.id,
        conversation_id: record.conversation_id,
        sender_id: record.sender_id,
        sender_name: record.sender_name,
        content,
        reply_to: record.reply_to,
        is_edited: record.is_edited,
        edited_at: record.edited_at,
        is_deleted: record.is_deleted,
        attachment: record.attachment,
        created_at: record.created_at,
        reactions,
    }
}
