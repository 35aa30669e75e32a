use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use matchpoint_db::StoreError;
use matchpoint_types::api::{
    AddParticipantRequest, Claims, ConversationDetail, CreateConversationRequest,
    DirectConversationRequest, DirectConversationResponse, ParticipantInfo,
};
use matchpoint_types::models::{Conversation, Participant};

use crate::error::{ApiError, blocking};
use crate::state::AppStateInner;

pub async fn create_conversation(
    State(state): State<Arc<AppStateInner>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = claims.sub;

    let detail = blocking(move || {
        // The creator is always a member, whether or not the client listed them.
        let mut members = vec![creator];
        members.extend(req.participant_ids.iter().copied().filter(|id| *id != creator));

        let conversation =
            state
                .db
                .create_conversation(req.conversation_type, req.title.as_deref(), &members)?;
        conversation_detail(&state, conversation.id)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_or_create_direct(
    State(state): State<Arc<AppStateInner>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<DirectConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let (detail, created) = blocking(move || {
        let (conversation, created) = state.db.get_or_create_direct(me, req.user_id)?;
        Ok((conversation_detail(&state, conversation.id)?, created))
    })
    .await?;

    Ok(Json(DirectConversationResponse {
        conversation: detail,
        created,
    }))
}

pub async fn list_conversations(
    State(state): State<Arc<AppStateInner>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;
    let summaries = blocking(move || state.db.list_conversations(me)).await?;
    Ok(Json(summaries))
}

pub async fn get_conversation(
    State(state): State<Arc<AppStateInner>>,
    Path(conversation_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let detail = blocking(move || {
        if !state.db.can_access(conversation_id, me)? {
            return Err(StoreError::Authorization(
                "not a participant of this conversation".into(),
            ));
        }
        conversation_detail(&state, conversation_id)
    })
    .await?;

    Ok(Json(detail))
}

pub async fn add_participant(
    State(state): State<Arc<AppStateInner>>,
    Path(conversation_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    blocking(move || {
        if !state.db.can_access(conversation_id, me)? {
            return Err(StoreError::Authorization(
                "not a participant of this conversation".into(),
            ));
        }
        state.db.add_participant(conversation_id, req.user_id, req.role)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_participant(
    State(state): State<Arc<AppStateInner>>,
    Path((conversation_id, user_id)): Path<(i64, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    blocking(move || {
        // Leaving is always allowed; removing someone else takes an admin.
        if user_id != me && !state.db.is_admin(conversation_id, me)? {
            return Err(StoreError::Authorization(
                "only an admin may remove another participant".into(),
            ));
        }
        state.db.remove_participant(conversation_id, user_id)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

fn conversation_detail(state: &AppStateInner, id: i64) -> Result<ConversationDetail, StoreError> {
    let (conversation, participants) = state
        .db
        .get_conversation(id)?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
    Ok(detail_from(conversation, participants))
}

fn detail_from(
    conversation: Conversation,
    participants: Vec<(Participant, String)>,
) -> ConversationDetail {
    ConversationDetail {
        id: conversation.id,
        conversation_type: conversation.conversation_type,
        title: conversation.title,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
        participants: participants
            .into_iter()
            .map(|(p, display_name)| ParticipantInfo {
                user_id: p.user_id,
                display_name,
                role: p.role,
                joined_at: p.joined_at,
            })
            .collect(),
    }
}
