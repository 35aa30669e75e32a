use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use matchpoint_types::api::{Claims, TouchReadRequest};
use matchpoint_types::events::ChatEvent;

use crate::error::{ApiError, blocking};
use crate::state::AppStateInner;

/// Record a per-message read receipt. Stale receipts (already read, or sent
/// by a removed participant) are acknowledged without effect.
pub async fn mark_read(
    State(state): State<Arc<AppStateInner>>,
    Path((_conversation_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let db_state = state.clone();
    let mark = blocking(move || db_state.db.mark_read(message_id, me)).await?;

    if mark.recorded {
        state.dispatcher.broadcast(ChatEvent::ReadReceipt {
            conversation_id: mark.conversation_id,
            message_id,
            user_id: me,
        });
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Move the caller's conversation read position forward. Regressions are
/// dropped server-side, so clients may report freely out of order.
pub async fn touch_read(
    State(state): State<Arc<AppStateInner>>,
    Path(conversation_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<TouchReadRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;
    let timestamp = body
        .and_then(|Json(req)| req.timestamp)
        .unwrap_or_else(Utc::now);

    blocking(move || state.db.touch_last_read(conversation_id, me, timestamp)).await?;

    Ok(StatusCode::NO_CONTENT)
}
