use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use matchpoint_types::api::{Claims, ToggleReactionRequest, ToggleReactionResponse};
use matchpoint_types::events::ChatEvent;

use crate::error::{ApiError, blocking};
use crate::state::AppStateInner;

pub async fn toggle_reaction(
    State(state): State<Arc<AppStateInner>>,
    Path((_conversation_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let me = claims.sub;

    let db_state = state.clone();
    let reaction_type = req.reaction_type.clone();
    let toggle = blocking(move || db_state.db.toggle_reaction(message_id, me, &reaction_type)).await?;

    let event = if toggle.added {
        ChatEvent::ReactionAdd {
            conversation_id: toggle.conversation_id,
            message_id,
            user_id: me,
            reaction_type: req.reaction_type,
        }
    } else {
        ChatEvent::ReactionRemove {
            conversation_id: toggle.conversation_id,
            message_id,
            user_id: me,
            reaction_type: req.reaction_type,
        }
    };
    state.dispatcher.broadcast(event);

    Ok(Json(ToggleReactionResponse {
        added: toggle.added,
    }))
}
