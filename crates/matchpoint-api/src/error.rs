use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use matchpoint_db::StoreError;

/// Store errors rendered as HTTP responses: validation 422, authorization
/// 403, conflict/state 409, not-found 404. Infrastructure failures become an
/// opaque 500.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self(StoreError::Internal(msg.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Authorization(_) => StatusCode::FORBIDDEN,
            StoreError::Conflict(_) | StoreError::State(_) => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Sqlite(_) | StoreError::Internal(_) => {
                error!("store failure: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))?;
    joined.map_err(ApiError::from)
}
