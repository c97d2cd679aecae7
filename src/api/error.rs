use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Validation failure returned from the write handlers. Serialized as
/// `{"error": "..."}` to match what the UI expects.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::BadRequest(message) = self;
        let body = Json(serde_json::json!({ "error": message }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}
