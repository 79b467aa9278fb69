//! Error types for hiomi-web

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hiomi_client::ClientError;
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request superseded by another one (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upload or backend failure
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Client(ref err) => {
                let (status, code) = match err {
                    ClientError::RejectedFile(_) => (StatusCode::BAD_REQUEST, "REJECTED_FILE"),
                    ClientError::Network { .. } => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
                    _ => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
                };
                (status, code, err.user_message())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
