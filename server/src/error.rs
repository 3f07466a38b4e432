use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use stream_core::{ScriptError, VoiceError};
use thiserror::Error;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Generation error: {0}")]
    Generation(#[from] anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Another generation is in progress. Please wait or stop it first.")]
    Busy,
}

impl From<ScriptError> for ApiError {
    fn from(e: ScriptError) -> Self {
        ApiError::InvalidInput(e.to_string())
    }
}

impl From<VoiceError> for ApiError {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::NotFound(name) => ApiError::NotFound(format!("Voice '{name}' not found")),
            VoiceError::Io(e) => ApiError::InternalError(format!("Voice storage error: {e}")),
            other => ApiError::InvalidInput(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Generation(_) | ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = match self {
            ApiError::InvalidInput(msg) | ApiError::NotFound(msg) => msg,
            ApiError::Generation(e) => {
                tracing::error!("Generation error: {:#}", e);
                format!("Generation error: {e}")
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                msg
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}
