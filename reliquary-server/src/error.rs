//! Mapping of engine errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reliquary::core::status::RunStatus;
use reliquary::error::EngineError;
use serde::Serialize;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_status: Option<RunStatus>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Engine(err) => match err {
                EngineError::RunNotFound(_) => (StatusCode::NOT_FOUND, "run_not_found"),
                EngineError::DuplicateRun(_) => (StatusCode::CONFLICT, "duplicate_run"),
                EngineError::InvalidTransition { .. } => {
                    (StatusCode::BAD_REQUEST, "invalid_transition")
                }
                EngineError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                EngineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                EngineError::Inconsistent { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "inconsistent")
                }
                EngineError::Corrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "corrupt"),
                EngineError::StorageFailure(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "storage_failure")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, err = %self, "request failed");
        }
        let current_status = match &self {
            ApiError::Engine(EngineError::InvalidTransition { current, .. }) => Some(*current),
            _ => None,
        };
        let body = ErrorBody {
            detail: self.to_string(),
            code,
            current_status,
        };
        (status, Json(body)).into_response()
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
