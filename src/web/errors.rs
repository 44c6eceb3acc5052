//! # Query API Error Types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::AgentCoreError;

/// API-facing error with an HTTP status and JSON body
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<AgentCoreError> for ApiError {
    fn from(err: AgentCoreError) -> Self {
        match err {
            AgentCoreError::TraceNotFound { trace_id } => {
                Self::NotFound(format!("trace not found: {trace_id}"))
            }
            AgentCoreError::Validation(message) => Self::BadRequest(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
