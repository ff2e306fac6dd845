//! Error taxonomy shared across the orchestrator (spec.md §7).
//!
//! Shaped like the teacher's `querymt::error::LLMError` (a flat enum with a
//! `Display` impl), extended with `thiserror` derivation and the
//! `retriable` / `retry_after_ms` fields the wire contract (spec.md §6
//! "Error shape") requires.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("asr error ({provider}): {message}")]
    AsrError { provider: String, message: String },

    #[error("rag error ({provider}): {message}")]
    RagError { provider: String, message: String },

    #[error("tts error ({provider}): {message}")]
    TtsError { provider: String, message: String },

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Cancelled => "cancelled",
            ApiError::Timeout => "timeout",
            ApiError::AsrError { .. } => "asr_error",
            ApiError::RagError { .. } => "rag_error",
            ApiError::TtsError { .. } => "tts_error",
            ApiError::Internal => "internal_error",
        }
    }

    /// Per spec.md §7: input errors are never retried; upstream errors are
    /// retriable; rate limiting is retriable with a hint; cancellation and
    /// timeouts are terminal for the request (not retriable as-is).
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. }
                | ApiError::AsrError { .. }
                | ApiError::RagError { .. }
                | ApiError::TtsError { .. }
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Cancelled => StatusCode::OK,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::AsrError { .. } | ApiError::RagError { .. } | ApiError::TtsError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire shape from spec.md §6: `{code, message, retriable, retry_after_ms?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&ApiError> for ErrorBody {
    fn from(err: &ApiError) -> Self {
        // Internal faults never leak their detail to the client (spec.md §7).
        let message = match err {
            ApiError::Internal => "an internal error occurred".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: err.code().to_string(),
            message,
            retriable: err.retriable(),
            retry_after_ms: err.retry_after_ms(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody::from(&self);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_never_leak_detail() {
        let err = ApiError::Internal;
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, "internal_error");
        assert!(!body.message.to_lowercase().contains("panic"));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = ApiError::RateLimited { retry_after_ms: 500 };
        assert!(err.retriable());
        assert_eq!(err.retry_after_ms(), Some(500));
    }

    #[test]
    fn cancellation_is_not_retriable() {
        assert!(!ApiError::Cancelled.retriable());
    }
}
