//! Header parsing shared by every handler (spec.md §6: "Every request must
//! carry `X-Client-ID`; optionally `X-Request-ID`").

use axum::http::HeaderMap;
use docent_core::error::ApiError;
use docent_core::ids::{ClientId, RequestId};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn client_id(headers: &HeaderMap) -> Result<ClientId, ApiError> {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(ClientId::from)
        .ok_or_else(|| ApiError::BadRequest("missing X-Client-ID header".to_string()))
}

pub fn request_id(headers: &HeaderMap) -> RequestId {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(RequestId::from)
        .unwrap_or_else(RequestId::generate)
}
