//! `GET /status` (spec.md §6). With `request_id`, reports that request's
//! cancellation/audio/derived-timing snapshot. Without it, reports the
//! process-wide counters from SPEC_FULL.md §9.5 — a read-only aggregate
//! view, not part of the per-request contract but useful for the same
//! operational visibility the teacher's services expose via `/healthz`
//! and friends.

use axum::extract::{Query, State};
use axum::Json;
use docent_core::ids::RequestId;
use docent_events::anchors;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TtsState {
    count: usize,
}

#[derive(Debug, Serialize)]
pub struct RequestStatus {
    request_id: String,
    cancelled: bool,
    tts_state: TtsState,
    derived_ms: docent_events::DerivedTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatusResponse {
    Request(RequestStatus),
    Aggregate(MetricsSnapshot),
}

pub async fn status(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Json<StatusResponse> {
    let Some(raw) = q.request_id else {
        let snapshot = state.metrics().snapshot(state.tts().fallback_count());
        return Json(StatusResponse::Aggregate(snapshot));
    };
    let request_id = RequestId(raw);
    let events = state.events().query(&request_id, None, None);
    let cancelled = events.iter().any(|e| e.name == anchors::CANCELLED);
    let last_error = events
        .iter()
        .find(|e| e.name == anchors::ERROR)
        .map(|e| serde_json::to_value(&e.fields).unwrap_or(Value::Null));
    let count = state.audio_buffer().segments_from(&request_id, 0).len();
    let derived_ms = state.events().derive(&request_id);

    Json(StatusResponse::Request(RequestStatus {
        request_id: request_id.to_string(),
        cancelled,
        tts_state: TtsState { count },
        derived_ms,
        last_error,
    }))
}
