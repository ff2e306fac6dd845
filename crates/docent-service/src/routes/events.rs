//! `GET /events` (spec.md §6): a read-only export of a request's event
//! log, as a JSON array or newline-delimited JSON.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use docent_core::ids::RequestId;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    request_id: String,
    since_ts: Option<u64>,
    limit: Option<usize>,
    #[serde(default)]
    format: EventsFormat,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventsFormat {
    #[default]
    Json,
    Ndjson,
}

pub async fn events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Response {
    let events = state.events().query(&RequestId(q.request_id), q.since_ts, q.limit);
    if q.format == EventsFormat::Ndjson {
        let mut body = String::new();
        for event in &events {
            body.push_str(&serde_json::to_string(event).unwrap_or_default());
            body.push('\n');
        }
        ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
    } else {
        axum::Json(events).into_response()
    }
}
