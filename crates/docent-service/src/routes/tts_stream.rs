//! `GET /tts_stream` (spec.md §6): chunked audio bound to an existing
//! request's `AudioSegment` sequence. Subscribes to the live broadcast
//! channel *before* reading the already-emitted snapshot, then skips
//! anything the live feed replays that the snapshot already covered — the
//! same subscribe-before-read shape `docent_events::EventStore::stream`
//! documents, applied here to `AudioBufferStore`.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use docent_core::ids::RequestId;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TtsStreamQuery {
    request_id: String,
    seq: Option<u32>,
}

pub async fn tts_stream(State(state): State<AppState>, Query(q): Query<TtsStreamQuery>) -> Response {
    let request_id = RequestId(q.request_id);
    let from_seq = q.seq.unwrap_or(0);

    let rx = state.audio_buffer().subscribe(&request_id);
    let initial = state.audio_buffer().segments_from(&request_id, from_seq);
    let last_seq = initial.last().map(|s| s.seq);
    let content_type = initial
        .first()
        .map(|s| s.content_type.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let initial_stream = futures::stream::iter(
        initial.into_iter().map(|s| Ok::<Bytes, std::io::Error>(Bytes::from(s.bytes))),
    );
    let live_stream = futures::stream::unfold((rx, last_seq), |(mut rx, mut last_seq)| async move {
        loop {
            match rx.recv().await {
                Ok(seg) => {
                    if last_seq.map(|l| seg.seq <= l).unwrap_or(false) {
                        continue;
                    }
                    last_seq = Some(seg.seq);
                    return Some((Ok::<Bytes, std::io::Error>(Bytes::from(seg.bytes)), (rx, last_seq)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let body = Body::from_stream(futures::StreamExt::chain(initial_stream, live_stream));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap_or_else(|_| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "").into_response())
}
