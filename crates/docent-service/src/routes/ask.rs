//! `POST /ask` (spec.md §6). Admits the question through the orchestrator,
//! then forwards three concurrent sources into one SSE response: the
//! text sink the orchestrator writes cleaned chunks to, the request's
//! event stream (turned into `audio_ready`/`done`/`error` frames), and a
//! heartbeat ticker. Grounded on the teacher's `querymt-service` SSE
//! handlers (`.scan()`/`.flat_map()` over a provider stream into
//! `Event::default().data(...)`), generalized here to merge three sources
//! instead of one via a forwarding task plus an outgoing channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use docent_core::error::ApiError;
use docent_core::model::RequestKind;
use docent_events::anchors;
use docent_orchestrator::{AskInput, AskRequest, ChannelTextSink};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::routes::extract::{client_id, request_id};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskBody {
    question: String,
    session_id: Option<String>,
    kind: Option<String>,
    #[allow(dead_code)]
    style: Option<String>,
    #[allow(dead_code)]
    duration_s: Option<u32>,
}

fn parse_kind(raw: &str) -> Result<RequestKind, ApiError> {
    match raw {
        "ask" => Ok(RequestKind::Ask),
        "wake_word" => Ok(RequestKind::WakeWord),
        other => Err(ApiError::BadRequest(format!("unknown request kind: {other}"))),
    }
}

pub async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let client = client_id(&headers)?;
    let req_id = request_id(&headers);
    let kind = body.kind.as_deref().map(parse_kind).transpose()?.unwrap_or(RequestKind::Ask);

    // spec.md §4.7: a user question arriving during a running tour
    // interrupts it; during a paused tour it is answered independently and
    // `interrupt` itself is a no-op (mode stays paused).
    state.tour().interrupt(&client).await;

    let (text_tx, mut text_rx) = mpsc::channel(32);
    let session_id = body.session_id.unwrap_or_else(|| client.to_string());
    let ask_req = AskRequest {
        request_id: req_id.clone(),
        client_id: client.clone(),
        kind,
        parent_request_id: None,
        input: AskInput::Text(body.question),
        session_id,
        tts_provider: state.default_tts_provider(),
        voice: state.default_voice().clone(),
        resume_from_seq: 0,
    };

    let admitted_id = state.orchestrator().ask(ask_req, Arc::new(ChannelTextSink(text_tx))).await?;
    state.metrics().record_admitted();

    let (frame_tx, frame_rx) = mpsc::channel::<SseEvent>(64);
    let events = state.events().clone();
    let fabric = state.fabric().clone();
    let tour = state.tour().clone();
    let heartbeat_ms = state.config().sse_heartbeat_ms;
    let rid = admitted_id.clone();
    let cid = client.clone();

    tokio::spawn(async move {
        let mut event_stream = Box::pin(events.stream(&rid));
        let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; skip it

        let mut text_closed = false;
        let mut ended = false;
        while !ended {
            let frame = tokio::select! {
                biased;
                maybe = text_rx.recv(), if !text_closed => {
                    match maybe {
                        Some(chunk) => Some(SseEvent::default().event("text").data(
                            json!({"type": "text", "seq": chunk.seq, "delta": chunk.text}).to_string(),
                        )),
                        None => { text_closed = true; None }
                    }
                }
                maybe = event_stream.next() => {
                    match maybe {
                        Some(ev) => match ev.name.as_str() {
                            anchors::TTS_AUDIO_EMITTED => {
                                let seq = ev.fields.get("seq").cloned().unwrap_or(serde_json::Value::Null);
                                Some(SseEvent::default().event("audio_ready").data(
                                    json!({"type": "audio_ready", "request_id": rid.to_string(), "seq": seq}).to_string(),
                                ))
                            }
                            anchors::DONE => {
                                ended = true;
                                Some(SseEvent::default().event("done").data(json!({"type": "done"}).to_string()))
                            }
                            anchors::CANCELLED => {
                                ended = true;
                                Some(SseEvent::default().event("done").data(
                                    json!({"type": "done", "cancelled": true}).to_string(),
                                ))
                            }
                            anchors::ERROR => {
                                ended = true;
                                let code = ev.fields.get("code").and_then(|v| v.as_str()).unwrap_or("internal_error");
                                Some(SseEvent::default().event("error").data(
                                    json!({"type": "error", "code": code, "message": code, "retriable": false}).to_string(),
                                ))
                            }
                            _ => None,
                        },
                        None => { ended = true; None }
                    }
                }
                _ = ticker.tick() => {
                    Some(SseEvent::default().event("heartbeat").data(json!({"type": "heartbeat"}).to_string()))
                }
            };
            if let Some(frame) = frame {
                if frame_tx.send(frame).await.is_err() {
                    // Client disconnected: a failed write is the disconnect signal
                    // (spec.md §5), converted into a cancellation of this request.
                    fabric.cancel_request(&rid);
                    break;
                }
            }
        }
        tour.notify_ask_finished(&cid).await;
    });

    Ok(Sse::new(ReceiverStream::new(frame_rx).map(Ok)).keep_alive(
        KeepAlive::new().interval(Duration::from_millis(heartbeat_ms)).text("keep-alive"),
    ))
}
