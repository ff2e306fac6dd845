//! `POST /speech_to_text` (spec.md §6): a blocking ASR call made outside
//! the orchestrator pipeline — there is no RAG/TTS/text-sink involved, just
//! a transient cancellation token registered and released around the one
//! call (spec.md §4.6 step 3's ASR stage, run standalone).

use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::Json;
use docent_core::error::ApiError;
use docent_core::ids::RequestId;
use docent_core::model::RequestKind;
use docent_registry::EndpointKind;
use serde::Serialize;

use crate::routes::extract::{client_id, now_ms};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SpeechToTextResponse {
    text: String,
}

pub async fn speech_to_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<SpeechToTextResponse>, ApiError> {
    let client = client_id(&headers)?;
    state.registry().check_rate_limit(&client, EndpointKind::Asr, now_ms())?;

    let asr = state
        .asr()
        .ok_or_else(|| ApiError::AsrError { provider: "none".to_string(), message: "no ASR provider configured".to_string() })?;

    let mut audio: Option<Vec<u8>> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
        audio = Some(bytes.to_vec());
        break;
    }
    let audio = audio.ok_or_else(|| ApiError::BadRequest("missing audio field in multipart body".to_string()))?;

    let request_id = RequestId::generate();
    let token = state
        .fabric()
        .register(client.clone(), request_id.clone(), RequestKind::Ask)
        .map_err(|_| ApiError::Internal)?;
    let result = asr.transcribe(audio, &token).await;
    state.fabric().release(&request_id);

    Ok(Json(SpeechToTextResponse { text: result? }))
}
