//! `POST /cancel` (spec.md §6): fires a single request's token or fans out
//! to every token belonging to a client, optionally restricted to a set of
//! request kinds (spec.md §4.1 `cancel_request`/`cancel_client`).

use std::collections::HashSet;

use axum::extract::State;
use axum::Json;
use docent_core::error::ApiError;
use docent_core::ids::{ClientId, RequestId};
use docent_core::model::RequestKind;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    request_id: Option<String>,
    client_id: Option<String>,
    kinds: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    cancelled: usize,
}

fn parse_kind(raw: &str) -> Result<RequestKind, ApiError> {
    match raw {
        "ask" => Ok(RequestKind::Ask),
        "ask_prefetch" => Ok(RequestKind::AskPrefetch),
        "wake_word" => Ok(RequestKind::WakeWord),
        other => Err(ApiError::BadRequest(format!("unknown request kind: {other}"))),
    }
}

pub async fn cancel(State(state): State<AppState>, Json(body): Json<CancelBody>) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = if let Some(request_id) = body.request_id {
        usize::from(state.fabric().cancel_request(&RequestId(request_id)))
    } else if let Some(client_id) = body.client_id {
        let kinds: Option<HashSet<RequestKind>> = body
            .kinds
            .map(|ks| ks.iter().map(|k| parse_kind(k)).collect::<Result<HashSet<_>, _>>())
            .transpose()?;
        state.fabric().cancel_client(&ClientId(client_id), kinds.as_ref())
    } else {
        return Err(ApiError::BadRequest("at least one of request_id/client_id is required".to_string()));
    };
    state.metrics().record_cancellations(cancelled);
    Ok(Json(CancelResponse { cancelled }))
}
