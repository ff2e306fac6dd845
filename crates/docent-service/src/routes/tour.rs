//! `/tour/*` (spec.md §6, §4.7). Thin parsing/admission layer over
//! `docent_tour::TourMachine`; every transition is keyed by the caller's
//! `X-Client-ID`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use docent_core::error::ApiError;
use docent_core::model::TourState;
use docent_tour::StartTourRequest;
use serde::Deserialize;

use crate::routes::extract::client_id;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartBody {
    stops: Vec<String>,
    zone: String,
    profile: String,
    template_id: String,
    style: String,
    duration_s: u32,
    #[serde(default)]
    continuous_tour: bool,
}

#[derive(Debug, Deserialize)]
pub struct JumpBody {
    index: usize,
}

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    let req = StartTourRequest {
        stops: body.stops,
        zone: body.zone,
        profile: body.profile,
        template_id: body.template_id,
        style: body.style,
        duration_s: body.duration_s,
        continuous_tour: body.continuous_tour,
    };
    Ok(Json(state.tour().start(client, req).await?))
}

pub async fn pause(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().pause(&client).await?))
}

pub async fn resume(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().resume(&client).await?))
}

pub async fn next(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().next(&client).await?))
}

pub async fn prev(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().prev(&client).await?))
}

pub async fn jump(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<JumpBody>,
) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().jump(&client, body.index).await?))
}

pub async fn reset(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().reset(&client).await))
}

pub async fn state(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<TourState>, ApiError> {
    let client = client_id(&headers)?;
    Ok(Json(state.tour().state(&client)))
}
