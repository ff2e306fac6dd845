mod ask;
mod cancel;
mod events;
pub(crate) mod extract;
mod health;
mod speech_to_text;
mod status;
mod tour;
mod tts_stream;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(ask::ask))
        .route("/tts_stream", get(tts_stream::tts_stream))
        .route("/speech_to_text", post(speech_to_text::speech_to_text))
        .route("/cancel", post(cancel::cancel))
        .route("/status", get(status::status))
        .route("/events", get(events::events))
        .route("/tour/start", post(tour::start))
        .route("/tour/pause", post(tour::pause))
        .route("/tour/resume", post(tour::resume))
        .route("/tour/next", post(tour::next))
        .route("/tour/prev", post(tour::prev))
        .route("/tour/jump", post(tour::jump))
        .route("/tour/reset", post(tour::reset))
        .route("/tour/state", get(tour::state))
        .route("/healthz", get(health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
