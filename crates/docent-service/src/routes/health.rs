//! `GET /healthz`: liveness probe, no dependency checks. Matches the
//! teacher's `querymt-service` health endpoint shape.

use axum::Json;
use serde_json::{json, Value};

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
