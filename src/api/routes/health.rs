//! Liveness endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::api::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub streams: usize,
    pub subscriptions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        streams: state.streams.len(),
        subscriptions: state.subscriptions.len(),
    })
}
