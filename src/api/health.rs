//! Health check endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::channels::AdapterState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub channels: Vec<ChannelHealth>,
    pub bindings: usize,
    pub pending_pairings: usize,
}

#[derive(Serialize)]
pub struct ChannelHealth {
    pub id: String,
    pub state: AdapterState,
}

/// Build health routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// Liveness check with a per-channel snapshot
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let channels = state
        .loader
        .channel_states()
        .into_iter()
        .map(|(id, state)| ChannelHealth { id, state })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        channels,
        bindings: state.bindings.count(),
        pending_pairings: state.pairing.summary().pending,
    })
}
