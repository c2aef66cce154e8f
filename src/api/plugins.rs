//! Plugin management REST endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use super::ApiState;
use crate::Result;
use crate::plugins::PluginInfo;

/// Build plugin management routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_plugins))
        .route("/reload", post(reload))
        .route("/{id}/enable", post(enable_plugin))
        .route("/{id}/disable", post(disable_plugin))
        .route("/{id}/config", post(save_config))
        .with_state(state)
}

#[derive(Serialize)]
pub struct ToggleResponse {
    pub ok: bool,
    pub id: String,
    pub enabled: bool,
    /// Takes effect on the next reload
    pub reload_required: bool,
}

#[derive(Serialize)]
pub struct SaveConfigResponse {
    pub ok: bool,
    pub saved: Vec<String>,
    pub reload_required: bool,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub ok: bool,
    pub plugins: Vec<String>,
    pub channels: Vec<String>,
}

/// List all discovered plugins with masked config
async fn list_plugins(State(state): State<Arc<ApiState>>) -> Json<Vec<PluginInfo>> {
    Json(state.loader.list_plugins())
}

fn toggle(state: &ApiState, id: String, enabled: bool) -> Result<Json<ToggleResponse>> {
    state.loader.set_enabled(&id, enabled)?;
    tracing::info!(plugin = %id, enabled, "plugin toggled");
    Ok(Json(ToggleResponse {
        ok: true,
        id,
        enabled,
        reload_required: true,
    }))
}

/// Enable a plugin
async fn enable_plugin(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>> {
    toggle(&state, id, true)
}

/// Disable a plugin
async fn disable_plugin(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>> {
    toggle(&state, id, false)
}

/// Persist config overrides; masked values are ignored
async fn save_config(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(values): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<SaveConfigResponse>> {
    let saved = state.loader.save_config(&id, &values)?;
    tracing::info!(plugin = %id, keys = ?saved, "plugin config saved");
    Ok(Json(SaveConfigResponse {
        ok: true,
        saved,
        reload_required: true,
    }))
}

/// Stop all adapters, re-read state and manifests, restart
async fn reload(State(state): State<Arc<ApiState>>) -> Json<ReloadResponse> {
    let plugins = state.loader.reload().await;
    Json(ReloadResponse {
        ok: true,
        plugins,
        channels: state.loader.list_channels(),
    })
}
