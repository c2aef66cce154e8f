//! Thread binding endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::Deserialize;

use super::{ApiState, error_response};
use crate::threads::{BindingFilter, ThreadBinding};

/// Build binding routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_bindings).post(bind))
        .route("/{thread_id}", delete(unbind))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub thread_id: String,
    pub target: String,
    pub creator_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// List live bindings, optionally by `creator_id` or `parent_id`
async fn list_bindings(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<BindingFilter>,
) -> Json<Vec<ThreadBinding>> {
    Json(state.bindings.list_bindings(&filter))
}

async fn bind(State(state): State<Arc<ApiState>>, Json(body): Json<BindBody>) -> Response {
    if body.thread_id.trim().is_empty() || body.target.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "thread_id and target are required");
    }

    let binding = state.bindings.bind(
        &body.thread_id,
        &body.target,
        &body.creator_id,
        body.parent_id.as_deref(),
        body.metadata,
    );
    (StatusCode::CREATED, Json(binding)).into_response()
}

async fn unbind(State(state): State<Arc<ApiState>>, Path(thread_id): Path<String>) -> Response {
    match state.bindings.unbind(&thread_id) {
        Some(binding) => Json(binding).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "thread is not bound"),
    }
}
