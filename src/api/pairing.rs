//! DM pairing endpoints
//!
//! - GET /api/pairing/pending - list pending pairing requests
//! - GET /api/pairing/allowed - allow and block lists
//! - POST /api/pairing/approve - approve a code and notify the sender
//! - POST /api/pairing/deny - discard a pending code
//! - POST /api/pairing/revoke - remove a sender from the allowlist
//! - POST /api/pairing/block - block a sender
//! - POST /api/pairing/wait - block until a code is approved, denied or expires

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::{ApiState, error_response};
use crate::Result;
use crate::dispatch::APPROVED_NOTICE;
use crate::security::{ApprovalOutcome, PairingRequest, PairingSummary};

/// Build pairing router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/pending", get(list_pending))
        .route("/allowed", get(list_access))
        .route("/approve", post(approve))
        .route("/deny", post(deny))
        .route("/revoke", post(revoke))
        .route("/block", post(block))
        .route("/wait", post(wait))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CodeBody {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct WaitBody {
    pub code: String,
    /// Capped at the configured approval wait
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SenderBody {
    pub sender_id: String,
}

#[derive(Debug, Serialize)]
pub struct AccessLists {
    pub summary: PairingSummary,
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

async fn list_pending(State(state): State<Arc<ApiState>>) -> Json<Vec<PairingRequest>> {
    Json(state.pairing.list_pending())
}

async fn list_access(State(state): State<Arc<ApiState>>) -> Json<AccessLists> {
    Json(AccessLists {
        summary: state.pairing.summary(),
        allowed: state.pairing.list_allowed(),
        blocked: state.pairing.list_blocked(),
    })
}

/// Approve a pairing code
///
/// The approved sender is told on their origin channel (best-effort).
async fn approve(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CodeBody>,
) -> Result<Response> {
    let Some(request) = state.pairing.approve_code(&body.code)? else {
        return Ok(error_response(
            StatusCode::NOT_FOUND,
            "invalid or expired pairing code",
        ));
    };

    let notified = state
        .loader
        .send(
            &request.channel_id,
            &format!("user:{}", request.sender_id),
            APPROVED_NOTICE,
            &[],
        )
        .await;
    if !notified {
        tracing::warn!(sender = %request.sender_id, channel = %request.channel_id, "could not notify approved sender");
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "request": request,
        "notified": notified,
    }))
    .into_response())
}

async fn deny(State(state): State<Arc<ApiState>>, Json(body): Json<CodeBody>) -> Response {
    match state.pairing.deny_code(&body.code) {
        Some(request) => Json(serde_json::json!({ "ok": true, "request": request })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "invalid or expired pairing code"),
    }
}

async fn revoke(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<SenderBody>,
) -> Result<Json<serde_json::Value>> {
    let removed = state.pairing.revoke(&body.sender_id)?;
    Ok(Json(serde_json::json!({ "ok": true, "removed": removed })))
}

async fn block(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<SenderBody>,
) -> Result<Json<serde_json::Value>> {
    state.pairing.block(&body.sender_id)?;
    Ok(Json(serde_json::json!({ "ok": true, "blocked": body.sender_id })))
}

/// Wait for the owner to decide on a pairing code
async fn wait(State(state): State<Arc<ApiState>>, Json(body): Json<WaitBody>) -> Json<serde_json::Value> {
    let timeout = body
        .timeout_secs
        .map_or(state.approval_wait, Duration::from_secs)
        .min(state.approval_wait);

    let outcome = state.pairing.wait_for_approval(&body.code, timeout).await;
    tracing::debug!(code = %body.code, ?outcome, "pairing wait finished");
    Json(match outcome {
        ApprovalOutcome::Approved(request) => {
            serde_json::json!({ "ok": true, "status": "approved", "request": request })
        }
        ApprovalOutcome::Denied => serde_json::json!({ "ok": true, "status": "denied" }),
        ApprovalOutcome::Expired => serde_json::json!({ "ok": true, "status": "expired" }),
        ApprovalOutcome::TimedOut => serde_json::json!({ "ok": true, "status": "timed_out" }),
    })
}
