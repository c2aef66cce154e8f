//! Inbound webhook endpoints
//!
//! - `POST /webhook/{channel}` - deliver a message to a webhook channel
//! - `GET /webhook/{channel}` - `hub.*` verification challenge
//! - `GET /webhook/{channel}/responses/{request_id}` - poll an async reply

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::{ApiState, error_response, rate_limit};
use crate::channels::webhook::{VerifyOutcome, WebhookReply};

/// Build webhook routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/webhook/{channel}", get(verify).post(receive))
        .route("/webhook/{channel}/responses/{request_id}", get(poll))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
}

/// Platform verification query (`hub.mode=subscribe&hub.verify_token=..&hub.challenge=..`)
#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    pub mode: String,
    #[serde(rename = "hub.verify_token", default)]
    pub verify_token: String,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: String,
}

fn unknown_channel() -> Response {
    error_response(StatusCode::NOT_FOUND, "unknown channel")
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn reply_response(reply: WebhookReply) -> Response {
    match reply {
        WebhookReply::Replied {
            request_id,
            response,
        } => Json(serde_json::json!({
            "ok": true,
            "request_id": request_id,
            "response": response,
        }))
        .into_response(),
        WebhookReply::Accepted { request_id } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "ok": true,
                "status": "accepted",
                "request_id": request_id,
            })),
        )
            .into_response(),
        WebhookReply::Pending { request_id } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "ok": true,
                "status": "pending",
                "request_id": request_id,
            })),
        )
            .into_response(),
        WebhookReply::Unauthorized => error_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        WebhookReply::Forbidden => error_response(StatusCode::FORBIDDEN, "Forbidden"),
        WebhookReply::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, message),
        WebhookReply::NotFound => error_response(StatusCode::NOT_FOUND, "unknown request id"),
        WebhookReply::Unavailable => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "channel is not running")
        }
    }
}

/// Receive a POSTed message
async fn receive(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(adapter) = state.loader.get_channel(&channel) else {
        return unknown_channel();
    };
    let Some(receiver) = adapter.webhook() else {
        return error_response(StatusCode::NOT_FOUND, "channel does not accept webhooks");
    };

    // Unparseable bodies still go through the adapter so auth is checked first
    let payload = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    reply_response(receiver.handle_post(authorization(&headers), payload).await)
}

/// Answer a verification challenge
async fn verify(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let Some(adapter) = state.loader.get_channel(&channel) else {
        return unknown_channel();
    };
    let Some(receiver) = adapter.webhook() else {
        return error_response(StatusCode::NOT_FOUND, "channel does not accept webhooks");
    };

    match receiver.verify(&query.mode, &query.verify_token, &query.challenge) {
        VerifyOutcome::Challenge(challenge) => (StatusCode::OK, challenge).into_response(),
        VerifyOutcome::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
        VerifyOutcome::Active => Json(serde_json::json!({
            "ok": true,
            "channel": channel,
            "status": "active",
        }))
        .into_response(),
    }
}

/// Poll for an async reply
async fn poll(
    State(state): State<Arc<ApiState>>,
    Path((channel, request_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(adapter) = state.loader.get_channel(&channel) else {
        return unknown_channel();
    };
    let Some(receiver) = adapter.webhook() else {
        return error_response(StatusCode::NOT_FOUND, "channel does not accept webhooks");
    };

    reply_response(receiver.poll_response(authorization(&headers), &request_id))
}
