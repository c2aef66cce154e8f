//! API key authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use super::{ApiState, error_response};
use crate::security::{bearer_token, tokens_match};

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
}

/// Middleware to verify API key
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    // If no API key configured, allow all requests (development mode)
    let Some(expected_key) = &state.api_key else {
        tracing::debug!("API key not configured - allowing unauthenticated access");
        return next.run(req).await;
    };

    match extract_api_key(&req) {
        Some(key) if tokens_match(expected_key.expose_secret(), key) => next.run(req).await,
        Some(_) => {
            tracing::warn!("invalid API key provided");
            error_response(StatusCode::UNAUTHORIZED, "invalid API key")
        }
        None => {
            tracing::debug!("no API key provided");
            error_response(StatusCode::UNAUTHORIZED, "missing API key")
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_extract_api_key() {
        let mut req = Request::builder().body(Body::empty()).unwrap();

        // No header
        assert_eq!(extract_api_key(&req), None);

        // With Bearer token
        req.headers_mut().insert(
            "authorization",
            HeaderValue::from_static("Bearer test-key-123"),
        );
        assert_eq!(extract_api_key(&req), Some("test-key-123"));

        req.headers_mut()
            .insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_api_key(&req), None);
    }
}
