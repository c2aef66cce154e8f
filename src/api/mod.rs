//! HTTP API server for beacon-channels
//!
//! Public routes: `/health` and the inbound webhook endpoints. Admin routes
//! live under `/api` behind the bearer API key middleware.

mod auth;
pub mod bindings;
pub mod health;
pub mod pairing;
pub mod plugins;
pub mod rate_limit;
pub mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::plugins::PluginLoader;
use crate::security::PairingManager;
use crate::threads::ThreadBindingStore;
use crate::Result;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub loader: Arc<PluginLoader>,
    pub pairing: Arc<PairingManager>,
    pub bindings: Arc<ThreadBindingStore>,
    /// Admin API key; admin routes are open when unset
    pub api_key: Option<SecretString>,
    /// Limits inbound webhook calls
    pub webhook_limiter: Option<rate_limit::SharedLimiter>,
    /// Upper bound for `POST /api/pairing/wait`
    pub approval_wait: Duration,
}

/// JSON error body used by every route
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": message.into() })),
    )
        .into_response()
}

impl IntoResponse for crate::Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Limit(_) => StatusCode::CONFLICT,
            Self::Config(_) | Self::Pairing(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        error_response(status, self.to_string())
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(state: ApiState, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            port,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let admin = Router::new()
            .nest("/plugins", plugins::router(Arc::clone(&self.state)))
            .nest("/pairing", pairing::router(Arc::clone(&self.state)))
            .nest("/bindings", bindings::router(Arc::clone(&self.state)))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.state),
                auth::require_api_key,
            ));

        Router::new()
            .nest("/api", admin)
            .merge(webhooks::router(Arc::clone(&self.state)))
            .merge(health::router(Arc::clone(&self.state)))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}
