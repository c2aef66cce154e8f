//! Generic webhook channel adapter
//!
//! Receives JSON messages over HTTP and hands replies back either inline
//! (`sync` mode, bounded wait) or through a polling endpoint (`async` mode).
//!
//! Expected payload:
//! ```json
//! {"sender_id": "user123", "sender_name": "John", "message": "Hello", "attachments": []}
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{AdapterState, ChannelAdapter, ChannelMessage, MessageSink, SendTarget, meta};
use crate::plugins::PluginContext;
use crate::security::{bearer_token, tokens_match};
use crate::{Error, Result};

/// Replies kept for polling before the oldest are evicted
const MAX_STORED_RESPONSES: usize = 1024;

/// How replies are returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Wait for the agent reply and return it in the POST response
    #[default]
    Sync,
    /// Return a request id immediately; poll for the reply
    Async,
}

impl ResponseMode {
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "async" => Self::Async,
            _ => Self::Sync,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Webhook adapter settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Bearer token callers must present; open when unset
    pub auth_token: Option<SecretString>,
    /// Token for `hub.verify_token` challenges
    pub verify_token: Option<SecretString>,
    pub response_mode: ResponseMode,
    /// Upper bound on the sync-mode wait
    pub response_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            verify_token: None,
            response_mode: ResponseMode::Sync,
            response_timeout: Duration::from_secs(120),
        }
    }
}

/// Inbound webhook body
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// A stored agent reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub content: String,
    pub attachments: Vec<String>,
}

/// Result of an inbound webhook call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply {
    /// The agent replied
    Replied {
        request_id: String,
        response: WebhookResponse,
    },
    /// Accepted for async processing
    Accepted { request_id: String },
    /// No reply yet; poll later
    Pending { request_id: String },
    /// No bearer token presented
    Unauthorized,
    /// Wrong bearer token
    Forbidden,
    BadRequest(String),
    NotFound,
    /// Adapter is not running
    Unavailable,
}

/// Outcome of a `hub.*` verification request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Token matched; echo the challenge
    Challenge(String),
    Forbidden,
    /// Not a verification request
    Active,
}

/// Adapters that accept inbound HTTP calls
#[async_trait]
pub trait WebhookReceiver: Send + Sync {
    /// Handle a POSTed message
    async fn handle_post(
        &self,
        authorization: Option<&str>,
        payload: serde_json::Value,
    ) -> WebhookReply;

    /// Handle a platform verification challenge
    fn verify(&self, mode: &str, token: &str, challenge: &str) -> VerifyOutcome;

    /// Look up the reply for an earlier request
    fn poll_response(&self, authorization: Option<&str>, request_id: &str) -> WebhookReply;
}

/// Issued request ids and their replies, oldest first
#[derive(Debug, Default)]
struct ResponseStore {
    entries: HashMap<String, Option<WebhookResponse>>,
    order: VecDeque<String>,
}

impl ResponseStore {
    fn issue(&mut self, request_id: &str) {
        if self.entries.insert(request_id.to_string(), None).is_none() {
            self.order.push_back(request_id.to_string());
        }
        while self.order.len() > MAX_STORED_RESPONSES {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn fulfil(&mut self, request_id: &str, response: WebhookResponse) {
        self.issue(request_id);
        self.entries.insert(request_id.to_string(), Some(response));
    }
}

/// Generic webhook adapter
pub struct WebhookAdapter {
    id: String,
    config: WebhookConfig,
    state: Mutex<AdapterState>,
    sink: Mutex<Option<MessageSink>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<WebhookResponse>>>,
    responses: Mutex<ResponseStore>,
}

impl WebhookAdapter {
    /// Create a new webhook adapter
    #[must_use]
    pub fn new(id: impl Into<String>, config: WebhookConfig) -> Self {
        Self {
            id: id.into(),
            config,
            state: Mutex::new(AdapterState::NotStarted),
            sink: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            responses: Mutex::new(ResponseStore::default()),
        }
    }

    /// Build from resolved plugin configuration
    ///
    /// # Errors
    ///
    /// Returns error if `response_timeout_secs` is not a number
    pub fn from_context(ctx: &PluginContext) -> Result<Self> {
        let config = &ctx.config;
        let response_timeout = match config.u64("response_timeout_secs")? {
            Some(secs) => Duration::from_secs(secs),
            None => WebhookConfig::default().response_timeout,
        };
        let id = config
            .string("channel_id")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "webhook".to_string());

        Ok(Self::new(
            id,
            WebhookConfig {
                auth_token: config.secret("auth_token"),
                verify_token: config.secret("verify_token"),
                response_mode: config
                    .string("response_mode")
                    .map_or_else(ResponseMode::default, |m| ResponseMode::from_str(&m)),
                response_timeout,
            },
        ))
    }

    fn check_auth(&self, authorization: Option<&str>) -> Option<WebhookReply> {
        let expected = self.config.auth_token.as_ref()?;
        let Some(token) = authorization.and_then(bearer_token) else {
            return Some(WebhookReply::Unauthorized);
        };
        if tokens_match(expected.expose_secret(), token) {
            None
        } else {
            tracing::warn!(channel = %self.id, "webhook bearer token mismatch");
            Some(WebhookReply::Forbidden)
        }
    }

    fn current_sink(&self) -> Option<MessageSink> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn wait_for_reply(
        &self,
        request_id: String,
        reply: oneshot::Receiver<WebhookResponse>,
    ) -> WebhookReply {
        match tokio::time::timeout(self.config.response_timeout, reply).await {
            Ok(Ok(response)) => WebhookReply::Replied {
                request_id,
                response,
            },
            Ok(Err(_)) => WebhookReply::Pending { request_id },
            Err(_) => {
                self.waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                tracing::debug!(channel = %self.id, %request_id, "sync reply timed out");
                WebhookReply::Pending { request_id }
            }
        }
    }
}

/// Factory for the `webhook` adapter
///
/// # Errors
///
/// Returns error if the plugin configuration is invalid
pub fn factory(ctx: &PluginContext) -> Result<Vec<Arc<dyn ChannelAdapter>>> {
    let adapter: Arc<dyn ChannelAdapter> = Arc::new(WebhookAdapter::from_context(ctx)?);
    Ok(vec![adapter])
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, sink: MessageSink) -> Result<()> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AdapterState::Running;
        tracing::info!(
            channel = %self.id,
            auth = self.config.auth_token.is_some(),
            mode = self.config.response_mode.as_str(),
            "webhook adapter ready"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AdapterState::Stopped;
        tracing::info!(channel = %self.id, "webhook adapter stopped");
        Ok(())
    }

    async fn deliver(&self, to: &str, content: &str, attachments: &[String]) -> Result<()> {
        let target = SendTarget::parse(to)
            .ok_or_else(|| Error::Channel(format!("invalid target '{to}', expected webhook:<request_id>")))?;
        if target.kind != "webhook" {
            return Err(Error::Channel(format!(
                "unsupported target kind '{}'",
                target.kind
            )));
        }

        let response = WebhookResponse {
            content: content.to_string(),
            attachments: attachments.to_vec(),
        };

        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fulfil(target.id, response.clone());

        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target.id);
        if let Some(waiter) = waiter {
            // Caller may have timed out; the stored copy remains pollable
            let _ = waiter.send(response);
        }

        Ok(())
    }

    fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn webhook(&self) -> Option<&dyn WebhookReceiver> {
        Some(self)
    }
}

#[async_trait]
impl WebhookReceiver for WebhookAdapter {
    async fn handle_post(
        &self,
        authorization: Option<&str>,
        payload: serde_json::Value,
    ) -> WebhookReply {
        if let Some(rejection) = self.check_auth(authorization) {
            return rejection;
        }

        let payload: WebhookPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(e) => return WebhookReply::BadRequest(format!("invalid payload: {e}")),
        };
        if payload.message.trim().is_empty() {
            return WebhookReply::BadRequest("No message provided".to_string());
        }

        let Some(sink) = self.current_sink() else {
            return WebhookReply::Unavailable;
        };

        let sender_id = payload
            .sender_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "webhook_user".to_string());
        let sender_name = payload
            .sender_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sender_id.clone());
        let request_id = uuid::Uuid::new_v4().to_string();

        let message = ChannelMessage::new(&self.id, sender_id, sender_name, payload.message)
            .with_attachments(payload.attachments)
            .with_meta(meta::REPLY_TARGET, format!("webhook:{request_id}"))
            .with_meta("request_id", request_id.clone())
            .with_meta("response_mode", self.config.response_mode.as_str());

        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issue(&request_id);

        let reply = match self.config.response_mode {
            ResponseMode::Sync => {
                let (tx, rx) = oneshot::channel();
                self.waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request_id.clone(), tx);
                Some(rx)
            }
            ResponseMode::Async => None,
        };

        if !sink.deliver(message).await {
            self.waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
            return WebhookReply::Unavailable;
        }

        tracing::debug!(channel = %self.id, %request_id, "webhook message queued");

        match reply {
            Some(rx) => self.wait_for_reply(request_id, rx).await,
            None => WebhookReply::Accepted { request_id },
        }
    }

    fn verify(&self, mode: &str, token: &str, challenge: &str) -> VerifyOutcome {
        if mode != "subscribe" || token.is_empty() || challenge.is_empty() {
            return VerifyOutcome::Active;
        }

        match &self.config.verify_token {
            Some(expected) if tokens_match(expected.expose_secret(), token) => {
                tracing::info!(channel = %self.id, "webhook verified");
                VerifyOutcome::Challenge(challenge.to_string())
            }
            _ => {
                tracing::warn!(channel = %self.id, "webhook verification failed");
                VerifyOutcome::Forbidden
            }
        }
    }

    fn poll_response(&self, authorization: Option<&str>, request_id: &str) -> WebhookReply {
        if let Some(rejection) = self.check_auth(authorization) {
            return rejection;
        }

        let store = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        match store.entries.get(request_id) {
            Some(Some(response)) => WebhookReply::Replied {
                request_id: request_id.to_string(),
                response: response.clone(),
            },
            Some(None) => WebhookReply::Pending {
                request_id: request_id.to_string(),
            },
            None => WebhookReply::NotFound,
        }
    }
}
