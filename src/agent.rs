//! Agent backends
//!
//! The dispatcher hands each authorised message to an `AgentHandler`. The
//! binary ships an HTTP backend that forwards to a remote agent service with
//! model failover, and an echo backend for local testing.
//!
//! `SubAgentManager` bounds how deep and how wide agents may fan out into
//! thread-focused sub-agents.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelMessage;
use crate::failover::{FailoverConfig, FailoverError, FailoverStats, ModelRef, call_with_failover};
use crate::lifecycle::{ChannelOverrides, LifecycleTracker, StreamingReply};
use crate::threads::{BindingFilter, ThreadBinding, ThreadBindingStore};
use crate::{Error, Result};

/// Produces the reply for an inbound message
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Respond to `message`
    ///
    /// `route` is the thread binding the message was routed through, if any.
    /// Implementations may report finer-grained phases through `tracker`.
    /// `Ok(None)` means no reply should be sent.
    ///
    /// # Errors
    ///
    /// Returns error if the agent call failed
    async fn respond(
        &self,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        tracker: &mut LifecycleTracker<'_>,
    ) -> Result<Option<String>>;

    /// Respond through a streaming reply
    ///
    /// The default appends the whole `respond` result at once; backends with
    /// incremental output override this.
    ///
    /// # Errors
    ///
    /// Returns error if the agent call failed
    async fn respond_streaming(
        &self,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        tracker: &mut LifecycleTracker<'_>,
        reply: &mut StreamingReply<'_>,
    ) -> Result<()> {
        if let Some(text) = self.respond(message, route, tracker).await? {
            reply.append(&text).await;
        }
        Ok(())
    }
}

/// Replies with the message text; for local testing
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn respond(
        &self,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        _tracker: &mut LifecycleTracker<'_>,
    ) -> Result<Option<String>> {
        Ok(Some(match route {
            Some(binding) => format!("[{}] {}", binding.target, message.content),
            None => message.content.clone(),
        }))
    }

    /// Streams the echo a word at a time
    async fn respond_streaming(
        &self,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        tracker: &mut LifecycleTracker<'_>,
        reply: &mut StreamingReply<'_>,
    ) -> Result<()> {
        if let Some(text) = self.respond(message, route, tracker).await? {
            for word in text.split_inclusive(' ') {
                reply.append(word).await;
            }
        }
        Ok(())
    }
}

/// Binding metadata: agent that spawned the bound sub-agent
pub const PARENT_AGENT_KEY: &str = "parent_agent";
/// Binding metadata: nesting depth of the bound sub-agent
pub const SPAWN_DEPTH_KEY: &str = "spawn_depth";
/// The top-level agent
pub const MAIN_AGENT: &str = "main";

/// Fan-out limits for sub-agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAgentLimits {
    /// Agents at this depth may not spawn; the main agent is depth 0
    pub max_spawn_depth: u32,
    /// Live children per parent agent
    pub max_children_per_agent: usize,
}

impl Default for SubAgentLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 2,
            max_children_per_agent: 5,
        }
    }
}

/// A sub-agent focused on a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubAgent {
    pub name: String,
    pub parent: String,
    pub depth: u32,
    pub thread_id: String,
}

impl SubAgent {
    fn from_binding(binding: &ThreadBinding) -> Option<Self> {
        let parent = binding.metadata.get(PARENT_AGENT_KEY)?.as_str()?;
        let depth = binding
            .metadata
            .get(SPAWN_DEPTH_KEY)
            .and_then(serde_json::Value::as_u64)
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(1);
        Some(Self {
            name: binding.target.clone(),
            parent: parent.to_string(),
            depth,
            thread_id: binding.thread_id.clone(),
        })
    }
}

/// Spawns sub-agents as thread bindings, within `SubAgentLimits`
///
/// Sub-agents live exactly as long as their binding, so they expire with
/// the thread's TTL.
pub struct SubAgentManager {
    bindings: Arc<ThreadBindingStore>,
    limits: SubAgentLimits,
    spawning: Mutex<()>,
}

impl SubAgentManager {
    #[must_use]
    pub fn new(bindings: Arc<ThreadBindingStore>, limits: SubAgentLimits) -> Self {
        Self {
            bindings,
            limits,
            spawning: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> SubAgentLimits {
        self.limits
    }

    /// Every live sub-agent, sorted by thread
    #[must_use]
    pub fn list_all(&self) -> Vec<SubAgent> {
        self.bindings
            .list_bindings(&BindingFilter::default())
            .iter()
            .filter_map(SubAgent::from_binding)
            .collect()
    }

    #[must_use]
    pub fn list_children(&self, parent: &str) -> Vec<SubAgent> {
        self.list_all()
            .into_iter()
            .filter(|agent| agent.parent == parent)
            .collect()
    }

    /// Nesting depth of `agent`; 0 for the main agent and unknown agents
    #[must_use]
    pub fn depth_of(&self, agent: &str) -> u32 {
        self.list_all()
            .into_iter()
            .find(|a| a.name == agent)
            .map_or(0, |a| a.depth)
    }

    /// Depth a new child of `parent` would have
    ///
    /// # Errors
    ///
    /// Returns `Error::Limit` if `parent` is too deep or has too many children
    pub fn can_spawn(&self, parent: &str) -> Result<u32> {
        self.check(parent, None)
    }

    fn check(&self, parent: &str, replacing: Option<&str>) -> Result<u32> {
        let depth = self.depth_of(parent);
        if depth >= self.limits.max_spawn_depth {
            return Err(Error::Limit(format!(
                "{parent} is at spawn depth {depth} (max {})",
                self.limits.max_spawn_depth
            )));
        }

        let children = self
            .list_children(parent)
            .iter()
            .filter(|child| Some(child.thread_id.as_str()) != replacing)
            .count();
        if children >= self.limits.max_children_per_agent {
            return Err(Error::Limit(format!(
                "{parent} already has {children} sub-agents (max {})",
                self.limits.max_children_per_agent
            )));
        }

        Ok(depth + 1)
    }

    /// Focus `thread_id` on a new sub-agent `name` spawned by `parent`
    ///
    /// Replaces any binding the thread had.
    ///
    /// # Errors
    ///
    /// Returns `Error::Limit` if the limits refuse the spawn
    pub fn spawn(&self, thread_id: &str, name: &str, creator_id: &str, parent: &str) -> Result<SubAgent> {
        let _spawning = self.spawning.lock().unwrap_or_else(PoisonError::into_inner);
        let depth = self.check(parent, Some(thread_id)).inspect_err(|e| {
            tracing::warn!(thread_id, name, parent, error = %e, "sub-agent spawn refused");
        })?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(PARENT_AGENT_KEY.to_string(), parent.into());
        metadata.insert(SPAWN_DEPTH_KEY.to_string(), depth.into());
        self.bindings.bind(thread_id, name, creator_id, None, metadata);

        tracing::info!(thread_id, name, parent, depth, "sub-agent spawned");
        Ok(SubAgent {
            name: name.to_string(),
            parent: parent.to_string(),
            depth,
            thread_id: thread_id.to_string(),
        })
    }

    /// Unfocus a thread; returns the sub-agent it held, if any
    pub fn release(&self, thread_id: &str) -> Option<SubAgent> {
        let binding = self.bindings.unbind(thread_id)?;
        SubAgent::from_binding(&binding)
    }
}

/// Request body sent to the agent service
#[derive(Debug, Serialize)]
struct AgentCall<'a> {
    provider: &'a str,
    model: &'a str,
    channel_id: &'a str,
    sender_id: &'a str,
    sender_name: &'a str,
    content: &'a str,
    attachments: &'a [String],
    /// Routing target from a thread binding
    route: Option<&'a str>,
    thread_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    content: Option<String>,
}

/// Forwards messages to a remote agent over HTTP
pub struct HttpAgent {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
    default_model: ModelRef,
    failover: FailoverConfig,
    overrides: Arc<ChannelOverrides>,
    stats: Arc<FailoverStats>,
    cancel: CancellationToken,
}

impl HttpAgent {
    /// Create an HTTP agent
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        url: impl Into<String>,
        default_model: ModelRef,
        failover: FailoverConfig,
        overrides: Arc<ChannelOverrides>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: None,
            default_model,
            failover,
            overrides,
            stats: Arc::new(FailoverStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Send `Authorization: Bearer <key>` with every call
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<SecretString>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Abort failover backoff when `cancel` fires
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Per-model call counters
    #[must_use]
    pub fn stats(&self) -> Arc<FailoverStats> {
        Arc::clone(&self.stats)
    }

    async fn call_model(
        &self,
        model: ModelRef,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
    ) -> Result<Option<String>> {
        let body = AgentCall {
            provider: &model.provider,
            model: &model.model,
            channel_id: &message.channel_id,
            sender_id: &message.sender_id,
            sender_name: &message.sender_name,
            content: &message.content,
            attachments: &message.attachments,
            route: route.map(|b| b.target.as_str()),
            thread_id: message.thread_id(),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let reply: AgentReply = response.json().await?;
        Ok(reply.content.filter(|c| !c.trim().is_empty()))
    }
}

#[async_trait]
impl AgentHandler for HttpAgent {
    async fn respond(
        &self,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        _tracker: &mut LifecycleTracker<'_>,
    ) -> Result<Option<String>> {
        let primary = self
            .overrides
            .resolve_model(&message.channel_id, &self.default_model);

        tracing::debug!(channel = %message.channel_id, model = %primary, "calling agent");

        call_with_failover(
            &primary,
            &self.failover,
            &self.cancel,
            Some(&self.stats),
            |model| self.call_model(model, message, route),
        )
        .await
        .map_err(|e| match e {
            FailoverError::Exhausted { last, .. } => last,
            FailoverError::Cancelled => Error::Cancelled,
        })
    }
}
