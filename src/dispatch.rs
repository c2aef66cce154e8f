//! Inbound message pipeline
//!
//! `Dispatcher` is the host `MessageHandler`: access check for direct
//! messages, owner commands, thread binding resolution, lifecycle
//! indicators, the agent call (streamed where the channel supports it), and
//! a retried reply through the adapter.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentHandler, MAIN_AGENT, PARENT_AGENT_KEY, SubAgent, SubAgentLimits, SubAgentManager,
};
use crate::channels::{ChannelAdapter, ChannelMessage, MessageHandler};
use crate::lifecycle::{
    ChannelOverrides, Editable, LifecyclePhase, LifecycleTracker, StreamMode, StreamingConfig,
    StreamingReply,
};
use crate::plugins::PluginLoader;
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use crate::security::{DmPolicy, PairingManager, PairingRequest};
use crate::threads::{ThreadBinding, ThreadBindingStore};
use crate::{Error, Result};

/// Sent to a sender once their pairing code is approved
pub const APPROVED_NOTICE: &str = "Pairing approved! You can now chat with me directly.";

/// Where new pairing requests are announced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyTarget {
    pub channel: String,
    /// `kind:id` on that channel
    pub to: String,
}

impl NotifyTarget {
    /// Parse `channel/kind:id`
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (channel, to) = s.trim().split_once('/')?;
        if channel.is_empty() || !to.contains(':') {
            return None;
        }
        Some(Self {
            channel: channel.to_string(),
            to: to.to_string(),
        })
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Announce pairing requests here; defaults to the owner on the origin channel
    pub approval_target: Option<NotifyTarget>,
    pub retry: RetryPolicy,
    /// Bound on a single delivery attempt
    pub send_timeout: Duration,
    /// Limits for `/focus`
    pub subagents: SubAgentLimits,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            approval_target: None,
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(30),
            subagents: SubAgentLimits::default(),
        }
    }
}

/// Result of the DM access check
enum Access {
    Allowed,
    /// Policy rejects the sender
    Denied,
    /// A pairing request is (or already was) outstanding
    Pending,
}

/// Owner-only commands, prefixed with `/`
#[derive(Debug, Clone, PartialEq, Eq)]
enum OwnerCommand {
    Approve(String),
    Deny(String),
    Pending,
    Revoke(String),
    Block(String),
    Unblock(String),
    /// Focus the current thread on a sub-agent
    Focus(String),
    Unfocus,
    Agents,
    /// Known command with a missing argument
    Usage(&'static str),
}

impl OwnerCommand {
    fn parse(content: &str) -> Option<Self> {
        let rest = content.trim().strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_lowercase();
        let arg = parts.next().map(ToString::to_string);

        let with_arg = |build: fn(String) -> Self, usage: &'static str| {
            Some(arg.clone().map_or(Self::Usage(usage), build))
        };

        match name.as_str() {
            "approve" => with_arg(Self::Approve, "/approve <code>"),
            "deny" => with_arg(Self::Deny, "/deny <code>"),
            "pending" => Some(Self::Pending),
            "revoke" => with_arg(Self::Revoke, "/revoke <sender_id>"),
            "block" => with_arg(Self::Block, "/block <sender_id>"),
            "unblock" => with_arg(Self::Unblock, "/unblock <sender_id>"),
            "focus" => with_arg(Self::Focus, "/focus <agent>"),
            "unfocus" => Some(Self::Unfocus),
            "agents" => Some(Self::Agents),
            _ => None,
        }
    }
}

/// Host message handler wiring the channel kernel together
pub struct Dispatcher {
    pairing: Arc<PairingManager>,
    bindings: Arc<ThreadBindingStore>,
    overrides: Arc<ChannelOverrides>,
    agent: Arc<dyn AgentHandler>,
    subagents: SubAgentManager,
    config: DispatchConfig,
    channels: Option<Weak<PluginLoader>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        pairing: Arc<PairingManager>,
        bindings: Arc<ThreadBindingStore>,
        overrides: Arc<ChannelOverrides>,
        agent: Arc<dyn AgentHandler>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            pairing,
            subagents: SubAgentManager::new(Arc::clone(&bindings), config.subagents),
            bindings,
            overrides,
            agent,
            config,
            channels: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Allow notifications on channels other than the one a message came from
    #[must_use]
    pub fn with_channels(mut self, loader: &Arc<PluginLoader>) -> Self {
        self.channels = Some(Arc::downgrade(loader));
        self
    }

    /// Stop retry backoff when `cancel` fires
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deliver with the retry policy, bounding each attempt
    async fn deliver(&self, adapter: &dyn ChannelAdapter, to: &str, content: &str) -> Result<()> {
        let timeout = self.config.send_timeout;
        retry_with_backoff(&self.config.retry, &self.cancel, || async move {
            match tokio::time::timeout(timeout, adapter.deliver(to, content, &[])).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("send to {to}"))),
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => e,
            RetryError::Cancelled => Error::Cancelled,
        })
    }

    /// Best-effort message on any channel
    async fn notify(&self, current: &Arc<dyn ChannelAdapter>, channel: &str, to: &str, content: &str) {
        let adapter = if current.id() == channel {
            Some(Arc::clone(current))
        } else {
            self.channels
                .as_ref()
                .and_then(Weak::upgrade)
                .and_then(|loader| loader.get_channel(channel))
        };

        let Some(adapter) = adapter else {
            tracing::warn!(channel, to, "notification channel unavailable");
            return;
        };
        if let Err(e) = self.deliver(adapter.as_ref(), to, content).await {
            tracing::warn!(channel, to, error = %e, "notification failed");
        }
    }

    async fn check_access(&self, adapter: &Arc<dyn ChannelAdapter>, message: &ChannelMessage) -> Access {
        let sender = message.sender_id.as_str();
        if self.pairing.is_authorized(sender) {
            return Access::Allowed;
        }

        let policy = self.pairing.policy();
        if policy != DmPolicy::Pairing {
            tracing::debug!(
                channel = %message.channel_id,
                sender,
                %policy,
                "direct message rejected"
            );
            return Access::Denied;
        }

        let Some(request) =
            self.pairing
                .create_request(sender, &message.sender_name, &message.channel_id)
        else {
            tracing::debug!(channel = %message.channel_id, sender, "no new pairing request");
            return Access::Pending;
        };

        let notice = format!(
            "Pairing required. Your pairing code: {}\nSend this code to the bot owner to get approved.\nCode expires in {} minutes.",
            request.code,
            request.remaining_minutes()
        );
        self.notify(adapter, &message.channel_id, &message.reply_target(), &notice)
            .await;
        self.announce_request(adapter, &request).await;

        Access::Pending
    }

    async fn announce_request(&self, adapter: &Arc<dyn ChannelAdapter>, request: &PairingRequest) {
        let text = format!(
            "Pairing request from {} ({}) on {}. Approve with /approve {}",
            request.sender_name, request.sender_id, request.channel_id, request.code
        );

        match &self.config.approval_target {
            Some(target) => self.notify(adapter, &target.channel, &target.to, &text).await,
            None => {
                if let Some(owner) = self.pairing.owner_id() {
                    let to = format!("user:{owner}");
                    self.notify(adapter, &request.channel_id, &to, &text).await;
                }
            }
        }
    }

    async fn run_command(
        &self,
        adapter: &Arc<dyn ChannelAdapter>,
        message: &ChannelMessage,
        command: OwnerCommand,
    ) -> Result<()> {
        tracing::info!(channel = %message.channel_id, ?command, "owner command");

        let reply = match command {
            OwnerCommand::Approve(code) => match self.pairing.approve_code(&code)? {
                Some(request) => {
                    self.notify(
                        adapter,
                        &request.channel_id,
                        &format!("user:{}", request.sender_id),
                        APPROVED_NOTICE,
                    )
                    .await;
                    format!(
                        "Approved {} ({}); they can now DM the bot.",
                        request.sender_name, request.sender_id
                    )
                }
                None => "Invalid or expired pairing code.".to_string(),
            },
            OwnerCommand::Deny(code) => match self.pairing.deny_code(&code) {
                Some(request) => format!("Denied pairing request from {}.", request.sender_name),
                None => "Invalid or expired pairing code.".to_string(),
            },
            OwnerCommand::Pending => format_pending(&self.pairing.list_pending()),
            OwnerCommand::Revoke(sender) => {
                if self.pairing.revoke(&sender)? {
                    format!("Revoked access for {sender}.")
                } else {
                    format!("{sender} was not on the allowlist.")
                }
            }
            OwnerCommand::Block(sender) => {
                self.pairing.block(&sender)?;
                format!("Blocked {sender}.")
            }
            OwnerCommand::Unblock(sender) => {
                if self.pairing.unblock(&sender)? {
                    format!("Unblocked {sender}.")
                } else {
                    format!("{sender} was not blocked.")
                }
            }
            OwnerCommand::Focus(name) => match message.thread_id() {
                Some(thread_id) => self.focus(thread_id, &name, &message.sender_id)?,
                None => "Use /focus inside a thread.".to_string(),
            },
            OwnerCommand::Unfocus => match message.thread_id().and_then(|t| self.bindings.unbind(t)) {
                Some(binding) => format!("Thread unfocused from {}.", binding.target),
                None => "This thread is not focused.".to_string(),
            },
            OwnerCommand::Agents => format_agents(&self.subagents.list_all()),
            OwnerCommand::Usage(usage) => format!("Usage: {usage}"),
        };

        self.deliver(adapter.as_ref(), &message.reply_target(), &reply)
            .await
    }

    /// Bind a thread to a sub-agent of whatever the thread talks to now
    fn focus(&self, thread_id: &str, name: &str, creator_id: &str) -> Result<String> {
        let parent = match self.bindings.get_binding(thread_id) {
            // Refocusing on the same agent keeps its parent
            Some(binding) if binding.target == name => binding
                .metadata
                .get(PARENT_AGENT_KEY)
                .and_then(serde_json::Value::as_str)
                .unwrap_or(MAIN_AGENT)
                .to_string(),
            Some(binding) => binding.target,
            None => MAIN_AGENT.to_string(),
        };

        match self.subagents.spawn(thread_id, name, creator_id, &parent) {
            Ok(agent) => Ok(format!(
                "Thread focused on {} (spawned by {}, depth {}).",
                agent.name, agent.parent, agent.depth
            )),
            Err(Error::Limit(reason)) => Ok(format!("Cannot focus: {reason}.")),
            Err(e) => Err(e),
        }
    }

    /// Run the agent through a streaming reply
    ///
    /// Returns whatever the stream could not put on the platform.
    async fn stream_reply(
        &self,
        editor: &dyn Editable,
        message: &ChannelMessage,
        route: Option<&ThreadBinding>,
        tracker: &mut LifecycleTracker<'_>,
        config: StreamingConfig,
    ) -> Result<Option<String>> {
        tracker.transition(LifecyclePhase::Streaming).await;
        let mut reply = StreamingReply::new(
            message.channel_id.clone(),
            message.reply_target(),
            Some(editor),
            config,
        );
        self.agent
            .respond_streaming(message, route, tracker, &mut reply)
            .await?;
        Ok(reply.finish().await)
    }

    /// Binding for the message's thread, touched once per routed message
    fn resolve_route(&self, message: &ChannelMessage) -> Option<ThreadBinding> {
        let thread_id = message.thread_id()?;
        let binding = self.bindings.get_binding(thread_id)?;
        // Expired between lookup and touch: treat as unbound
        if !self.bindings.touch(thread_id) {
            return None;
        }
        tracing::debug!(thread_id, target = %binding.target, "message routed by thread binding");
        Some(binding)
    }
}

fn format_agents(agents: &[SubAgent]) -> String {
    if agents.is_empty() {
        return "No sub-agents.".to_string();
    }
    let mut lines = vec!["Sub-agents:".to_string()];
    lines.extend(agents.iter().map(|a| {
        format!(
            "{} - thread {}, spawned by {} (depth {})",
            a.name, a.thread_id, a.parent, a.depth
        )
    }));
    lines.join("\n")
}

fn format_pending(pending: &[PairingRequest]) -> String {
    if pending.is_empty() {
        return "No pending pairing requests.".to_string();
    }
    let mut lines = vec!["Pending pairing requests:".to_string()];
    lines.extend(pending.iter().map(|req| {
        format!(
            "{} - {} ({}) on {}, expires in {} min",
            req.code,
            req.sender_name,
            req.sender_id,
            req.channel_id,
            req.remaining_minutes()
        )
    }));
    lines.join("\n")
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, adapter: Arc<dyn ChannelAdapter>, message: ChannelMessage) -> Result<()> {
        let command = if self.pairing.is_owner(&message.sender_id) {
            OwnerCommand::parse(&message.content)
        } else {
            None
        };
        if let Some(command) = command {
            return self.run_command(&adapter, &message, command).await;
        }

        if message.is_direct() {
            match self.check_access(&adapter, &message).await {
                Access::Allowed => {}
                Access::Denied | Access::Pending => return Ok(()),
            }
        }

        let route = self.resolve_route(&message);

        tracing::info!(
            channel = %message.channel_id,
            sender = %message.sender_id,
            attachments = message.attachments.len(),
            routed = route.is_some(),
            "message received"
        );

        let mut tracker = LifecycleTracker::new(
            message.channel_id.clone(),
            message.message_ref(),
            adapter.reactions(),
            self.overrides.indicators(&message.channel_id),
        );
        tracker.transition(LifecyclePhase::Queued).await;
        tracker.transition(LifecyclePhase::Thinking).await;

        let streaming = self.overrides.streaming(&message.channel_id);
        let outcome = match adapter.edits().filter(|_| streaming.mode != StreamMode::Off) {
            Some(editor) => {
                self.stream_reply(editor, &message, route.as_ref(), &mut tracker, streaming)
                    .await
            }
            None => self.agent.respond(&message, route.as_ref(), &mut tracker).await,
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(channel = %message.channel_id, error = %e, "agent failed");
                tracker.error().await;
                return Err(e);
            }
        };

        if let Some(reply) = reply.filter(|r| !r.trim().is_empty()) {
            let delivered = self
                .deliver(adapter.as_ref(), &message.reply_target(), &reply)
                .await;
            if let Err(e) = delivered {
                tracing::error!(channel = %message.channel_id, error = %e, "reply delivery failed");
                tracker.error().await;
                return Err(e);
            }
        }

        tracker.done().await;
        Ok(())
    }
}
