//! Messaging channel adapters
//!
//! Each platform integration implements `ChannelAdapter`. Adapters normalise
//! inbound platform events into `ChannelMessage`s and push them into the
//! `MessageSink` they were started with; the plugin loader drains each sink
//! into the host `MessageHandler`.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

pub use webhook::{
    ResponseMode, WebhookAdapter, WebhookConfig, WebhookPayload, WebhookReceiver, WebhookReply,
    VerifyOutcome,
};

use crate::Result;
use crate::lifecycle::{Editable, MessageRef, Reactable};

/// Well-known `ChannelMessage::metadata` keys
pub mod meta {
    /// `bool`: message arrived as a direct message
    pub const IS_DM: &str = "is_dm";
    /// Thread / topic the message belongs to
    pub const THREAD_ID: &str = "thread_id";
    /// Enclosing context (guild, workspace)
    pub const PARENT_ID: &str = "parent_id";
    /// Conversation the platform message lives in
    pub const CONVERSATION_ID: &str = "conversation_id";
    /// Platform message id
    pub const MESSAGE_ID: &str = "message_id";
    /// Outbound `kind:id` target for replies
    pub const REPLY_TARGET: &str = "reply_target";
}

/// A message received from a channel
///
/// Built once by the adapter and consumed by the dispatch handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    /// Channel identifier (e.g. "telegram", "webhook")
    pub channel_id: String,

    /// Sender identifier on that channel
    pub sender_id: String,

    /// Sender display name
    pub sender_name: String,

    /// Message text
    pub content: String,

    /// Attachment references (paths or URLs)
    pub attachments: Vec<String>,

    /// Free-form platform metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Message this is replying to (if any)
    pub reply_to: Option<String>,
}

impl ChannelMessage {
    /// Create a plain text message
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            attachments: Vec::new(),
            metadata: serde_json::Map::new(),
            reply_to: None,
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }

    /// Whether this is a direct message
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.metadata
            .get(meta::IS_DM)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.meta_str(meta::THREAD_ID)
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.meta_str(meta::PARENT_ID)
    }

    /// Platform reference for status indicators, if the adapter supplied one
    #[must_use]
    pub fn message_ref(&self) -> Option<MessageRef> {
        Some(MessageRef {
            conversation_id: self.meta_str(meta::CONVERSATION_ID)?.to_string(),
            message_id: self.meta_str(meta::MESSAGE_ID)?.to_string(),
        })
    }

    /// Where replies go: the adapter's explicit target, else the sender
    #[must_use]
    pub fn reply_target(&self) -> String {
        self.meta_str(meta::REPLY_TARGET)
            .map_or_else(|| format!("user:{}", self.sender_id), ToString::to_string)
    }
}

/// Parsed outbound target (`"<kind>:<id>"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTarget<'a> {
    pub kind: &'a str,
    pub id: &'a str,
}

impl<'a> SendTarget<'a> {
    /// Parse `kind:id`; both parts must be non-empty
    #[must_use]
    pub fn parse(to: &'a str) -> Option<Self> {
        let (kind, id) = to.split_once(':')?;
        let (kind, id) = (kind.trim(), id.trim());
        if kind.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self { kind, id })
    }
}

/// Adapter connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    NotStarted,
    Running,
    Stopped,
}

/// Inbound message queue handed to an adapter on start
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<ChannelMessage>,
}

impl MessageSink {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<ChannelMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message for dispatch
    ///
    /// Returns false once the loader has stopped draining this channel.
    pub async fn deliver(&self, message: ChannelMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }
}

/// Trait for messaging channel adapters
///
/// Exactly one instance exists per registered channel id.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel identifier
    fn id(&self) -> &str;

    /// Start listening; inbound messages go to `sink`
    ///
    /// Push-style adapters return once ready and must do so within the
    /// connect timeout. Adapters that report [`is_streaming`](Self::is_streaming)
    /// run for the lifetime of the connection instead, and are restarted
    /// with backoff when it drops.
    async fn start(&self, sink: MessageSink) -> Result<()>;

    /// Whether `start` holds a long-lived connection
    fn is_streaming(&self) -> bool {
        false
    }

    /// Gracefully stop the adapter
    async fn stop(&self) -> Result<()>;

    /// Deliver `content` to `to` (`kind:id`)
    ///
    /// Errors carry their retry class; unsupported target kinds are
    /// permanent.
    async fn deliver(&self, to: &str, content: &str, attachments: &[String]) -> Result<()>;

    /// Current lifecycle state
    fn state(&self) -> AdapterState;

    /// Send a message, reporting failure as `false`
    async fn send(&self, to: &str, content: &str, attachments: &[String]) -> bool {
        match self.deliver(to, content, attachments).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = self.id(), to, error = %e, "send failed");
                false
            }
        }
    }

    /// Status-indicator capability, for adapters that support reactions
    fn reactions(&self) -> Option<&dyn Reactable> {
        None
    }

    /// Post-then-edit capability, for adapters that can stream replies
    fn edits(&self) -> Option<&dyn Editable> {
        None
    }

    /// Inbound HTTP capability, for webhook-driven adapters
    fn webhook(&self) -> Option<&dyn WebhookReceiver> {
        None
    }
}

/// Host-side consumer of inbound messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one inbound message from `adapter`
    ///
    /// # Errors
    ///
    /// Returns error if processing failed; the loader logs it
    async fn handle(&self, adapter: Arc<dyn ChannelAdapter>, message: ChannelMessage)
    -> Result<()>;
}
