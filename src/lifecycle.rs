//! Per-message processing lifecycle
//!
//! Each inbound message gets a `LifecycleTracker` that mirrors its processing
//! phase onto the platform as a status indicator (usually an emoji reaction):
//! queued → thinking → tool use → done / error.
//!
//! Replies can also be streamed: `StreamingReply` either edits one live
//! message as text arrives (partial mode) or posts it in paragraph-sized
//! blocks (block mode), on adapters that expose the `Editable` capability.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::Result;
use crate::failover::ModelRef;

/// A named stage of message processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Queued,
    Thinking,
    ToolUse,
    Streaming,
    Done,
    Error,
}

impl LifecyclePhase {
    /// Parse a phase name; `None` for unknown names
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "thinking" => Some(Self::Thinking),
            "tool_use" | "tool-use" => Some(Self::ToolUse),
            "streaming" => Some(Self::Streaming),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether processing has finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Thinking => write!(f, "thinking"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::Streaming => write!(f, "streaming"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Indicator shown for each phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseIndicators {
    pub queued: String,
    pub thinking: String,
    pub tool_use: String,
    pub streaming: String,
    pub done: String,
    pub error: String,
}

impl Default for PhaseIndicators {
    fn default() -> Self {
        Self {
            queued: "📨".to_string(),
            thinking: "🤔".to_string(),
            tool_use: "⚙️".to_string(),
            streaming: "💬".to_string(),
            done: "✅".to_string(),
            error: "❌".to_string(),
        }
    }
}

impl PhaseIndicators {
    /// Indicator for `phase`
    #[must_use]
    pub fn get(&self, phase: LifecyclePhase) -> &str {
        match phase {
            LifecyclePhase::Queued => &self.queued,
            LifecyclePhase::Thinking => &self.thinking,
            LifecyclePhase::ToolUse => &self.tool_use,
            LifecyclePhase::Streaming => &self.streaming,
            LifecyclePhase::Done => &self.done,
            LifecyclePhase::Error => &self.error,
        }
    }
}

/// Platform reference to the message a status indicator is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Conversation (chat, room, channel) holding the message
    pub conversation_id: String,
    /// Platform message id
    pub message_id: String,
}

/// Adapters that can attach status indicators to messages
#[async_trait]
pub trait Reactable: Send + Sync {
    /// Attach `indicator` to the message
    async fn add_indicator(&self, message: &MessageRef, indicator: &str) -> Result<()>;

    /// Remove `indicator` from the message
    async fn remove_indicator(&self, message: &MessageRef, indicator: &str) -> Result<()>;
}

/// Adapters that can post a message and later edit it in place
#[async_trait]
pub trait Editable: Send + Sync {
    /// Post `content` to `to` (`kind:id`), returning a reference for edits
    async fn post(&self, to: &str, content: &str) -> Result<MessageRef>;

    /// Replace the text of a previously posted message
    async fn edit(&self, message: &MessageRef, content: &str) -> Result<()>;
}

/// Tracks the processing phase of a single message
///
/// Indicator failures are logged and swallowed; they never abort processing.
pub struct LifecycleTracker<'a> {
    channel_id: String,
    message: Option<MessageRef>,
    reactor: Option<&'a dyn Reactable>,
    indicators: PhaseIndicators,
    current: Option<LifecyclePhase>,
}

impl<'a> LifecycleTracker<'a> {
    /// Create a tracker
    ///
    /// Without a reactor or message ref the tracker only records phases.
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        message: Option<MessageRef>,
        reactor: Option<&'a dyn Reactable>,
        indicators: PhaseIndicators,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            message,
            reactor,
            indicators,
            current: None,
        }
    }

    /// A tracker with no platform side effects
    #[must_use]
    pub fn detached(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, None, None, PhaseIndicators::default())
    }

    /// Current phase, if any has been entered
    #[must_use]
    pub const fn current(&self) -> Option<LifecyclePhase> {
        self.current
    }

    /// Transition by phase name
    ///
    /// Unknown names are logged and ignored.
    pub async fn phase(&mut self, name: &str) {
        match LifecyclePhase::parse(name) {
            Some(phase) => self.transition(phase).await,
            None => {
                tracing::warn!(channel = %self.channel_id, phase = name, "unknown lifecycle phase");
            }
        }
    }

    /// Move to `phase`, swapping the platform indicator
    ///
    /// Re-entering the current phase is a no-op.
    pub async fn transition(&mut self, phase: LifecyclePhase) {
        let previous = self.current;
        if previous == Some(phase) {
            return;
        }
        self.current = Some(phase);

        let (Some(reactor), Some(message)) = (self.reactor, self.message.as_ref()) else {
            return;
        };

        if let Some(old) = previous {
            let indicator = self.indicators.get(old);
            if let Err(e) = reactor.remove_indicator(message, indicator).await {
                tracing::debug!(
                    channel = %self.channel_id,
                    indicator,
                    error = %e,
                    "could not remove status indicator"
                );
            }
        }

        let indicator = self.indicators.get(phase);
        if let Err(e) = reactor.add_indicator(message, indicator).await {
            tracing::debug!(
                channel = %self.channel_id,
                indicator,
                error = %e,
                "could not add status indicator"
            );
        }
    }

    /// Mark processing as complete
    pub async fn done(&mut self) {
        self.transition(LifecyclePhase::Done).await;
    }

    /// Mark processing as failed
    pub async fn error(&mut self) {
        self.transition(LifecyclePhase::Error).await;
    }
}

/// How a reply reaches the platform while the agent is still producing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Send the finished reply once
    #[default]
    Off,
    /// Edit one live message as text arrives
    Partial,
    /// Post the reply in paragraph-sized messages
    Block,
}

impl StreamMode {
    /// Parse a mode name; `None` for unknown names
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "partial" => Some(Self::Partial),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Partial => write!(f, "partial"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Streaming reply settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    pub mode: StreamMode,
    /// Minimum gap between edits of the live message
    pub edit_interval: Duration,
    /// Block mode: never break before this many characters
    pub min_chunk: usize,
    /// Block mode: always break by this many characters
    pub max_chunk: usize,
    /// Platform limit for a single message, in characters
    pub max_message: usize,
    /// Appended to the live message while text is still arriving
    pub cursor: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Off,
            edit_interval: Duration::from_millis(500),
            min_chunk: 200,
            max_chunk: 800,
            max_message: 2000,
            cursor: "▍".to_string(),
        }
    }
}

/// Byte offset of the `chars`-th character, or the end of `s`
fn char_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// Where to end the next block of `pending`
///
/// Breaks at a paragraph, else a sentence end, within `min_chunk..=max_chunk`
/// characters. Without either, text waits until it reaches `max_chunk` and is
/// then cut at the last whitespace, or hard at `max_chunk`.
fn block_break(pending: &str, min_chunk: usize, max_chunk: usize) -> Option<usize> {
    let total = pending.chars().count();
    if total < min_chunk.max(1) {
        return None;
    }
    let floor = char_offset(pending, min_chunk);
    let window = &pending[..char_offset(pending, max_chunk)];

    let paragraph = window.rfind("\n\n").map(|i| i + 2);
    let sentence = window.char_indices().rev().find_map(|(i, c)| {
        let end = i + c.len_utf8();
        (matches!(c, '.' | '!' | '?') && window[end..].starts_with(char::is_whitespace))
            .then_some(end)
    });
    let word = window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8());

    [paragraph, sentence]
        .into_iter()
        .flatten()
        .find(|&end| end >= floor)
        .or_else(|| {
            (total >= max_chunk).then(|| word.filter(|&end| end >= floor).unwrap_or(window.len()))
        })
}

/// Non-empty trimmed text, if any
fn leftover(text: &str) -> Option<String> {
    Some(text.trim().to_string()).filter(|t| !t.is_empty())
}

/// A reply delivered while it is being produced
///
/// Platform failures never lose text: [`finish`](Self::finish) hands back
/// whatever did not reach the platform so the caller can send it the usual
/// way. Without an editor, or in [`StreamMode::Off`], everything is handed
/// back.
pub struct StreamingReply<'a> {
    channel_id: String,
    to: String,
    editor: Option<&'a dyn Editable>,
    config: StreamingConfig,
    text: String,
    /// Bytes of `text` already posted as finished messages
    posted: usize,
    live: Option<MessageRef>,
    last_edit: Option<Instant>,
}

impl<'a> StreamingReply<'a> {
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        to: impl Into<String>,
        editor: Option<&'a dyn Editable>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            to: to.into(),
            editor,
            config,
            text: String::new(),
            posted: 0,
            live: None,
            last_edit: None,
        }
    }

    /// Effective mode; `Off` without an editor
    #[must_use]
    pub fn mode(&self) -> StreamMode {
        if self.editor.is_some() {
            self.config.mode
        } else {
            StreamMode::Off
        }
    }

    /// Full text received so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    fn fall_back(&mut self, error: &crate::Error) {
        tracing::warn!(
            channel = %self.channel_id,
            mode = %self.config.mode,
            error = %error,
            "streaming failed, finishing without it"
        );
        self.config.mode = StreamMode::Off;
    }

    /// Add a piece of the reply
    pub async fn append(&mut self, delta: &str) {
        self.text.push_str(delta);
        let Some(editor) = self.editor else { return };

        match self.config.mode {
            StreamMode::Off => {}
            StreamMode::Partial => self.update_live(editor).await,
            StreamMode::Block => {
                while let Some(end) = block_break(
                    &self.text[self.posted..],
                    self.config.min_chunk,
                    self.config.max_chunk,
                ) {
                    let block = self.text[self.posted..self.posted + end].trim().to_string();
                    if !block.is_empty() {
                        if let Err(e) = editor.post(&self.to, &block).await {
                            self.fall_back(&e);
                            return;
                        }
                    }
                    self.posted += end;
                }
            }
        }
    }

    async fn update_live(&mut self, editor: &dyn Editable) {
        if self.text.trim().is_empty() {
            return;
        }
        let shown = self.text.chars().count() + self.config.cursor.chars().count();
        if shown > self.config.max_message {
            // The rest goes out as overflow on finish
            return;
        }
        let display = format!("{}{}", self.text, self.config.cursor);

        let Some(live) = &self.live else {
            match editor.post(&self.to, &display).await {
                Ok(live) => {
                    self.live = Some(live);
                    self.last_edit = Some(Instant::now());
                }
                Err(e) => self.fall_back(&e),
            }
            return;
        };

        if self
            .last_edit
            .is_some_and(|at| at.elapsed() < self.config.edit_interval)
        {
            return;
        }
        if let Err(e) = editor.edit(live, &display).await {
            tracing::debug!(channel = %self.channel_id, error = %e, "live message edit failed");
        }
        self.last_edit = Some(Instant::now());
    }

    /// Complete the reply
    ///
    /// Returns the text that still has to be sent, or `None` when the whole
    /// reply is on the platform.
    pub async fn finish(mut self) -> Option<String> {
        let Some(editor) = self.editor.filter(|_| self.config.mode != StreamMode::Off) else {
            return leftover(&self.text[self.posted..]);
        };

        if let Some(live) = self.live.take() {
            let end = char_offset(&self.text, self.config.max_message);
            if let Err(e) = editor.edit(&live, self.text[..end].trim_end()).await {
                tracing::warn!(channel = %self.channel_id, error = %e, "final edit failed");
                return leftover(&self.text);
            }
            self.posted = end;
        }

        while self.posted < self.text.len() {
            let rest = &self.text[self.posted..];
            let end = char_offset(rest, self.config.max_message.max(1));
            let chunk = rest[..end].trim();
            if !chunk.is_empty() {
                if let Err(e) = editor.post(&self.to, chunk).await {
                    tracing::warn!(channel = %self.channel_id, error = %e, "streamed reply incomplete");
                    return leftover(rest);
                }
            }
            self.posted += end;
        }

        tracing::debug!(
            channel = %self.channel_id,
            mode = %self.config.mode,
            chars = self.text.chars().count(),
            "streamed reply finished"
        );
        None
    }
}

/// Per-channel indicator, model and streaming overrides
///
/// Owned by the process and shared by reference with the dispatcher and the
/// admin API.
#[derive(Debug, Default)]
pub struct ChannelOverrides {
    indicators: RwLock<HashMap<String, PhaseIndicators>>,
    models: RwLock<HashMap<String, String>>,
    streaming: RwLock<HashMap<String, StreamMode>>,
    default_streaming: StreamingConfig,
}

impl ChannelOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides whose channels stream with `streaming` unless set otherwise
    #[must_use]
    pub fn with_streaming(streaming: StreamingConfig) -> Self {
        Self {
            default_streaming: streaming,
            ..Self::default()
        }
    }

    /// Streaming settings for a channel
    #[must_use]
    pub fn streaming(&self, channel_id: &str) -> StreamingConfig {
        let mode = self
            .streaming
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .copied()
            .unwrap_or(self.default_streaming.mode);
        StreamingConfig {
            mode,
            ..self.default_streaming.clone()
        }
    }

    pub fn set_stream_mode(&self, channel_id: &str, mode: StreamMode) {
        tracing::info!(channel = channel_id, %mode, "stream mode set");
        self.streaming
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id.to_string(), mode);
    }

    /// Indicator set for a channel, falling back to the defaults
    #[must_use]
    pub fn indicators(&self, channel_id: &str) -> PhaseIndicators {
        self.indicators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_indicators(&self, channel_id: &str, indicators: PhaseIndicators) {
        self.indicators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id.to_string(), indicators);
    }

    /// Raw model override for a channel
    #[must_use]
    pub fn model_override(&self, channel_id: &str) -> Option<String> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }

    pub fn set_model_override(&self, channel_id: &str, model: &str) {
        tracing::info!(channel = channel_id, model, "model override set");
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id.to_string(), model.to_string());
    }

    pub fn clear_model_override(&self, channel_id: &str) {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel_id);
    }

    /// Model to use for a channel
    ///
    /// An override of the form `provider:model` replaces both parts; a bare
    /// model name keeps the default provider.
    #[must_use]
    pub fn resolve_model(&self, channel_id: &str, default: &ModelRef) -> ModelRef {
        match self.model_override(channel_id) {
            Some(raw) => match raw.split_once(':') {
                Some((provider, model)) => ModelRef::new(provider.trim(), model.trim()),
                None => ModelRef::new(default.provider.clone(), raw.trim()),
            },
            None => default.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct RecordingReactor {
        calls: Mutex<Vec<(String, String)>>,
        fail_removes: bool,
    }

    #[async_trait]
    impl Reactable for RecordingReactor {
        async fn add_indicator(&self, _message: &MessageRef, indicator: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(("add".to_string(), indicator.to_string()));
            Ok(())
        }

        async fn remove_indicator(&self, _message: &MessageRef, indicator: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(("remove".to_string(), indicator.to_string()));
            if self.fail_removes {
                return Err(Error::Channel("reaction not found".to_string()));
            }
            Ok(())
        }
    }

    fn message() -> MessageRef {
        MessageRef {
            conversation_id: "chat-1".to_string(),
            message_id: "42".to_string(),
        }
    }

    #[tokio::test]
    async fn thinking_then_done_removes_once_and_adds_once() {
        let reactor = RecordingReactor::default();
        let mut tracker =
            LifecycleTracker::new("test", Some(message()), Some(&reactor), PhaseIndicators::default());

        tracker.phase("thinking").await;
        reactor.calls.lock().unwrap().clear();
        tracker.phase("done").await;

        let calls = reactor.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("remove".to_string(), "🤔".to_string()),
                ("add".to_string(), "✅".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn same_phase_twice_adds_once() {
        let reactor = RecordingReactor::default();
        let mut tracker =
            LifecycleTracker::new("test", Some(message()), Some(&reactor), PhaseIndicators::default());

        tracker.phase("thinking").await;
        tracker.phase("thinking").await;

        let calls = reactor.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("add".to_string(), "🤔".to_string())]);
    }

    #[tokio::test]
    async fn unknown_phase_is_ignored() {
        let reactor = RecordingReactor::default();
        let mut tracker =
            LifecycleTracker::new("test", Some(message()), Some(&reactor), PhaseIndicators::default());

        tracker.phase("queued").await;
        tracker.phase("pondering").await;

        assert_eq!(tracker.current(), Some(LifecyclePhase::Queued));
        assert_eq!(reactor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_failure_does_not_block_add() {
        let reactor = RecordingReactor {
            fail_removes: true,
            ..Default::default()
        };
        let mut tracker =
            LifecycleTracker::new("test", Some(message()), Some(&reactor), PhaseIndicators::default());

        tracker.phase("queued").await;
        tracker.error().await;

        let calls = reactor.calls.lock().unwrap().clone();
        assert_eq!(calls.last(), Some(&("add".to_string(), "❌".to_string())));
        assert_eq!(tracker.current(), Some(LifecyclePhase::Error));
    }

    #[tokio::test]
    async fn detached_tracker_records_phase() {
        let mut tracker = LifecycleTracker::detached("test");
        tracker.phase("tool_use").await;
        assert_eq!(tracker.current(), Some(LifecyclePhase::ToolUse));
        tracker.done().await;
        assert!(tracker.current().is_some_and(LifecyclePhase::is_terminal));
    }

    #[derive(Default)]
    struct RecordingEditor {
        posts: Mutex<Vec<String>>,
        edits: Mutex<Vec<String>>,
        fail_posts: bool,
    }

    #[async_trait]
    impl Editable for RecordingEditor {
        async fn post(&self, to: &str, content: &str) -> Result<MessageRef> {
            if self.fail_posts {
                return Err(Error::Channel("missing permissions".to_string()));
            }
            let mut posts = self.posts.lock().unwrap();
            posts.push(content.to_string());
            Ok(MessageRef {
                conversation_id: to.to_string(),
                message_id: posts.len().to_string(),
            })
        }

        async fn edit(&self, _message: &MessageRef, content: &str) -> Result<()> {
            self.edits.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

    fn streaming(mode: StreamMode) -> StreamingConfig {
        StreamingConfig {
            mode,
            ..StreamingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_mode_throttles_edits() {
        let editor = RecordingEditor::default();
        let mut reply = StreamingReply::new("test", "room:1", Some(&editor), streaming(StreamMode::Partial));

        reply.append("Hel").await;
        reply.append("lo").await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        reply.append(" world").await;
        assert_eq!(reply.finish().await, None);

        assert_eq!(*editor.posts.lock().unwrap(), vec!["Hel▍"]);
        assert_eq!(
            *editor.edits.lock().unwrap(),
            vec!["Hello world▍", "Hello world"]
        );
    }

    #[tokio::test]
    async fn partial_mode_sends_overflow() {
        let editor = RecordingEditor::default();
        let config = StreamingConfig {
            max_message: 10,
            ..streaming(StreamMode::Partial)
        };
        let mut reply = StreamingReply::new("test", "room:1", Some(&editor), config);

        reply.append("abcdefgh").await;
        reply.append("ijklmnopqrstuvwxy").await;
        assert_eq!(reply.finish().await, None);

        assert_eq!(
            *editor.posts.lock().unwrap(),
            vec!["abcdefgh▍", "klmnopqrst", "uvwxy"]
        );
        assert_eq!(editor.edits.lock().unwrap().last().unwrap(), "abcdefghij");
    }

    #[tokio::test]
    async fn block_mode_prefers_paragraphs() {
        let editor = RecordingEditor::default();
        let config = StreamingConfig {
            min_chunk: 10,
            max_chunk: 40,
            ..streaming(StreamMode::Block)
        };
        let mut reply = StreamingReply::new("test", "room:1", Some(&editor), config);

        reply.append("First paragraph here.\n\nSecond one is ").await;
        reply.append("longer and keeps going").await;
        assert_eq!(*editor.posts.lock().unwrap(), vec!["First paragraph here."]);

        assert_eq!(reply.finish().await, None);
        assert_eq!(
            *editor.posts.lock().unwrap(),
            vec!["First paragraph here.", "Second one is longer and keeps going"]
        );
    }

    #[tokio::test]
    async fn block_mode_cuts_long_runs_at_words() {
        let editor = RecordingEditor::default();
        let config = StreamingConfig {
            min_chunk: 5,
            max_chunk: 12,
            ..streaming(StreamMode::Block)
        };
        let mut reply = StreamingReply::new("test", "room:1", Some(&editor), config);

        reply.append("alpha beta gamma delta").await;
        assert_eq!(*editor.posts.lock().unwrap(), vec!["alpha beta"]);
        assert_eq!(reply.finish().await, None);
        assert_eq!(
            *editor.posts.lock().unwrap(),
            vec!["alpha beta", "gamma delta"]
        );
    }

    #[test]
    fn block_breaks_respect_char_boundaries() {
        let text = "ééééé ééééé";
        let end = block_break(text, 3, 6).unwrap();
        assert_eq!(&text[..end], "ééééé ");

        let emoji = "🙂".repeat(20);
        let end = block_break(&emoji, 2, 8).unwrap();
        assert_eq!(emoji[..end].chars().count(), 8);
    }

    #[tokio::test]
    async fn failed_stream_hands_text_back() {
        let editor = RecordingEditor {
            fail_posts: true,
            ..Default::default()
        };
        let mut reply = StreamingReply::new("test", "room:1", Some(&editor), streaming(StreamMode::Partial));

        reply.append("hello").await;
        reply.append(" there").await;
        assert_eq!(reply.finish().await.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn without_editor_everything_is_handed_back() {
        let mut reply = StreamingReply::new("test", "room:1", None, streaming(StreamMode::Block));
        assert_eq!(reply.mode(), StreamMode::Off);

        reply.append("plain reply").await;
        assert_eq!(reply.text(), "plain reply");
        assert_eq!(reply.finish().await.as_deref(), Some("plain reply"));
    }

    #[test]
    fn stream_mode_overrides() {
        assert_eq!(StreamMode::parse(" Partial "), Some(StreamMode::Partial));
        assert_eq!(StreamMode::parse("firehose"), None);

        let overrides = ChannelOverrides::with_streaming(streaming(StreamMode::Block));
        assert_eq!(overrides.streaming("tg").mode, StreamMode::Block);
        overrides.set_stream_mode("tg", StreamMode::Off);
        assert_eq!(overrides.streaming("tg").mode, StreamMode::Off);
        assert_eq!(overrides.streaming("tg").max_message, 2000);
        assert_eq!(ChannelOverrides::new().streaming("tg").mode, StreamMode::Off);
    }

    #[test]
    fn overrides_fall_back_to_defaults() {
        let overrides = ChannelOverrides::new();
        assert_eq!(overrides.indicators("slack"), PhaseIndicators::default());

        let custom = PhaseIndicators {
            done: "👍".to_string(),
            ..PhaseIndicators::default()
        };
        overrides.set_indicators("slack", custom.clone());
        assert_eq!(overrides.indicators("slack"), custom);
        assert_eq!(overrides.indicators("discord"), PhaseIndicators::default());
    }

    #[test]
    fn model_override_resolution() {
        let overrides = ChannelOverrides::new();
        let default = ModelRef::new("openrouter", "claude");

        assert_eq!(overrides.resolve_model("tg", &default), default);

        overrides.set_model_override("tg", "gpt-4o");
        assert_eq!(
            overrides.resolve_model("tg", &default),
            ModelRef::new("openrouter", "gpt-4o")
        );

        overrides.set_model_override("tg", "ollama:llama3");
        assert_eq!(
            overrides.resolve_model("tg", &default),
            ModelRef::new("ollama", "llama3")
        );

        overrides.clear_model_override("tg");
        assert_eq!(overrides.resolve_model("tg", &default), default);
    }
}
