//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use beacon_channels::channels::{AdapterState, ChannelAdapter, MessageSink, SendTarget};
use beacon_channels::lifecycle::{Editable, MessageRef, Reactable};
use beacon_channels::{Error, Result};

/// A recorded outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub to: String,
    pub content: String,
}

/// In-memory adapter that records sends and indicator calls
pub struct MockAdapter {
    id: String,
    sent: Mutex<Vec<Sent>>,
    indicators: Mutex<Vec<String>>,
    /// Post and edit calls, when edits are enabled
    streamed: Mutex<Vec<String>>,
    editable: bool,
    /// Errors returned by the next `deliver` calls, in order
    failures: Mutex<VecDeque<Error>>,
    state: Mutex<AdapterState>,
    sink: Mutex<Option<MessageSink>>,
}

impl MockAdapter {
    #[must_use]
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, false)
    }

    /// An adapter that also exposes the post-then-edit capability
    #[must_use]
    pub fn editable(id: &str) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: &str, editable: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            indicators: Mutex::new(Vec::new()),
            streamed: Mutex::new(Vec::new()),
            editable,
            failures: Mutex::new(VecDeque::new()),
            state: Mutex::new(AdapterState::NotStarted),
            sink: Mutex::new(None),
        })
    }

    /// Fail the next delivery with `error`
    pub fn fail_next(&self, error: Error) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn sent_to(&self, to: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.to == to)
            .map(|s| s.content)
            .collect()
    }

    /// Indicator calls as `+emoji` / `-emoji`
    #[must_use]
    pub fn indicators(&self) -> Vec<String> {
        self.indicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stream calls as `post <to> <content>` / `edit <content>`
    #[must_use]
    pub fn streamed(&self) -> Vec<String> {
        self.streamed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sink handed over by the loader on start
    #[must_use]
    pub fn sink(&self) -> Option<MessageSink> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, sink: MessageSink) -> Result<()> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AdapterState::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AdapterState::Stopped;
        Ok(())
    }

    async fn deliver(&self, to: &str, content: &str, _attachments: &[String]) -> Result<()> {
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(e) = failure {
            return Err(e);
        }

        let Some(target) = SendTarget::parse(to) else {
            return Err(Error::Channel(format!("invalid target: {to}")));
        };
        if !matches!(target.kind, "user" | "channel") {
            return Err(Error::Channel(format!("unsupported target kind: {}", target.kind)));
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Sent {
                to: to.to_string(),
                content: content.to_string(),
            });
        Ok(())
    }

    fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reactions(&self) -> Option<&dyn Reactable> {
        Some(self)
    }

    fn edits(&self) -> Option<&dyn Editable> {
        if self.editable { Some(self) } else { None }
    }
}

#[async_trait]
impl Editable for MockAdapter {
    async fn post(&self, to: &str, content: &str) -> Result<MessageRef> {
        let mut streamed = self.streamed.lock().unwrap_or_else(PoisonError::into_inner);
        streamed.push(format!("post {to} {content}"));
        Ok(MessageRef {
            conversation_id: to.to_string(),
            message_id: streamed.len().to_string(),
        })
    }

    async fn edit(&self, _message: &MessageRef, content: &str) -> Result<()> {
        self.streamed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("edit {content}"));
        Ok(())
    }
}

#[async_trait]
impl Reactable for MockAdapter {
    async fn add_indicator(&self, _message: &MessageRef, indicator: &str) -> Result<()> {
        self.indicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("+{indicator}"));
        Ok(())
    }

    async fn remove_indicator(&self, _message: &MessageRef, indicator: &str) -> Result<()> {
        self.indicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("-{indicator}"));
        Ok(())
    }
}

/// Write a `plugin.json` manifest under `root/<dir>/`
pub fn write_manifest(root: &Path, dir: &str, manifest: &serde_json::Value) {
    let plugin_dir = root.join(dir);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("plugin.json"),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}
