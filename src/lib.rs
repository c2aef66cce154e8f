//! Beacon Channels - channel plugin kernel for AI assistants
//!
//! This library provides the shared plumbing between one agent backend and
//! many messaging surfaces:
//! - Channel adapter contract and plugin registry/loader
//! - Pairing-based access control for direct messages
//! - TTL-bound thread → target routing
//! - Per-message lifecycle indicators
//! - Retry/reconnect backoff and model failover
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Adapters                          │
//! │   Webhook  │  (registered factories)  │  ...         │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ChannelMessage
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Dispatcher                          │
//! │  Pairing  │  Thread bindings  │  Lifecycle  │ Retry  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Agent backend (model failover)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod lifecycle;
pub mod plugins;
pub mod retry;
pub mod security;
pub mod threads;

pub use agent::{AgentHandler, EchoAgent, HttpAgent};
pub use channels::{ChannelAdapter, ChannelMessage, MessageHandler, MessageSink};
pub use config::Config;
pub use daemon::Daemon;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{Error, Result};
pub use plugins::{AdapterRegistry, PluginLoader};
pub use security::{DmPolicy, PairingManager};
pub use threads::ThreadBindingStore;
