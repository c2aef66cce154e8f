//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-channels/config.toml` as a persistent
//! config source. All fields are optional; the file is a partial overlay on
//! top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ChannelsConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub paths: PathsFileConfig,

    /// DM access control
    #[serde(default)]
    pub pairing: PairingFileConfig,

    /// Thread binding expiry
    #[serde(default)]
    pub threads: ThreadsFileConfig,

    /// Outbound send retries
    #[serde(default)]
    pub retry: RetryFileConfig,

    /// Streaming connection reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Model failover for the agent backend
    #[serde(default)]
    pub failover: FailoverFileConfig,

    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,

    /// Streamed replies
    #[serde(default)]
    pub streaming: StreamingFileConfig,

    /// Sub-agent fan-out limits
    #[serde(default)]
    pub subagents: SubAgentsFileConfig,

    /// Agent backend
    #[serde(default)]
    pub agent: AgentFileConfig,
}

/// HTTP server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,

    /// Inbound webhook calls allowed per minute
    pub webhook_rate_per_minute: Option<u32>,
}

/// Filesystem locations
#[derive(Debug, Default, Deserialize)]
pub struct PathsFileConfig {
    pub data_dir: Option<String>,
    pub plugin_dirs: Option<Vec<String>>,
    pub plugin_state: Option<String>,
    pub allowlist: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PairingFileConfig {
    /// `open`, `owner`, `pairing` or `disabled`
    pub policy: Option<String>,
    pub owner_id: Option<String>,
    /// `channel/kind:id` that receives new pairing requests
    pub approval_target: Option<String>,
    pub code_ttl_minutes: Option<u64>,
    pub max_pending_per_channel: Option<usize>,
    pub code_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadsFileConfig {
    /// Idle hours before a binding expires; 0 disables expiry
    pub ttl_hours: Option<f64>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub initial_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailoverFileConfig {
    pub enabled: Option<bool>,
    /// Primary model as `provider:model`
    pub primary: Option<String>,
    /// Comma-separated `provider:model` fallbacks
    pub chain: Option<String>,
    pub max_retries_per_model: Option<u32>,
    pub base_backoff_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub connect_secs: Option<u64>,
    pub send_secs: Option<u64>,
    pub shutdown_secs: Option<u64>,
    pub approval_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamingFileConfig {
    /// `off`, `partial` or `block`
    pub mode: Option<String>,
    /// Per-channel mode overrides
    #[serde(default)]
    pub channels: HashMap<String, String>,
    pub edit_interval_ms: Option<u64>,
    pub min_chunk: Option<usize>,
    pub max_chunk: Option<usize>,
    pub max_message: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubAgentsFileConfig {
    pub max_spawn_depth: Option<u32>,
    pub max_children_per_agent: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentFileConfig {
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `ChannelsConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file(path: Option<&Path>) -> ChannelsConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ChannelsConfigFile::default();
    };

    if !path.exists() {
        return ChannelsConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ChannelsConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ChannelsConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-channels/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-channels")
            .join("config.toml")
    })
}
