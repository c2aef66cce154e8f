//! Configuration management for beacon-channels
//!
//! Layered as defaults → TOML file → `BEACON_CHANNELS_*` environment
//! variables. CLI flags are applied on top by the binary.

pub mod file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::agent::SubAgentLimits;
use crate::dispatch::{DispatchConfig, NotifyTarget};
use crate::failover::{FailoverConfig, ModelRef, parse_failover_chain};
use crate::lifecycle::{ChannelOverrides, StreamMode, StreamingConfig};
use crate::plugins::{EnvLookup, LoaderOptions, default_plugin_dirs, process_env};
use crate::retry::{ReconnectPolicy, RetryPolicy};
use crate::security::{DmPolicy, PairingConfig};
use crate::{Error, Result};

use self::file::{ChannelsConfigFile, load_config_file};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BEACON_CHANNELS_";

/// beacon-channels configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub pairing: PairingSettings,
    pub threads: ThreadSettings,
    /// Outbound send retries
    pub retry: RetryPolicy,
    /// Streaming connection reconnect backoff
    pub reconnect: ReconnectPolicy,
    pub failover: FailoverSettings,
    pub timeouts: Timeouts,
    pub streaming: StreamingSettings,
    pub subagents: SubAgentLimits,
    pub agent: AgentSettings,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for admin endpoints; admin routes are open when unset
    pub api_key: Option<SecretString>,

    /// Inbound webhook calls allowed per minute
    pub webhook_rate_per_minute: u32,
}

/// Filesystem locations
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Path to data directory (allowlist, plugin state)
    pub data_dir: PathBuf,
    /// Directories scanned for `plugin.json` manifests
    pub plugin_dirs: Vec<PathBuf>,
    pub plugin_state: PathBuf,
    pub allowlist: PathBuf,
}

/// DM access control settings
#[derive(Debug, Clone)]
pub struct PairingSettings {
    pub policy: DmPolicy,
    pub owner_id: Option<String>,
    pub approval_target: Option<NotifyTarget>,
    pub code_ttl: Duration,
    pub max_pending_per_channel: usize,
    pub code_length: usize,
}

/// Thread binding settings
#[derive(Debug, Clone, Copy)]
pub struct ThreadSettings {
    /// Idle hours before expiry; 0 disables expiry
    pub ttl_hours: f64,
    pub sweep_interval: Duration,
}

/// Model failover settings
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub enabled: bool,
    pub primary: ModelRef,
    pub chain: Vec<ModelRef>,
    pub max_retries_per_model: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Operation deadlines
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    /// Bound on each shutdown step
    pub shutdown: Duration,
    /// Longest an API caller may wait on a pairing decision
    pub approval_wait: Duration,
}

/// Streamed reply settings
#[derive(Debug, Clone, Default)]
pub struct StreamingSettings {
    /// Applies to channels without an entry in `channels`
    pub defaults: StreamingConfig,
    pub channels: HashMap<String, StreamMode>,
}

/// Agent backend settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Remote agent endpoint; the echo agent is used when unset
    pub url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

fn secs_f64(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

/// Typed view over `BEACON_CHANNELS_*` variables
struct Env<'a> {
    lookup: &'a EnvLookup,
}

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.string(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| Error::Config(format!("{ENV_PREFIX}{key}: invalid value '{raw}'")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.string(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

fn parse_stream_mode(raw: &str) -> Result<StreamMode> {
    StreamMode::parse(raw).ok_or_else(|| {
        Error::Config(format!(
            "invalid stream mode '{raw}', expected off, partial or block"
        ))
    })
}

fn parse_model(raw: &str) -> Result<ModelRef> {
    match raw.split_once(':') {
        Some((provider, model)) if !provider.trim().is_empty() && !model.trim().is_empty() => {
            Ok(ModelRef::new(provider.trim(), model.trim()))
        }
        _ => Err(Error::Config(format!(
            "invalid model '{raw}', expected provider:model"
        ))),
    }
}

impl Config {
    /// Load from the standard config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is malformed
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::from_sources(load_config_file(config_path), &process_env())
    }

    /// Build from an already-parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is malformed
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: ChannelsConfigFile, env: &EnvLookup) -> Result<Self> {
        let env = Env { lookup: env };

        // Server (env > toml > default)
        let server = ServerConfig {
            port: env.parse("PORT")?.or(fc.server.port).unwrap_or(18790),
            api_key: env.string("API_KEY").map(SecretString::from),
            webhook_rate_per_minute: env
                .parse("WEBHOOK_RATE_PER_MINUTE")?
                .or(fc.server.webhook_rate_per_minute)
                .unwrap_or(60),
        };

        // Data directory (~/.local/share/omni/beacon-channels on Linux)
        let data_dir = env
            .string("DATA_DIR")
            .or(fc.paths.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new().map_or_else(
                    || PathBuf::from(".local/share/omni/beacon-channels"),
                    |d| d.data_dir().join("omni").join("beacon-channels"),
                )
            });

        let plugin_dirs = env
            .string("PLUGIN_DIRS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .or_else(|| {
                fc.paths
                    .plugin_dirs
                    .map(|dirs| dirs.into_iter().map(PathBuf::from).collect())
            })
            .unwrap_or_else(default_plugin_dirs);

        let paths = PathsConfig {
            plugin_state: fc
                .paths
                .plugin_state
                .map_or_else(|| data_dir.join("plugins_state.json"), PathBuf::from),
            allowlist: fc
                .paths
                .allowlist
                .map_or_else(|| data_dir.join("dm_allowlist.json"), PathBuf::from),
            plugin_dirs,
            data_dir,
        };

        // DM policy (unknown values fall back to owner)
        let approval_target = match env.string("APPROVAL_TARGET").or(fc.pairing.approval_target) {
            Some(raw) => Some(NotifyTarget::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "invalid approval target '{raw}', expected channel/kind:id"
                ))
            })?),
            None => None,
        };
        let pairing = PairingSettings {
            policy: env
                .string("DM_POLICY")
                .or(fc.pairing.policy)
                .map(|s| DmPolicy::from_str(&s))
                .unwrap_or_default(),
            owner_id: env.string("OWNER_ID").or(fc.pairing.owner_id),
            approval_target,
            code_ttl: Duration::from_secs(
                60 * fc.pairing.code_ttl_minutes.unwrap_or(60).max(1),
            ),
            max_pending_per_channel: fc.pairing.max_pending_per_channel.unwrap_or(3).max(1),
            code_length: fc.pairing.code_length.unwrap_or(8).clamp(4, 32),
        };

        let threads = ThreadSettings {
            ttl_hours: env
                .parse("THREAD_TTL_HOURS")?
                .or(fc.threads.ttl_hours)
                .unwrap_or(24.0_f64)
                .max(0.0),
            sweep_interval: Duration::from_secs(
                fc.threads.sweep_interval_secs.unwrap_or(300).max(1),
            ),
        };

        let retry_default = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: fc.retry.max_attempts.unwrap_or(retry_default.max_attempts).max(1),
            base_delay: fc
                .retry
                .base_delay_secs
                .map_or(retry_default.base_delay, |s| secs_f64(s, retry_default.base_delay)),
            max_delay: fc
                .retry
                .max_delay_secs
                .map_or(retry_default.max_delay, |s| secs_f64(s, retry_default.max_delay)),
        };

        let reconnect_default = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            initial_delay: fc.reconnect.initial_delay_secs.map_or(
                reconnect_default.initial_delay,
                |s| secs_f64(s, reconnect_default.initial_delay),
            ),
            max_delay: fc.reconnect.max_delay_secs.map_or(reconnect_default.max_delay, |s| {
                secs_f64(s, reconnect_default.max_delay)
            }),
        };

        let primary = match env.string("MODEL").or(fc.failover.primary) {
            Some(raw) => parse_model(&raw)?,
            None => ModelRef::new("anthropic", "claude-sonnet-4"),
        };
        let failover = FailoverSettings {
            enabled: env
                .flag("FAILOVER_ENABLED")
                .or(fc.failover.enabled)
                .unwrap_or(true),
            primary,
            chain: env
                .string("FAILOVER_CHAIN")
                .or(fc.failover.chain)
                .map(|spec| parse_failover_chain(&spec))
                .unwrap_or_default(),
            max_retries_per_model: fc.failover.max_retries_per_model.unwrap_or(1).max(1),
            base_backoff: fc
                .failover
                .base_backoff_secs
                .map_or(Duration::from_secs(1), |s| secs_f64(s, Duration::from_secs(1))),
            max_backoff: fc
                .failover
                .max_backoff_secs
                .map_or(Duration::from_secs(30), |s| secs_f64(s, Duration::from_secs(30))),
        };

        let timeouts = Timeouts {
            connect: Duration::from_secs(fc.timeouts.connect_secs.unwrap_or(30)),
            send: Duration::from_secs(fc.timeouts.send_secs.unwrap_or(30)),
            shutdown: Duration::from_secs(fc.timeouts.shutdown_secs.unwrap_or(10)),
            approval_wait: Duration::from_secs(fc.timeouts.approval_wait_secs.unwrap_or(300)),
        };

        let stream_default = StreamingConfig::default();
        let streaming = StreamingSettings {
            defaults: StreamingConfig {
                mode: env
                    .string("STREAM_MODE")
                    .or(fc.streaming.mode)
                    .map(|raw| parse_stream_mode(&raw))
                    .transpose()?
                    .unwrap_or_default(),
                edit_interval: fc
                    .streaming
                    .edit_interval_ms
                    .map_or(stream_default.edit_interval, Duration::from_millis),
                min_chunk: fc.streaming.min_chunk.unwrap_or(stream_default.min_chunk),
                max_chunk: fc.streaming.max_chunk.unwrap_or(stream_default.max_chunk),
                max_message: fc
                    .streaming
                    .max_message
                    .unwrap_or(stream_default.max_message)
                    .max(1),
                cursor: stream_default.cursor,
            },
            channels: fc
                .streaming
                .channels
                .iter()
                .map(|(channel, raw)| Ok((channel.clone(), parse_stream_mode(raw)?)))
                .collect::<Result<_>>()?,
        };

        let subagent_default = SubAgentLimits::default();
        let subagents = SubAgentLimits {
            max_spawn_depth: fc
                .subagents
                .max_spawn_depth
                .unwrap_or(subagent_default.max_spawn_depth),
            max_children_per_agent: fc
                .subagents
                .max_children_per_agent
                .unwrap_or(subagent_default.max_children_per_agent),
        };

        let agent = AgentSettings {
            url: env.string("AGENT_URL").or(fc.agent.url),
            api_key: env.string("AGENT_API_KEY").map(SecretString::from),
            timeout: Duration::from_secs(fc.agent.timeout_secs.unwrap_or(120)),
        };

        Ok(Self {
            server,
            paths,
            pairing,
            threads,
            retry,
            reconnect,
            failover,
            timeouts,
            streaming,
            subagents,
            agent,
        })
    }

    /// Pairing manager settings
    #[must_use]
    pub fn pairing_config(&self) -> PairingConfig {
        PairingConfig {
            policy: self.pairing.policy,
            owner_id: self.pairing.owner_id.clone(),
            allowlist_path: self.paths.allowlist.clone(),
            max_pending_per_channel: self.pairing.max_pending_per_channel,
            code_length: self.pairing.code_length,
            code_ttl: self.pairing.code_ttl,
        }
    }

    /// Plugin loader settings
    #[must_use]
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            connect_timeout: self.timeouts.connect,
            reconnect: self.reconnect.clone(),
            send_timeout: self.timeouts.send,
            stop_timeout: self.timeouts.shutdown,
            ..LoaderOptions::new(self.paths.plugin_dirs.clone(), self.paths.plugin_state.clone())
        }
    }

    /// Dispatcher settings
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            approval_target: self.pairing.approval_target.clone(),
            retry: self.retry.clone(),
            send_timeout: self.timeouts.send,
            subagents: self.subagents,
        }
    }

    /// Per-channel overrides seeded with the streaming settings
    #[must_use]
    pub fn channel_overrides(&self) -> ChannelOverrides {
        let overrides = ChannelOverrides::with_streaming(self.streaming.defaults.clone());
        for (channel, mode) in &self.streaming.channels {
            overrides.set_stream_mode(channel, *mode);
        }
        overrides
    }

    /// Failover settings for the agent call path
    #[must_use]
    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            enabled: self.failover.enabled,
            chain: self.failover.chain.clone(),
            max_retries_per_model: self.failover.max_retries_per_model,
            base_backoff: self.failover.base_backoff,
            max_backoff: self.failover.max_backoff,
        }
    }
}
