//! Plugin loader and channel lifecycle manager
//!
//! Owns the process-wide channel id → adapter map. Each adapter runs as an
//! independent supervised task; its inbound queue is drained by a per-channel
//! dispatch loop that hands every message to the host `MessageHandler` on its
//! own task, so one failing adapter or message never affects the others.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::config::{ConfigFieldView, EnvLookup, ResolvedConfig, process_env};
use super::discovery::discover_plugins;
use super::manifest::PluginManifest;
use super::registry::{AdapterRegistry, PluginContext};
use super::state::{PluginState, PluginStateStore};
use crate::channels::{AdapterState, ChannelAdapter, ChannelMessage, MessageHandler, MessageSink};
use crate::retry::{ReconnectPolicy, reconnect_loop};
use crate::{Error, Result};

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub plugin_dirs: Vec<PathBuf>,
    /// `plugins_state.json` location
    pub state_path: PathBuf,
    /// Inbound messages buffered per channel
    pub queue_capacity: usize,
    /// Bound on a push-style adapter's start
    pub connect_timeout: Duration,
    /// Backoff between sessions of streaming adapters
    pub reconnect: ReconnectPolicy,
    pub send_timeout: Duration,
    /// Bound on each stop step (drain, adapter stop, task join)
    pub stop_timeout: Duration,
}

impl LoaderOptions {
    #[must_use]
    pub fn new(plugin_dirs: Vec<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dirs,
            state_path: state_path.into(),
            queue_capacity: 64,
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            send_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// A discovered plugin
#[derive(Debug, Clone)]
struct LoadedPlugin {
    manifest: PluginManifest,
    path: PathBuf,
    enabled: bool,
    config: ResolvedConfig,
    channels: Vec<String>,
}

/// Plugin listing entry; sensitive config values are masked
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub adapter: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub config: Vec<ConfigFieldView>,
    /// Channel ids registered by this plugin
    pub channels: Vec<String>,
}

struct ChannelTasks {
    channel: String,
    start: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<ChannelTasks>,
}

/// Discovers plugins, builds their adapters and runs them
pub struct PluginLoader {
    options: LoaderOptions,
    registry: AdapterRegistry,
    env: EnvLookup,
    state: PluginStateStore,
    plugins: RwLock<Vec<LoadedPlugin>>,
    channels: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    running: Mutex<Option<Running>>,
}

impl PluginLoader {
    /// Create a loader reading secrets from the process environment
    #[must_use]
    pub fn new(options: LoaderOptions, registry: AdapterRegistry) -> Self {
        Self::with_env(options, registry, process_env())
    }

    /// Create a loader with a custom environment lookup
    #[must_use]
    pub fn with_env(options: LoaderOptions, registry: AdapterRegistry, env: EnvLookup) -> Self {
        let state = PluginStateStore::new(options.state_path.clone());
        Self {
            options,
            registry,
            env,
            state,
            plugins: RwLock::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
            handler: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Scan plugin directories and build adapters for enabled plugins
    ///
    /// Re-reads the state file first. Returns the ids of plugins that
    /// registered at least one channel. A plugin whose factory is unknown or
    /// whose configuration is invalid is logged and skipped.
    pub fn discover(&self) -> Vec<String> {
        if self.is_running() {
            tracing::warn!("channels are running; use reload to rediscover plugins");
            return self.active_plugin_ids();
        }

        // The file is left as is; updates refuse to overwrite it
        let state = self.state.load().unwrap_or_else(|e| {
            tracing::error!(
                path = %self.state.path().display(),
                error = %e,
                "plugin state unreadable, using manifest values"
            );
            PluginState::default()
        });
        let mut plugins: Vec<LoadedPlugin> = Vec::new();
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();

        for (path, manifest) in discover_plugins(&self.options.plugin_dirs) {
            if plugins.iter().any(|p| p.manifest.id == manifest.id) {
                tracing::warn!(plugin_id = %manifest.id, path = %path.display(), "duplicate plugin id, skipping");
                continue;
            }

            let dir_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let enabled = state
                .enabled_for(&manifest.id, &dir_name)
                .unwrap_or(manifest.enabled);
            let config = ResolvedConfig::resolve(
                &manifest,
                state.config_for(&manifest.id, &dir_name),
                &self.env,
            );

            let mut plugin = LoadedPlugin {
                manifest,
                path,
                enabled,
                config,
                channels: Vec::new(),
            };

            if plugin.enabled {
                for adapter in self.instantiate(&plugin) {
                    let channel = adapter.id().to_string();
                    if channels.contains_key(&channel) {
                        tracing::warn!(
                            plugin_id = %plugin.manifest.id,
                            %channel,
                            "channel id already registered, skipping adapter"
                        );
                        continue;
                    }
                    channels.insert(channel.clone(), adapter);
                    plugin.channels.push(channel);
                }
            } else {
                tracing::debug!(plugin_id = %plugin.manifest.id, "plugin disabled");
            }

            plugins.push(plugin);
        }

        tracing::info!(
            plugins = plugins.len(),
            channels = channels.len(),
            "plugin discovery complete"
        );

        *self.channels.write().unwrap_or_else(PoisonError::into_inner) = channels;
        *self.plugins.write().unwrap_or_else(PoisonError::into_inner) = plugins;
        self.active_plugin_ids()
    }

    fn instantiate(&self, plugin: &LoadedPlugin) -> Vec<Arc<dyn ChannelAdapter>> {
        let factory_name = plugin.manifest.adapter_name();
        let Some(factory) = self.registry.get(factory_name) else {
            tracing::warn!(
                plugin_id = %plugin.manifest.id,
                factory = %factory_name,
                "no adapter factory registered for plugin"
            );
            return Vec::new();
        };

        let ctx = PluginContext {
            plugin_id: plugin.manifest.id.clone(),
            path: plugin.path.clone(),
            config: plugin.config.clone(),
        };
        match factory(&ctx) {
            Ok(adapters) => {
                tracing::info!(
                    plugin_id = %plugin.manifest.id,
                    adapters = adapters.len(),
                    "plugin loaded"
                );
                adapters
            }
            Err(e) => {
                tracing::error!(plugin_id = %plugin.manifest.id, error = %e, "plugin failed to load");
                Vec::new()
            }
        }
    }

    fn active_plugin_ids(&self) -> Vec<String> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| !p.channels.is_empty())
            .map(|p| p.manifest.id.clone())
            .collect()
    }

    /// Start every registered adapter and route inbound messages to `handler`
    ///
    /// Returns the number of channels started. Start failures are logged per
    /// adapter and never abort the others.
    pub fn start_all(&self, handler: Arc<dyn MessageHandler>) -> usize {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            tracing::warn!("channels already running");
            return 0;
        }

        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&handler));

        let cancel = CancellationToken::new();
        let tasks: Vec<ChannelTasks> = self
            .snapshot()
            .into_iter()
            .map(|(channel, adapter)| {
                self.spawn_channel(channel, adapter, Arc::clone(&handler), cancel.child_token())
            })
            .collect();

        tracing::info!(channels = tasks.len(), "channels started");
        let count = tasks.len();
        *running = Some(Running { cancel, tasks });
        count
    }

    fn spawn_channel(
        &self,
        channel: String,
        adapter: Arc<dyn ChannelAdapter>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> ChannelTasks {
        let (tx, rx) = mpsc::channel(self.options.queue_capacity.max(1));

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&adapter),
            rx,
            handler,
            cancel.clone(),
            self.options.stop_timeout,
        ));
        let start = tokio::spawn(supervise_start(
            adapter,
            MessageSink::new(tx),
            self.options.clone(),
            cancel,
        ));

        ChannelTasks {
            channel,
            start,
            dispatch,
        }
    }

    /// Send through a channel; false if the channel is unknown or delivery fails
    pub async fn send(&self, channel: &str, to: &str, content: &str, attachments: &[String]) -> bool {
        let Some(adapter) = self.get_channel(channel) else {
            tracing::warn!(%channel, "send to unknown channel");
            return false;
        };

        match tokio::time::timeout(
            self.options.send_timeout,
            adapter.send(to, content, attachments),
        )
        .await
        {
            Ok(sent) => sent,
            Err(_) => {
                tracing::warn!(%channel, to, "send timed out");
                false
            }
        }
    }

    /// Stop every adapter and wait (bounded) for their tasks
    ///
    /// Dispatch loops stop accepting first and drain in-flight messages, then
    /// adapters are stopped. Individual failures and timeouts are logged.
    pub async fn stop_all(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, mut tasks }) = running else {
            return;
        };

        let timeout = self.options.stop_timeout;
        cancel.cancel();

        for task in &mut tasks {
            if tokio::time::timeout(timeout, &mut task.dispatch).await.is_err() {
                tracing::warn!(channel = %task.channel, "dispatch loop did not stop in time");
                task.dispatch.abort();
            }
        }

        let adapters = self.snapshot();
        futures::future::join_all(adapters.iter().map(|(channel, adapter)| async move {
            match tokio::time::timeout(timeout, adapter.stop()).await {
                Ok(Ok(())) => tracing::debug!(%channel, "adapter stopped"),
                Ok(Err(e)) => tracing::warn!(%channel, error = %e, "adapter stop failed"),
                Err(_) => tracing::warn!(%channel, "adapter stop timed out"),
            }
        }))
        .await;

        for task in &mut tasks {
            if tokio::time::timeout(timeout, &mut task.start).await.is_err() {
                tracing::warn!(channel = %task.channel, "adapter task did not exit, aborting");
                task.start.abort();
            }
        }

        tracing::info!(channels = tasks.len(), "channels stopped");
    }

    /// Stop, rediscover and (if previously started) restart all channels
    pub async fn reload(&self) -> Vec<String> {
        let was_running = self.is_running();
        self.stop_all().await;

        let ids = self.discover();

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler.filter(|_| was_running) {
            self.start_all(handler);
        }

        tracing::info!(plugins = ids.len(), "plugins reloaded");
        ids
    }

    /// Persist a plugin's enabled flag; applies on the next reload
    ///
    /// # Errors
    ///
    /// Returns error if the plugin is unknown or the state file cannot be written
    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<()> {
        self.require_plugin(plugin_id)?;
        self.state.set_enabled(plugin_id, enabled)?;
        if let Some(plugin) = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .find(|p| p.manifest.id == plugin_id)
        {
            plugin.enabled = enabled;
        }
        Ok(())
    }

    /// Persist config overrides; masked placeholders are ignored
    ///
    /// Returns the keys saved. Applies on the next reload.
    ///
    /// # Errors
    ///
    /// Returns error if the plugin is unknown or the state file cannot be written
    pub fn save_config(
        &self,
        plugin_id: &str,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>> {
        self.require_plugin(plugin_id)?;
        self.state.save_config(plugin_id, values)
    }

    fn require_plugin(&self, plugin_id: &str) -> Result<()> {
        let known = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| p.manifest.id == plugin_id);
        if known {
            Ok(())
        } else {
            Err(Error::NotFound(format!("plugin '{plugin_id}'")))
        }
    }

    /// Registered channel ids, sorted
    #[must_use]
    pub fn list_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn get_channel(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Channel ids with their adapter states, sorted by id
    #[must_use]
    pub fn channel_states(&self) -> Vec<(String, AdapterState)> {
        self.snapshot()
            .into_iter()
            .map(|(id, adapter)| (id, adapter.state()))
            .collect()
    }

    /// All discovered plugins, including disabled ones
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| PluginInfo {
                id: p.manifest.id.clone(),
                name: p.manifest.name.clone(),
                version: p.manifest.version.clone(),
                description: p.manifest.description.clone(),
                adapter: p.manifest.adapter_name().to_string(),
                path: p.path.clone(),
                enabled: p.enabled,
                config: p.config.masked().to_vec(),
                channels: p.channels.clone(),
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn ChannelAdapter>)> {
        let mut adapters: Vec<(String, Arc<dyn ChannelAdapter>)> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, adapter)| (id.clone(), Arc::clone(adapter)))
            .collect();
        adapters.sort_by(|a, b| a.0.cmp(&b.0));
        adapters
    }
}

/// Run an adapter's start, containing errors and panics
///
/// Streaming adapters are reconnected with backoff until `cancel` fires.
/// Push-style adapters get one bounded attempt.
async fn supervise_start(
    adapter: Arc<dyn ChannelAdapter>,
    sink: MessageSink,
    options: LoaderOptions,
    cancel: CancellationToken,
) {
    let channel = adapter.id().to_string();
    tracing::debug!(%channel, streaming = adapter.is_streaming(), "starting adapter");

    if adapter.is_streaming() {
        reconnect_loop(&channel, &options.reconnect, &cancel, || {
            run_session(Arc::clone(&adapter), sink.clone())
        })
        .await;
        tracing::debug!(%channel, "reconnect loop exited");
        return;
    }

    let started = tokio::select! {
        () = cancel.cancelled() => return,
        started = tokio::time::timeout(options.connect_timeout, run_session(adapter, sink)) => started,
    };
    match started {
        Ok(Ok(())) => tracing::debug!(%channel, "adapter start returned"),
        Ok(Err(e)) => tracing::error!(%channel, error = %e, "adapter failed to start"),
        Err(_) => tracing::error!(
            %channel,
            timeout_secs = options.connect_timeout.as_secs(),
            "adapter start timed out"
        ),
    }
}

/// One call to `start`, with a panic reported as a channel error
async fn run_session(adapter: Arc<dyn ChannelAdapter>, sink: MessageSink) -> Result<()> {
    AssertUnwindSafe(adapter.start(sink))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::Channel("adapter panicked".to_string())))
}

/// Drain one channel's inbound queue into the handler
///
/// On cancel the queue is closed and messages already queued are still
/// handled; whatever is unfinished when `drain_timeout` expires is dropped.
async fn dispatch_loop(
    adapter: Arc<dyn ChannelAdapter>,
    mut rx: mpsc::Receiver<ChannelMessage>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    drain_timeout: Duration,
) {
    let channel = adapter.id().to_string();
    let mut in_flight: JoinSet<Result<()>> = JoinSet::new();
    let spawn = |in_flight: &mut JoinSet<Result<()>>, message: ChannelMessage| {
        let handler = Arc::clone(&handler);
        let adapter = Arc::clone(&adapter);
        in_flight.spawn(async move { handler.handle(adapter, message).await });
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                spawn(&mut in_flight, message);
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_outcome(&channel, joined);
            }
        }
    }

    rx.close();
    let mut queued = 0usize;
    while let Ok(message) = rx.try_recv() {
        spawn(&mut in_flight, message);
        queued += 1;
    }
    if queued > 0 {
        tracing::debug!(%channel, queued, "handling queued messages before stop");
    }

    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(joined) = in_flight.join_next().await {
            log_outcome(&channel, joined);
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(%channel, dropped = in_flight.len(), "dropping unfinished messages");
        in_flight.shutdown().await;
    }

    tracing::debug!(%channel, "dispatch loop exited");
}

fn log_outcome(channel: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(channel, error = %e, "message handling failed"),
        Err(e) if e.is_panic() => tracing::error!(channel, "message handler panicked"),
        Err(_) => tracing::debug!(channel, "message handler cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Adapter that records sends and can be told to fail on start
    struct StubAdapter {
        id: String,
        fail_start: bool,
        state: Mutex<AdapterState>,
        sink: Mutex<Option<MessageSink>>,
        sent: Mutex<Vec<String>>,
    }

    impl StubAdapter {
        fn new(id: &str, fail_start: bool) -> Self {
            Self {
                id: id.to_string(),
                fail_start,
                state: Mutex::new(AdapterState::NotStarted),
                sink: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for StubAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self, sink: MessageSink) -> Result<()> {
            if self.fail_start {
                return Err(Error::Config("missing token".to_string()));
            }
            *self.sink.lock().unwrap() = Some(sink);
            *self.state.lock().unwrap() = AdapterState::Running;
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            *self.state.lock().unwrap() = AdapterState::Stopped;
            Ok(())
        }

        async fn deliver(&self, to: &str, content: &str, _attachments: &[String]) -> Result<()> {
            if !to.starts_with("user:") {
                return Err(Error::Channel(format!("unsupported target {to}")));
            }
            self.sent.lock().unwrap().push(format!("{to} {content}"));
            Ok(())
        }

        fn state(&self) -> AdapterState {
            *self.state.lock().unwrap()
        }
    }

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _adapter: Arc<dyn ChannelAdapter>, _message: ChannelMessage) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn write_plugin(root: &std::path::Path, dir: &str, manifest: &str) {
        let plugin_dir = root.join(dir);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("plugin.json"), manifest).unwrap();
    }

    fn loader(root: &std::path::Path) -> PluginLoader {
        let mut registry = AdapterRegistry::new();
        registry.register("stub", |ctx: &PluginContext| {
            let fail = ctx.config.bool("fail_start").unwrap_or(false);
            let id = ctx.config.string("channel_id").unwrap_or_else(|| ctx.plugin_id.clone());
            Ok(vec![Arc::new(StubAdapter::new(&id, fail)) as Arc<dyn ChannelAdapter>])
        });
        registry.register("broken", |_ctx: &PluginContext| {
            Err(Error::Config("bad config".to_string()))
        });

        PluginLoader::with_env(
            LoaderOptions::new(vec![root.join("plugins")], root.join("plugins_state.json")),
            registry,
            Arc::new(|_: &str| None),
        )
    }

    #[tokio::test]
    async fn discover_builds_enabled_plugins_only() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        write_plugin(&plugins, "alpha", r#"{"enabled": true, "adapter": "stub"}"#);
        write_plugin(&plugins, "beta", r#"{"enabled": false, "adapter": "stub"}"#);
        write_plugin(&plugins, "gamma", r#"{"enabled": true, "adapter": "missing"}"#);
        write_plugin(&plugins, "delta", r#"{"enabled": true, "adapter": "broken"}"#);

        let loader = loader(dir.path());
        assert_eq!(loader.discover(), vec!["alpha"]);
        assert_eq!(loader.list_channels(), vec!["alpha"]);
        assert_eq!(loader.list_plugins().len(), 4);
    }

    #[tokio::test]
    async fn state_file_overrides_manifest_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        write_plugin(&plugins, "alpha", r#"{"enabled": true, "adapter": "stub"}"#);
        write_plugin(&plugins, "beta", r#"{"adapter": "stub"}"#);

        let loader = loader(dir.path());
        loader.discover();
        loader.set_enabled("alpha", false).unwrap();
        loader.set_enabled("beta", true).unwrap();
        assert!(loader.set_enabled("nope", true).is_err());

        assert_eq!(loader.discover(), vec!["beta"]);
    }

    #[tokio::test]
    async fn duplicate_channel_ids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        let manifest = r#"{"enabled": true, "adapter": "stub", "config": {"channel_id": "shared"}}"#;
        write_plugin(&plugins, "one", manifest);
        write_plugin(&plugins, "two", manifest);

        let loader = loader(dir.path());
        assert_eq!(loader.discover(), vec!["one"]);
        assert_eq!(loader.list_channels(), vec!["shared"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_does_not_affect_other_channels() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        write_plugin(&plugins, "good", r#"{"enabled": true, "adapter": "stub"}"#);
        write_plugin(
            &plugins,
            "bad",
            r#"{"enabled": true, "adapter": "stub", "config": {"fail_start": true}}"#,
        );

        let loader = loader(dir.path());
        loader.discover();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        assert_eq!(loader.start_all(handler), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let states: HashMap<_, _> = loader.channel_states().into_iter().collect();
        assert_eq!(states["good"], AdapterState::Running);
        assert_eq!(states["bad"], AdapterState::NotStarted);

        assert!(loader.send("good", "user:1", "hi", &[]).await);
        assert!(!loader.send("good", "room:1", "hi", &[]).await);
        assert!(!loader.send("unknown", "user:1", "hi", &[]).await);

        loader.stop_all().await;
        let states: HashMap<_, _> = loader.channel_states().into_iter().collect();
        assert_eq!(states["good"], AdapterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_reach_handler() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(&dir.path().join("plugins"), "alpha", r#"{"enabled": true, "adapter": "stub"}"#);

        let built: Arc<Mutex<Vec<Arc<StubAdapter>>>> = Arc::default();
        let mut registry = AdapterRegistry::new();
        let record = Arc::clone(&built);
        registry.register("stub", move |ctx: &PluginContext| {
            let adapter = Arc::new(StubAdapter::new(&ctx.plugin_id, false));
            record.lock().unwrap().push(Arc::clone(&adapter));
            Ok(vec![adapter as Arc<dyn ChannelAdapter>])
        });
        let loader = PluginLoader::with_env(
            LoaderOptions::new(vec![dir.path().join("plugins")], dir.path().join("state.json")),
            registry,
            Arc::new(|_: &str| None),
        );
        loader.discover();

        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        loader.start_all(Arc::clone(&handler) as Arc<dyn MessageHandler>);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stub = Arc::clone(&built.lock().unwrap()[0]);
        let sink = stub.sink.lock().unwrap().clone().unwrap();
        for text in ["one", "two", "three"] {
            assert!(sink.deliver(ChannelMessage::new("alpha", "u", "u", text)).await);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);

        loader.stop_all().await;
        assert!(!sink.deliver(ChannelMessage::new("alpha", "u", "u", "late")).await);
    }

    /// Handler that never finishes
    struct StuckHandler(AtomicUsize);

    #[async_trait]
    impl MessageHandler for StuckHandler {
        async fn handle(&self, _adapter: Arc<dyn ChannelAdapter>, _message: ChannelMessage) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Start a single stub channel and return its inbound sink
    async fn started(root: &std::path::Path, handler: Arc<dyn MessageHandler>) -> (PluginLoader, MessageSink) {
        write_plugin(&root.join("plugins"), "alpha", r#"{"enabled": true, "adapter": "stub"}"#);

        let built: Arc<Mutex<Vec<Arc<StubAdapter>>>> = Arc::default();
        let mut registry = AdapterRegistry::new();
        let record = Arc::clone(&built);
        registry.register("stub", move |ctx: &PluginContext| {
            let adapter = Arc::new(StubAdapter::new(&ctx.plugin_id, false));
            record.lock().unwrap().push(Arc::clone(&adapter));
            Ok(vec![adapter as Arc<dyn ChannelAdapter>])
        });
        let loader = PluginLoader::with_env(
            LoaderOptions::new(vec![root.join("plugins")], root.join("state.json")),
            registry,
            Arc::new(|_: &str| None),
        );
        loader.discover();
        loader.start_all(handler);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stub = Arc::clone(&built.lock().unwrap()[0]);
        let sink = stub.sink.lock().unwrap().clone().unwrap();
        (loader, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_are_handled_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let (loader, sink) = started(dir.path(), Arc::clone(&handler) as Arc<dyn MessageHandler>).await;

        // Queue without yielding so the dispatch loop sees them only at stop
        for i in 0..5 {
            assert!(sink.deliver(ChannelMessage::new("alpha", "u", "u", format!("m{i}"))).await);
        }
        loader.stop_all().await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 5);
        assert!(!sink.deliver(ChannelMessage::new("alpha", "u", "u", "late")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_messages_are_dropped_after_drain_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(StuckHandler(AtomicUsize::new(0)));
        let (loader, sink) = started(dir.path(), Arc::clone(&handler) as Arc<dyn MessageHandler>).await;

        assert!(sink.deliver(ChannelMessage::new("alpha", "u", "u", "stuck")).await);
        let stopping = tokio::time::Instant::now();
        loader.stop_all().await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert!(stopping.elapsed() >= Duration::from_secs(10));
    }

    /// Adapter whose start fails once, returns once, then holds the connection
    struct FlakyStream {
        sessions: AtomicUsize,
        streaming: bool,
    }

    #[async_trait]
    impl ChannelAdapter for FlakyStream {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn start(&self, _sink: MessageSink) -> Result<()> {
            match self.sessions.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::Channel("connection refused".to_string())),
                1 => Ok(()),
                _ => std::future::pending().await,
            }
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn deliver(&self, _to: &str, _content: &str, _attachments: &[String]) -> Result<()> {
            Ok(())
        }

        fn state(&self) -> AdapterState {
            AdapterState::Running
        }

        fn is_streaming(&self) -> bool {
            self.streaming
        }
    }

    fn single_adapter_loader(root: &std::path::Path, adapter: Arc<FlakyStream>) -> PluginLoader {
        write_plugin(&root.join("plugins"), "flaky", r#"{"enabled": true, "adapter": "flaky"}"#);
        let mut registry = AdapterRegistry::new();
        registry.register("flaky", move |_ctx: &PluginContext| {
            Ok(vec![Arc::clone(&adapter) as Arc<dyn ChannelAdapter>])
        });
        let loader = PluginLoader::with_env(
            LoaderOptions::new(vec![root.join("plugins")], root.join("state.json")),
            registry,
            Arc::new(|_: &str| None),
        );
        loader.discover();
        loader
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_adapters_reconnect_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(FlakyStream {
            sessions: AtomicUsize::new(0),
            streaming: true,
        });
        let loader = single_adapter_loader(dir.path(), Arc::clone(&adapter));
        loader.start_all(Arc::new(CountingHandler(AtomicUsize::new(0))));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 1);

        // Failed connect waits the initial 5s
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 2);

        // A closed session resets the backoff to 5s
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 3);

        let stopping = tokio::time::Instant::now();
        loader.stop_all().await;
        assert!(stopping.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn push_adapters_start_once() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(FlakyStream {
            sessions: AtomicUsize::new(0),
            streaming: false,
        });
        let loader = single_adapter_loader(dir.path(), Arc::clone(&adapter));
        loader.start_all(Arc::new(CountingHandler(AtomicUsize::new(0))));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 1);
        loader.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_push_start_hits_connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(FlakyStream {
            // Skip straight to the session that never returns
            sessions: AtomicUsize::new(2),
            streaming: false,
        });
        let loader = single_adapter_loader(dir.path(), Arc::clone(&adapter));
        loader.start_all(Arc::new(CountingHandler(AtomicUsize::new(0))));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let running = loader.running.lock().unwrap();
        let task = &running.as_ref().unwrap().tasks[0];
        assert!(task.start.is_finished());
        drop(running);
        loader.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reload_picks_up_new_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        write_plugin(&plugins, "alpha", r#"{"enabled": true, "adapter": "stub"}"#);

        let loader = loader(dir.path());
        loader.discover();
        loader.start_all(Arc::new(CountingHandler(AtomicUsize::new(0))));

        write_plugin(&plugins, "beta", r#"{"enabled": true, "adapter": "stub"}"#);
        let ids = loader.reload().await;
        assert_eq!(ids, vec!["alpha", "beta"]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let states: HashMap<_, _> = loader.channel_states().into_iter().collect();
        assert_eq!(states["beta"], AdapterState::Running);
        loader.stop_all().await;
    }

    #[tokio::test]
    async fn listing_masks_sensitive_values() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            &dir.path().join("plugins"),
            "alpha",
            r#"{"enabled": true, "adapter": "stub",
                "config": {"token": {"default": "hunter2", "sensitive": true}}}"#,
        );

        let loader = loader(dir.path());
        loader.discover();
        let info = &loader.list_plugins()[0];
        assert_eq!(info.channels, vec!["alpha"]);
        assert_eq!(info.config[0].value, serde_json::json!(super::super::state::MASKED_VALUE));
    }
}
