//! Daemon - the channel service
//!
//! Wires the pairing manager, thread binding store, plugin loader,
//! dispatcher and HTTP API together, then runs until interrupted.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentHandler, EchoAgent, HttpAgent};
use crate::api::rate_limit::create_limiter;
use crate::api::{ApiServer, ApiState};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::failover::FailoverStats;
use crate::lifecycle::ChannelOverrides;
use crate::plugins::{AdapterRegistry, PluginLoader};
use crate::security::PairingManager;
use crate::threads::ThreadBindingStore;
use crate::Result;

/// The beacon-channels daemon
pub struct Daemon {
    config: Config,
    registry: AdapterRegistry,
}

impl Daemon {
    /// Create a daemon with the built-in adapter factories
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, AdapterRegistry::with_builtins())
    }

    /// Create a daemon with a custom adapter registry
    #[must_use]
    pub const fn with_registry(config: Config, registry: AdapterRegistry) -> Self {
        Self { config, registry }
    }

    /// Build the agent backend: HTTP when a URL is configured, echo otherwise
    fn build_agent(
        &self,
        overrides: &Arc<ChannelOverrides>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn AgentHandler>, Option<Arc<FailoverStats>>)> {
        let Some(url) = &self.config.agent.url else {
            tracing::warn!("no agent URL configured - replies will echo the message");
            return Ok((Arc::new(EchoAgent), None));
        };

        let agent = HttpAgent::new(
            url.clone(),
            self.config.failover.primary.clone(),
            self.config.failover_config(),
            Arc::clone(overrides),
            self.config.agent.timeout,
        )?
        .with_api_key(self.config.agent.api_key.clone())
        .with_cancel(cancel.child_token());

        tracing::info!(
            url = %url,
            model = %self.config.failover.primary,
            failover = self.config.failover.chain.len(),
            "agent backend configured"
        );

        let stats = agent.stats();
        Ok((Arc::new(agent), Some(stats)))
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the agent backend cannot be built
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
    }

    /// Run the daemon until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the agent backend cannot be built
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let cancel = CancellationToken::new();
        let timeouts = self.config.timeouts;

        let pairing = Arc::new(PairingManager::new(self.config.pairing_config()));
        tracing::info!(summary = %pairing.summary(), "DM access control ready");

        let bindings = Arc::new(ThreadBindingStore::new(self.config.threads.ttl_hours));
        let sweeper =
            bindings.spawn_sweeper(self.config.threads.sweep_interval, cancel.child_token());

        let overrides = Arc::new(self.config.channel_overrides());
        let (agent, stats) = self.build_agent(&overrides, &cancel)?;

        let loader = Arc::new(PluginLoader::new(
            self.config.loader_options(),
            self.registry,
        ));
        let plugins = loader.discover();
        tracing::info!(plugins = ?plugins, channels = ?loader.list_channels(), "plugins discovered");

        let dispatcher = Dispatcher::new(
            Arc::clone(&pairing),
            Arc::clone(&bindings),
            overrides,
            agent,
            self.config.dispatch_config(),
        )
        .with_channels(&loader)
        .with_cancel(cancel.child_token());

        let started = loader.start_all(Arc::new(dispatcher));
        tracing::info!(started, "channel adapters starting");

        let api = ApiServer::new(
            ApiState {
                loader: Arc::clone(&loader),
                pairing,
                bindings,
                api_key: self.config.server.api_key.clone(),
                webhook_limiter: Some(create_limiter(self.config.server.webhook_rate_per_minute)),
                approval_wait: self.config.timeouts.approval_wait,
            },
            self.config.server.port,
        )
        .spawn(cancel.child_token());

        tracing::info!(port = self.config.server.port, "beacon-channels running");
        shutdown.await;
        tracing::info!("shutdown requested");

        cancel.cancel();
        loader.stop_all().await;
        sweeper.shutdown(timeouts.shutdown).await;

        let api_abort = api.abort_handle();
        match tokio::time::timeout(timeouts.shutdown, api).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "API server failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "API server task failed"),
            Err(_) => {
                tracing::warn!("API server did not stop in time, aborting");
                api_abort.abort();
            }
        }

        if let Some(stats) = stats {
            for (model, counts) in stats.snapshot() {
                tracing::info!(
                    model = %model,
                    success = counts.success,
                    failure = counts.failure,
                    failover_to = counts.failover_to,
                    "model call stats"
                );
            }
        }

        tracing::info!("beacon-channels stopped");
        Ok(())
    }
}
