use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_channels::plugins::{AdapterRegistry, PluginLoader};
use beacon_channels::security::PairingManager;
use beacon_channels::{Config, Daemon};

/// Beacon Channels - channel plugin kernel for AI assistants
#[derive(Parser)]
#[command(name = "beacon-channels", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/beacon-channels/config.toml)
    #[arg(short, long, env = "BEACON_CHANNELS_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Extra plugin directory (repeatable; searched before configured ones)
    #[arg(long = "plugin-dir")]
    plugin_dirs: Vec<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List discovered plugins with their (masked) configuration
    Plugins,
    /// Show or change the DM allow/block lists
    Access {
        #[command(subcommand)]
        action: Option<AccessAction>,
    },
}

#[derive(Subcommand)]
enum AccessAction {
    /// Remove a sender from the allowlist
    Revoke {
        /// Sender ID
        sender_id: String,
    },
    /// Block a sender
    Block {
        /// Sender ID
        sender_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_channels=info",
        1 => "info,beacon_channels=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    // CLI flags win over file and environment
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if !cli.plugin_dirs.is_empty() {
        let mut dirs = cli.plugin_dirs;
        dirs.append(&mut config.paths.plugin_dirs);
        config.paths.plugin_dirs = dirs;
    }

    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Plugins) => {
            list_plugins(&config);
            Ok(())
        }
        Some(Command::Access { action }) => access(&config, action),
        None => {
            tracing::info!(
                port = config.server.port,
                policy = %config.pairing.policy,
                "starting beacon-channels"
            );
            Daemon::new(config).run().await?;
            Ok(())
        }
    }
}

/// Print discovered plugins
fn list_plugins(config: &Config) {
    let loader = PluginLoader::new(config.loader_options(), AdapterRegistry::with_builtins());
    loader.discover();

    let plugins = loader.list_plugins();
    if plugins.is_empty() {
        println!("No plugins found in:");
        for dir in &config.paths.plugin_dirs {
            println!("  {}", dir.display());
        }
        return;
    }

    for plugin in plugins {
        let status = if plugin.enabled { "enabled" } else { "disabled" };
        println!(
            "{} ({}) [{status}] adapter={}",
            plugin.name, plugin.id, plugin.adapter
        );
        if !plugin.channels.is_empty() {
            println!("  channels: {}", plugin.channels.join(", "));
        }
        for field in plugin.config {
            let value = match &field.value {
                serde_json::Value::Null => "-".to_string(),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            println!("  {} = {value} ({:?})", field.key, field.source);
        }
    }
}

/// Show or change the allow/block lists
fn access(config: &Config, action: Option<AccessAction>) -> anyhow::Result<()> {
    let pairing = PairingManager::new(config.pairing_config());

    match action {
        None => {
            println!("{}", pairing.summary());
            println!("allowed: {}", pairing.list_allowed().join(", "));
            println!("blocked: {}", pairing.list_blocked().join(", "));
        }
        Some(AccessAction::Revoke { sender_id }) => {
            if pairing.revoke(&sender_id)? {
                println!("Revoked {sender_id}");
            } else {
                println!("{sender_id} was not on the allowlist");
            }
        }
        Some(AccessAction::Block { sender_id }) => {
            pairing.block(&sender_id)?;
            println!("Blocked {sender_id}");
        }
    }

    Ok(())
}
