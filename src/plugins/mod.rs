//! Channel plugin system
//!
//! Plugins are discovered from `plugin.json` manifests in standard
//! directories. Each manifest names a registered adapter factory and declares
//! the configuration schema the factory reads; user overrides persist in
//! `plugins_state.json`.

pub mod config;
pub mod discovery;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod state;

pub use config::{ConfigFieldView, EnvLookup, ResolvedConfig, ValueSource, process_env};
pub use discovery::{MANIFEST_FILE, default_plugin_dirs, discover_plugins};
pub use loader::{LoaderOptions, PluginInfo, PluginLoader};
pub use manifest::{ConfigField, PluginManifest};
pub use registry::{AdapterFactory, AdapterRegistry, PluginContext};
pub use state::{MASKED_VALUE, PluginState, PluginStateStore};
