//! Adapter factory registry
//!
//! Adapter implementations register a named factory at startup. Manifests
//! refer to factories by name; the loader never loads code dynamically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::config::ResolvedConfig;
use crate::Result;
use crate::channels::{ChannelAdapter, webhook};

/// Everything a factory needs to build a plugin's adapters
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    /// Plugin directory
    pub path: PathBuf,
    pub config: ResolvedConfig,
}

/// Builds the adapters for one plugin
pub type AdapterFactory =
    Arc<dyn Fn(&PluginContext) -> Result<Vec<Arc<dyn ChannelAdapter>>> + Send + Sync>;

/// Named adapter factories
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the adapters shipped in this crate
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("webhook", webhook::factory);
        registry
    }

    /// Register a factory, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginContext) -> Result<Vec<Arc<dyn ChannelAdapter>>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .factories
            .insert(name.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!(factory = %name, "adapter factory replaced");
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<AdapterFactory> {
        self.factories.get(name).cloned()
    }

    /// Registered factory names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_webhook() {
        let registry = AdapterRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["webhook"]);

        let factory = registry.get("webhook").unwrap();
        let ctx = PluginContext {
            plugin_id: "webhook".to_string(),
            path: PathBuf::from("/tmp/webhook"),
            config: ResolvedConfig::default(),
        };
        let adapters = factory(&ctx).unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].id(), "webhook");
    }

    #[test]
    fn unknown_factory_is_none() {
        assert!(AdapterRegistry::new().get("slack").is_none());
    }
}
