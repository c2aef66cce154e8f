//! Persisted plugin state (`plugins_state.json`)
//!
//! Holds user overrides that win over manifest values: per-plugin enabled
//! flags and saved configuration values.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Placeholder shown instead of sensitive values
pub const MASKED_VALUE: &str = "****PSWD****";

/// Contents of the state file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
    #[serde(default)]
    pub configs: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl PluginState {
    /// Saved enabled flag for a plugin, checking its id then directory name
    #[must_use]
    pub fn enabled_for(&self, id: &str, dir_name: &str) -> Option<bool> {
        self.enabled
            .get(id)
            .or_else(|| self.enabled.get(dir_name))
            .copied()
    }

    /// Saved config for a plugin, checking its id then directory name
    #[must_use]
    pub fn config_for(
        &self,
        id: &str,
        dir_name: &str,
    ) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.configs.get(id).or_else(|| self.configs.get(dir_name))
    }
}

/// Reads and writes the plugin state file
///
/// Updates hold `lock` across load, modify and save so concurrent admin calls
/// never overwrite each other.
#[derive(Debug)]
pub struct PluginStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PluginStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state; a missing file yields empty state
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(&self) -> Result<PluginState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PluginState::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| {
            Error::Plugin(format!(
                "invalid plugin state file {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Write state atomically
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, state: &PluginState) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(state)
    }

    fn write(&self, state: &PluginState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Plugin(format!("failed to save plugin state: {e}")))?;
        Ok(())
    }

    /// Load, apply `change` and save under the store lock
    ///
    /// An unreadable file is left untouched.
    fn update<T>(&self, change: impl FnOnce(&mut PluginState) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.load()?;
        let out = change(&mut state);
        self.write(&state)?;
        Ok(out)
    }

    /// Persist an enabled flag
    ///
    /// # Errors
    ///
    /// Returns error if the state file is unreadable or cannot be written
    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<()> {
        self.update(|state| {
            state.enabled.insert(plugin_id.to_string(), enabled);
        })?;
        tracing::info!(plugin_id, enabled, "plugin enabled state saved");
        Ok(())
    }

    /// Persist config values, ignoring any still set to the mask placeholder
    ///
    /// Returns the keys actually saved.
    ///
    /// # Errors
    ///
    /// Returns error if the state file is unreadable or cannot be written
    pub fn save_config(
        &self,
        plugin_id: &str,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>> {
        let keys = self.update(|state| {
            let saved = state.configs.entry(plugin_id.to_string()).or_default();
            let mut keys = Vec::new();
            for (key, value) in values {
                if value.as_str() == Some(MASKED_VALUE) {
                    continue;
                }
                saved.insert(key.clone(), value.clone());
                keys.push(key.clone());
            }
            keys
        })?;
        tracing::info!(plugin_id, keys = keys.len(), "plugin config saved");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> (tempfile::TempDir, PluginStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStateStore::new(dir.path().join("usr").join("plugins_state.json"));
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, store) = store();
        assert_eq!(store.load().unwrap(), PluginState::default());
    }

    #[test]
    fn enabled_flags_round_trip() {
        let (_dir, store) = store();
        store.set_enabled("webhook", true).unwrap();
        store.set_enabled("slack", false).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.enabled_for("webhook", "webhook_channel"), Some(true));
        assert_eq!(state.enabled_for("slack", "slack_channel"), Some(false));
        assert_eq!(state.enabled_for("matrix", "matrix_channel"), None);
    }

    #[test]
    fn masked_values_are_not_saved() {
        let (_dir, store) = store();
        let first = json!({"token": "real-secret", "mode": "sync"});
        store
            .save_config("webhook", first.as_object().unwrap())
            .unwrap();

        let echo = json!({"token": MASKED_VALUE, "mode": "async"});
        let keys = store
            .save_config("webhook", echo.as_object().unwrap())
            .unwrap();
        assert_eq!(keys, vec!["mode"]);

        let state = store.load().unwrap();
        let saved = state.config_for("webhook", "webhook_channel").unwrap();
        assert_eq!(saved["token"], json!("real-secret"));
        assert_eq!(saved["mode"], json!("async"));
    }

    #[test]
    fn lookup_falls_back_to_directory_name() {
        let mut state = PluginState::default();
        state.enabled.insert("webhook_channel".to_string(), true);
        assert_eq!(state.enabled_for("webhook", "webhook_channel"), Some(true));
    }

    #[test]
    fn corrupt_file_is_an_error_and_is_not_overwritten() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("usr")).unwrap();
        std::fs::write(store.path(), "{oops").unwrap();

        assert!(matches!(store.load(), Err(Error::Plugin(_))));
        assert!(store.set_enabled("webhook", true).is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{oops");
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        store.set_enabled(&format!("p{i}"), true).unwrap();
                    } else {
                        let values = json!({"key": i});
                        store
                            .save_config(&format!("p{i}"), values.as_object().unwrap())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = store.load().unwrap();
        assert_eq!(state.enabled.len(), 16);
        assert_eq!(state.configs.len(), 16);
    }
}
