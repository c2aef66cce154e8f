//! Resolved per-plugin configuration
//!
//! Each manifest field resolves as: saved override > environment variable >
//! manifest default. Sensitive values are never printed; `Debug` and
//! `masked` both substitute the placeholder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::Serialize;

use super::manifest::PluginManifest;
use super::state::MASKED_VALUE;
use crate::{Error, Result};

/// Environment variable lookup, injectable for tests
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Process environment lookup
#[must_use]
pub fn process_env() -> EnvLookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Saved,
    Env,
    Default,
}

#[derive(Clone)]
struct ResolvedValue {
    value: serde_json::Value,
    sensitive: bool,
    source: ValueSource,
}

/// A config field as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFieldView {
    pub key: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub field_type: String,
    /// Masked when sensitive
    pub value: serde_json::Value,
    pub sensitive: bool,
    pub env: String,
    pub source: ValueSource,
}

/// Fully resolved plugin configuration
#[derive(Clone, Default)]
pub struct ResolvedConfig {
    values: BTreeMap<String, ResolvedValue>,
    views: Vec<ConfigFieldView>,
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn mask(value: &serde_json::Value, sensitive: bool) -> serde_json::Value {
    if sensitive && !is_empty_value(value) {
        serde_json::Value::String(MASKED_VALUE.to_string())
    } else {
        value.clone()
    }
}

impl ResolvedConfig {
    /// Resolve a manifest's schema against saved values and the environment
    #[must_use]
    pub fn resolve(
        manifest: &PluginManifest,
        saved: Option<&serde_json::Map<String, serde_json::Value>>,
        env: &EnvLookup,
    ) -> Self {
        let mut values = BTreeMap::new();
        let mut views = Vec::new();

        for (key, field) in &manifest.config {
            let (value, source) = if let Some(v) = saved.and_then(|s| s.get(key)) {
                (v.clone(), ValueSource::Saved)
            } else if let Some(v) = field.env.as_deref().and_then(&**env) {
                (serde_json::Value::String(v), ValueSource::Env)
            } else {
                (field.default.clone(), ValueSource::Default)
            };

            views.push(ConfigFieldView {
                key: key.clone(),
                label: field.label.clone().unwrap_or_else(|| key.clone()),
                description: field.description.clone().unwrap_or_default(),
                field_type: field.field_type.clone(),
                value: mask(&value, field.sensitive),
                sensitive: field.sensitive,
                env: field.env.clone().unwrap_or_default(),
                source,
            });
            values.insert(
                key.clone(),
                ResolvedValue {
                    value,
                    sensitive: field.sensitive,
                    source,
                },
            );
        }

        // Saved keys outside the schema still apply
        for (key, value) in saved.into_iter().flatten() {
            values.entry(key.clone()).or_insert_with(|| ResolvedValue {
                value: value.clone(),
                sensitive: false,
                source: ValueSource::Saved,
            });
        }

        Self { values, views }
    }

    /// Raw value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key).map(|v| &v.value)
    }

    #[must_use]
    pub fn source(&self, key: &str) -> Option<ValueSource> {
        self.values.get(key).map(|v| v.source)
    }

    /// String value; numbers and booleans are stringified
    #[must_use]
    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Non-empty value wrapped as a secret
    #[must_use]
    pub fn secret(&self, key: &str) -> Option<SecretString> {
        self.string(key)
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
    }

    /// Boolean value; accepts `true`/`false`, `1`/`0`, `yes`/`no`
    #[must_use]
    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Unsigned integer value
    ///
    /// # Errors
    ///
    /// Returns error if the value is present but not a non-negative integer
    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::Config(format!("{key} must be a non-negative integer"))),
            serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{key} must be a non-negative integer"))),
            _ => Err(Error::Config(format!("{key} must be a non-negative integer"))),
        }
    }

    /// Schema fields with sensitive values masked
    #[must_use]
    pub fn masked(&self) -> &[ConfigFieldView] {
        &self.views
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, v) in &self.values {
            map.entry(key, &mask(&v.value, v.sensitive));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manifest() -> PluginManifest {
        serde_json::from_value(json!({
            "id": "webhook",
            "config": {
                "auth_token": {"env": "WEBHOOK_AUTH_TOKEN", "sensitive": true, "default": ""},
                "response_mode": {"default": "sync", "env": "WEBHOOK_MODE"},
                "timeout": {"default": 30}
            }
        }))
        .unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> EnvLookup {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Arc::new(move |key: &str| map.get(key).cloned())
    }

    #[test]
    fn saved_beats_env_beats_default() {
        let saved = json!({"response_mode": "async"});
        let config = ResolvedConfig::resolve(
            &manifest(),
            saved.as_object(),
            &env(&[("WEBHOOK_AUTH_TOKEN", "tok"), ("WEBHOOK_MODE", "sync")]),
        );

        assert_eq!(config.string("response_mode").as_deref(), Some("async"));
        assert_eq!(config.source("response_mode"), Some(ValueSource::Saved));
        assert_eq!(config.string("auth_token").as_deref(), Some("tok"));
        assert_eq!(config.source("auth_token"), Some(ValueSource::Env));
        assert_eq!(config.u64("timeout").unwrap(), Some(30));
        assert_eq!(config.source("timeout"), Some(ValueSource::Default));
    }

    #[test]
    fn sensitive_values_are_masked() {
        let config = ResolvedConfig::resolve(
            &manifest(),
            None,
            &env(&[("WEBHOOK_AUTH_TOKEN", "super-secret")]),
        );

        let token = config
            .masked()
            .iter()
            .find(|f| f.key == "auth_token")
            .unwrap();
        assert_eq!(token.value, json!(MASKED_VALUE));
        assert!(!format!("{config:?}").contains("super-secret"));
        assert!(config.secret("auth_token").is_some());
    }

    #[test]
    fn empty_sensitive_value_is_not_masked() {
        let config = ResolvedConfig::resolve(&manifest(), None, &env(&[]));
        let token = config
            .masked()
            .iter()
            .find(|f| f.key == "auth_token")
            .unwrap();
        assert_eq!(token.value, json!(""));
        assert!(config.secret("auth_token").is_none());
    }

    #[test]
    fn typed_accessors() {
        let saved = json!({"timeout": "45", "flag": "yes", "bad": "abc"});
        let config = ResolvedConfig::resolve(&manifest(), saved.as_object(), &env(&[]));

        assert_eq!(config.u64("timeout").unwrap(), Some(45));
        assert_eq!(config.bool("flag"), Some(true));
        assert!(config.u64("bad").is_err());
        assert_eq!(config.u64("missing").unwrap(), None);
    }
}
