//! Plugin manifest format (`plugin.json`)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Plugin manifest describing a channel plugin and its configuration schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier; falls back to the directory name
    #[serde(default)]
    pub id: String,
    /// Human-readable name; falls back to the id
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Enabled unless overridden by saved state
    #[serde(default)]
    pub enabled: bool,
    /// Registered adapter factory to build from; defaults to the id
    #[serde(default)]
    pub adapter: Option<String>,
    /// Configuration schema, key → field
    #[serde(default)]
    pub config: BTreeMap<String, ConfigField>,
}

impl PluginManifest {
    /// Fill in id and name from the plugin directory name when absent
    pub fn apply_defaults(&mut self, dir_name: &str) {
        if self.id.trim().is_empty() {
            self.id = dir_name.to_string();
        }
        if self.name.trim().is_empty() {
            self.name.clone_from(&self.id);
        }
    }

    /// Factory name used to build this plugin's adapters
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.id)
    }
}

/// A single configuration field
///
/// Accepts either a schema object or a bare value (treated as the default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawConfigField")]
pub struct ConfigField {
    pub default: serde_json::Value,
    /// Environment variable the value is sourced from
    pub env: Option<String>,
    /// Masked when echoed back
    pub sensitive: bool,
    #[serde(rename = "type")]
    pub field_type: String,
    pub label: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawConfigField {
    Schema {
        #[serde(default)]
        default: serde_json::Value,
        #[serde(default)]
        env: Option<String>,
        #[serde(default)]
        sensitive: bool,
        #[serde(default, rename = "type")]
        field_type: Option<String>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Value(serde_json::Value),
}

impl From<RawConfigField> for ConfigField {
    fn from(raw: RawConfigField) -> Self {
        match raw {
            RawConfigField::Schema {
                default,
                env,
                sensitive,
                field_type,
                label,
                description,
            } => Self {
                default,
                env: env.filter(|e| !e.is_empty()),
                sensitive,
                field_type: field_type.unwrap_or_else(|| "text".to_string()),
                label,
                description,
            },
            RawConfigField::Value(default) => Self {
                default,
                field_type: "text".to_string(),
                ..Self::default()
            },
        }
    }
}
