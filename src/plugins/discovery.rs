//! Plugin discovery - scan directories for `plugin.json` manifests

use std::path::{Path, PathBuf};

use super::manifest::PluginManifest;

/// Manifest file name inside each plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Scan plugin directories for manifests
///
/// Looks for `plugin.json` in immediate subdirectories of each search path,
/// in name order. Directories starting with `_` or `.` are skipped. Returns
/// `(directory, manifest)` pairs for each valid manifest.
#[must_use]
pub fn discover_plugins(dirs: &[PathBuf]) -> Vec<(PathBuf, PluginManifest)> {
    let mut results = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "plugin directory does not exist, skipping");
            continue;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(path = %dir.display(), "failed to read plugin directory");
            continue;
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        paths.sort();

        for path in paths {
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if dir_name.starts_with('_') || dir_name.starts_with('.') {
                continue;
            }

            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                tracing::warn!(path = %path.display(), "skipping plugin directory without plugin.json");
                continue;
            }

            if let Some(mut manifest) = load_manifest(&manifest_path) {
                manifest.apply_defaults(dir_name);
                tracing::debug!(
                    plugin_id = %manifest.id,
                    path = %path.display(),
                    "discovered plugin"
                );
                results.push((path, manifest));
            }
        }
    }

    results
}

/// Load and parse a single manifest file
fn load_manifest(path: &Path) -> Option<PluginManifest> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<PluginManifest>(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse plugin manifest"
            );
            None
        }
    }
}

/// Default plugin search directories
#[must_use]
pub fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(base) = directories::BaseDirs::new() {
        dirs.push(base.config_dir().join("omni").join("beacon-channels").join("plugins"));
        dirs.push(base.data_dir().join("omni").join("beacon-channels").join("plugins"));
    }

    dirs
}
