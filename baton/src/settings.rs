//! Config control surface behind `show-config`, `set-config` and `reset-config`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use toml::Value;
use tracing::info;

use crate::io::config::{
    ConfigLayer, ConfigPaths, effective_values, load_policy_config, normalize_key, reset_config,
    set_config,
};

/// One effective key with the layer it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub source: ConfigLayer,
}

/// Every effective key, sorted, with its source layer.
pub fn show_config(paths: &ConfigPaths) -> Vec<ConfigEntry> {
    let resolved = load_policy_config(paths);
    effective_values(&resolved.policy)
        .into_iter()
        .map(|(key, value)| ConfigEntry {
            source: resolved.source(&key),
            value: render_value(&value),
            key,
        })
        .collect()
}

pub fn render_entries(entries: &[ConfigEntry]) -> String {
    let width = entries.iter().map(|e| e.key.len()).max().unwrap_or(0);
    entries
        .iter()
        .map(|e| format!("{:width$} = {}  # {}\n", e.key, e.value, e.source))
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

/// Set `key` in the project layer, or the user layer when `user` is true.
pub fn set_value(paths: &ConfigPaths, key: &str, raw: &str, user: bool) -> Result<ConfigEntry> {
    let layer = target_layer(user);
    let path = layer_path(paths, layer)?;
    let value = set_config(path, key, raw)?;
    info!(%layer, key, "config updated");
    Ok(ConfigEntry {
        key: normalize_key(key),
        value: render_value(&value),
        source: layer,
    })
}

/// Drop every override in one layer. Returns false if it held none.
pub fn reset_layer(paths: &ConfigPaths, user: bool) -> Result<bool> {
    let layer = target_layer(user);
    let path = layer_path(paths, layer)?;
    let removed = reset_config(path)?;
    info!(%layer, removed, "config reset");
    Ok(removed)
}

fn target_layer(user: bool) -> ConfigLayer {
    if user {
        ConfigLayer::User
    } else {
        ConfigLayer::Project
    }
}

fn layer_path(paths: &ConfigPaths, layer: ConfigLayer) -> Result<&Path> {
    paths
        .path_for(layer)
        .with_context(|| format!("no {layer} config location (set HOME or BATON_USER_CONFIG)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &Path) -> ConfigPaths {
        ConfigPaths {
            project: dir.join("project").join("config.toml"),
            user: Some(dir.join("user").join("config.toml")),
        }
    }

    #[test]
    fn show_reports_sources_per_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        set_value(&paths, "thresholds.exploration_calls", "9", true).expect("set user");
        set_value(&paths, "enforcement.mode", "guidance", false).expect("set project");

        let entries = show_config(&paths);
        let find = |key: &str| {
            entries
                .iter()
                .find(|e| e.key == key)
                .cloned()
                .expect("entry")
        };
        assert_eq!(find("thresholds.exploration_calls").value, "9");
        assert_eq!(find("thresholds.exploration_calls").source, ConfigLayer::User);
        assert_eq!(find("enforcement.mode").value, "\"guidance\"");
        assert_eq!(find("enforcement.mode").source, ConfigLayer::Project);
        assert_eq!(
            find("thresholds.circuit_breaker_violations").source,
            ConfigLayer::Default
        );
    }

    #[test]
    fn reset_restores_lower_layer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        set_value(&paths, "thresholds.circuit_breaker_violations", "7", false).expect("set");
        assert!(reset_layer(&paths, false).expect("reset"));
        let entries = show_config(&paths);
        let entry = entries
            .iter()
            .find(|e| e.key == "thresholds.circuit_breaker_violations")
            .expect("entry");
        assert_eq!(entry.value, "3");
        assert_eq!(entry.source, ConfigLayer::Default);
    }

    #[test]
    fn user_layer_requires_a_location() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ConfigPaths {
            project: temp.path().join("config.toml"),
            user: None,
        };
        assert!(set_value(&paths, "thresholds.exploration_calls", "2", true).is_err());
    }

    #[test]
    fn render_aligns_keys() {
        let rendered = render_entries(&[
            ConfigEntry {
                key: "a.b".to_string(),
                value: "1".to_string(),
                source: ConfigLayer::Default,
            },
            ConfigEntry {
                key: "a.long".to_string(),
                value: "2".to_string(),
                source: ConfigLayer::User,
            },
        ]);
        assert_eq!(rendered, "a.b    = 1  # default\na.long = 2  # user\n");
    }
}
