//! Layered policy configuration.
//!
//! Three layers are consulted per key: the project document
//! (`.baton/config.toml`), the user document (`$BATON_USER_CONFIG` or
//! `~/.config/baton/config.toml`) and the built-in defaults. The first layer
//! holding a *valid* value for a key wins; an invalid value is logged and the
//! next layer is tried for that key only.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use toml::{Table, Value};
use tracing::{debug, warn};

use super::paths::write_atomic;
use crate::core::rules::{EnforcementMode, PolicyConfig};
use crate::error::BatonError;

pub const ENV_USER_CONFIG: &str = "BATON_USER_CONFIG";

const CONSECUTIVE_PREFIX: &str = "anti_patterns.consecutive_";

/// Keys every configuration document may set, besides the per-tool
/// `anti_patterns.consecutive_<tool>` family.
pub const FIXED_KEYS: &[&str] = &[
    "thresholds.exploration_calls",
    "thresholds.circuit_breaker_violations",
    "thresholds.violation_decay_seconds",
    "thresholds.rapid_sequence_window",
    "vcs.read_only_subcommands",
    "vcs.write_subcommands",
    "tools.delegation",
    "tools.exploration",
    "enforcement.mode",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLayer {
    Project,
    User,
    Default,
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigLayer::Project => "project",
            ConfigLayer::User => "user",
            ConfigLayer::Default => "default",
        })
    }
}

/// Locations of the writable layers.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project: PathBuf,
    pub user: Option<PathBuf>,
}

impl ConfigPaths {
    pub fn path_for(&self, layer: ConfigLayer) -> Option<&Path> {
        match layer {
            ConfigLayer::Project => Some(&self.project),
            ConfigLayer::User => self.user.as_deref(),
            ConfigLayer::Default => None,
        }
    }
}

/// Resolve the user config location from environment lookups.
pub fn user_config_path(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());
    if let Some(explicit) = non_empty(ENV_USER_CONFIG) {
        return Some(PathBuf::from(explicit));
    }
    non_empty("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("baton")
            .join("config.toml")
    })
}

/// Policy thresholds plus the layer each non-default key came from.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub policy: PolicyConfig,
    pub sources: BTreeMap<String, ConfigLayer>,
}

impl ResolvedConfig {
    pub fn source(&self, key: &str) -> ConfigLayer {
        self.sources
            .get(key)
            .copied()
            .unwrap_or(ConfigLayer::Default)
    }
}

/// Resolve the effective policy. Never fails: unreadable documents and
/// invalid values are logged and skipped.
pub fn load_policy_config(paths: &ConfigPaths) -> ResolvedConfig {
    let layers: Vec<(ConfigLayer, BTreeMap<String, Value>)> =
        [ConfigLayer::Project, ConfigLayer::User]
            .into_iter()
            .filter_map(|layer| {
                let path = paths.path_for(layer)?;
                read_layer(layer, path).map(|values| (layer, values))
            })
            .collect();
    resolve_layers(&layers)
}

fn resolve_layers(layers: &[(ConfigLayer, BTreeMap<String, Value>)]) -> ResolvedConfig {
    let mut resolved = ResolvedConfig::default();
    let mut keys: Vec<&String> = layers.iter().flat_map(|(_, values)| values.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        for (layer, values) in layers {
            let Some(value) = values.get(key) else {
                continue;
            };
            match apply_key(&mut resolved.policy, key, value) {
                Ok(()) => {
                    resolved.sources.insert(key.clone(), *layer);
                    break;
                }
                Err(err) => warn!(%layer, error = %err, "ignoring config value"),
            }
        }
    }
    debug!(overrides = resolved.sources.len(), "policy config resolved");
    resolved
}

fn read_layer(layer: ConfigLayer, path: &Path) -> Option<BTreeMap<String, Value>> {
    if !path.exists() {
        return None;
    }
    match read_table(path) {
        Ok(table) => Some(flatten(table)),
        Err(err) => {
            warn!(
                %layer,
                path = %path.display(),
                error = %format!("{err:#}"),
                "ignoring config document"
            );
            None
        }
    }
}

fn read_table(path: &Path) -> Result<Table> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// `[section] key = v` becomes `section.key = v`, with keys normalized.
fn flatten(table: Table) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (section, value) in table {
        match value {
            Value::Table(inner) => {
                for (name, value) in inner {
                    out.insert(normalize_key(&format!("{section}.{name}")), value);
                }
            }
            other => {
                out.insert(section, other);
            }
        }
    }
    out
}

fn consecutive_tool(key: &str) -> Option<String> {
    let tool = key.strip_prefix(CONSECUTIVE_PREFIX)?;
    let valid = !tool.is_empty()
        && tool
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| tool.to_ascii_lowercase())
}

/// Canonical spelling of a key (tool names in consecutive keys are lowercase).
pub fn normalize_key(key: &str) -> String {
    match consecutive_tool(key) {
        Some(tool) => format!("{CONSECUTIVE_PREFIX}{tool}"),
        None => key.to_string(),
    }
}

pub fn is_known_key(key: &str) -> bool {
    FIXED_KEYS.contains(&key) || consecutive_tool(key).is_some()
}

/// Validate `value` for `key` and store it in `config`.
pub fn apply_key(config: &mut PolicyConfig, key: &str, value: &Value) -> Result<(), BatonError> {
    match key {
        "thresholds.exploration_calls" => config.exploration_calls = positive_u32(key, value)?,
        "thresholds.circuit_breaker_violations" => {
            config.circuit_breaker_violations = positive_u32(key, value)?
        }
        "thresholds.violation_decay_seconds" => {
            config.violation_decay_seconds = positive_u64(key, value)?
        }
        "thresholds.rapid_sequence_window" => {
            config.rapid_sequence_window = positive_u64(key, value)?
        }
        "vcs.read_only_subcommands" => config.vcs.read_only = string_list(key, value)?,
        "vcs.write_subcommands" => config.vcs.write = string_list(key, value)?,
        "tools.delegation" => config.delegation_tools = string_list(key, value)?,
        "tools.exploration" => config.exploration_tools = string_list(key, value)?,
        "enforcement.mode" => {
            let raw = value
                .as_str()
                .ok_or_else(|| BatonError::config(key, "expected a string"))?;
            config.mode = raw
                .parse::<EnforcementMode>()
                .map_err(|reason| BatonError::config(key, reason))?;
        }
        other => {
            let tool =
                consecutive_tool(other).ok_or_else(|| BatonError::config(key, "unknown key"))?;
            let limit = positive_u32(key, value)?;
            config.consecutive_limits.insert(tool, limit);
        }
    }
    Ok(())
}

fn positive_u64(key: &str, value: &Value) -> Result<u64, BatonError> {
    match value.as_integer() {
        Some(n) if n > 0 => Ok(n as u64),
        Some(n) => Err(BatonError::config(key, format!("must be positive, got {n}"))),
        None => Err(BatonError::config(key, "expected an integer")),
    }
}

fn positive_u32(key: &str, value: &Value) -> Result<u32, BatonError> {
    let n = positive_u64(key, value)?;
    u32::try_from(n).map_err(|_| BatonError::config(key, format!("{n} is too large")))
}

fn string_list<C>(key: &str, value: &Value) -> Result<C, BatonError>
where
    C: FromIterator<String>,
{
    let items = value
        .as_array()
        .ok_or_else(|| BatonError::config(key, "expected an array of strings"))?;
    items
        .iter()
        .map(|item| match item.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(BatonError::config(key, "entries must be non-empty strings")),
        })
        .collect()
}

/// Parse a command-line value for `key` into a validated TOML value.
///
/// Lists accept either a TOML array literal or a comma-separated string.
pub fn parse_cli_value(key: &str, raw: &str) -> Result<Value, BatonError> {
    let raw = raw.trim();
    let value = match key {
        "enforcement.mode" => Value::String(raw.to_string()),
        "vcs.read_only_subcommands"
        | "vcs.write_subcommands"
        | "tools.delegation"
        | "tools.exploration" => parse_list(key, raw)?,
        _ => {
            let n = raw.parse::<i64>().map_err(|_| {
                BatonError::config(key, format!("expected an integer, got '{raw}'"))
            })?;
            Value::Integer(n)
        }
    };
    apply_key(&mut PolicyConfig::default(), key, &value)?;
    Ok(value)
}

fn parse_list(key: &str, raw: &str) -> Result<Value, BatonError> {
    if raw.starts_with('[') {
        let mut doc: Table = toml::from_str(&format!("value = {raw}"))
            .map_err(|err| BatonError::config(key, format!("invalid array: {}", err.message())))?;
        return doc
            .remove("value")
            .ok_or_else(|| BatonError::config(key, "invalid array"));
    }
    let items = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| Value::String(item.to_string()))
        .collect();
    Ok(Value::Array(items))
}

/// Write one key into the document at `path`, keeping its other keys.
pub fn set_config(path: &Path, key: &str, raw: &str) -> Result<Value> {
    if !is_known_key(key) {
        return Err(BatonError::config(key, "unknown key").into());
    }
    let key = normalize_key(key);
    let value = parse_cli_value(&key, raw)?;
    let (section, name) = key
        .split_once('.')
        .ok_or_else(|| anyhow!("config key {key} has no section"))?;

    let mut table = if path.exists() {
        read_table(path)?
    } else {
        Table::new()
    };
    let entry = table
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    let Value::Table(section_table) = entry else {
        return Err(anyhow!("{section} in {} is not a table", path.display()));
    };
    section_table.insert(name.to_string(), value.clone());

    let contents = toml::to_string_pretty(&table).context("serialize config toml")?;
    write_atomic(path, &contents)?;
    debug!(path = %path.display(), %key, "config value written");
    Ok(value)
}

/// Remove the document at `path`. Returns false if there was none.
pub fn reset_config(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    debug!(path = %path.display(), "config document removed");
    Ok(true)
}

fn string_array<'a>(items: impl IntoIterator<Item = &'a String>) -> Value {
    Value::Array(items.into_iter().map(|s| Value::String(s.clone())).collect())
}

/// Every effective key of `config` as a TOML value.
pub fn effective_values(config: &PolicyConfig) -> BTreeMap<String, Value> {
    let int = |n: u64| Value::Integer(i64::try_from(n).unwrap_or(i64::MAX));
    let mut out = BTreeMap::new();
    out.insert(
        "thresholds.exploration_calls".to_string(),
        int(config.exploration_calls.into()),
    );
    out.insert(
        "thresholds.circuit_breaker_violations".to_string(),
        int(config.circuit_breaker_violations.into()),
    );
    out.insert(
        "thresholds.violation_decay_seconds".to_string(),
        int(config.violation_decay_seconds),
    );
    out.insert(
        "thresholds.rapid_sequence_window".to_string(),
        int(config.rapid_sequence_window),
    );
    out.insert(
        "vcs.read_only_subcommands".to_string(),
        string_array(&config.vcs.read_only),
    );
    out.insert(
        "vcs.write_subcommands".to_string(),
        string_array(&config.vcs.write),
    );
    out.insert(
        "tools.delegation".to_string(),
        string_array(&config.delegation_tools),
    );
    out.insert(
        "tools.exploration".to_string(),
        string_array(&config.exploration_tools),
    );
    out.insert(
        "enforcement.mode".to_string(),
        Value::String(config.mode.to_string()),
    );
    for (tool, limit) in &config.consecutive_limits {
        out.insert(format!("{CONSECUTIVE_PREFIX}{tool}"), int((*limit).into()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(dir: &Path) -> ConfigPaths {
        ConfigPaths {
            project: dir.join("project.toml"),
            user: Some(dir.join("user.toml")),
        }
    }

    #[test]
    fn missing_documents_yield_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolved = load_policy_config(&paths_in(temp.path()));
        assert_eq!(resolved.policy, PolicyConfig::default());
        assert!(resolved.sources.is_empty());
    }

    #[test]
    fn invalid_project_value_falls_back_for_that_key_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        fs::write(
            &paths.project,
            "[thresholds]\nexploration_calls = 0\ncircuit_breaker_violations = 4\n",
        )
        .expect("write project");
        fs::write(
            paths.user.as_ref().expect("user"),
            "[thresholds]\nexploration_calls = 7\ncircuit_breaker_violations = 9\n",
        )
        .expect("write user");

        let resolved = load_policy_config(&paths);
        assert_eq!(resolved.policy.exploration_calls, 7);
        assert_eq!(resolved.source("thresholds.exploration_calls"), ConfigLayer::User);
        assert_eq!(resolved.policy.circuit_breaker_violations, 4);
        assert_eq!(
            resolved.source("thresholds.circuit_breaker_violations"),
            ConfigLayer::Project
        );
        assert_eq!(
            resolved.source("thresholds.violation_decay_seconds"),
            ConfigLayer::Default
        );
    }

    #[test]
    fn unparsable_document_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        fs::write(&paths.project, "[thresholds\nbroken").expect("write project");
        fs::write(
            paths.user.as_ref().expect("user"),
            "[enforcement]\nmode = \"guidance\"\n",
        )
        .expect("write user");
        let resolved = load_policy_config(&paths);
        assert_eq!(resolved.policy.mode, EnforcementMode::Guidance);
    }

    #[test]
    fn consecutive_keys_are_case_insensitive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        fs::write(&paths.project, "[anti_patterns]\nconsecutive_Read = 2\n").expect("write");
        let resolved = load_policy_config(&paths);
        assert_eq!(resolved.policy.consecutive_limit("READ"), Some(2));
        assert_eq!(
            resolved.source("anti_patterns.consecutive_read"),
            ConfigLayer::Project
        );
    }

    #[test]
    fn user_config_path_prefers_explicit_env() {
        let explicit = user_config_path(|name| match name {
            ENV_USER_CONFIG => Some("/tmp/custom.toml".to_string()),
            "HOME" => Some("/home/me".to_string()),
            _ => None,
        });
        assert_eq!(explicit, Some(PathBuf::from("/tmp/custom.toml")));

        let home = user_config_path(|name| (name == "HOME").then(|| "/home/me".to_string()));
        assert_eq!(
            home,
            Some(PathBuf::from("/home/me/.config/baton/config.toml"))
        );
        assert_eq!(user_config_path(|_| None), None);
    }

    #[test]
    fn set_config_preserves_other_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[thresholds]\nexploration_calls = 8\n").expect("write");

        set_config(&path, "thresholds.circuit_breaker_violations", "6").expect("set");
        set_config(&path, "tools.delegation", "Task, Agent, Dispatch").expect("set list");

        let resolved = load_policy_config(&ConfigPaths {
            project: path.clone(),
            user: None,
        });
        assert_eq!(resolved.policy.exploration_calls, 8);
        assert_eq!(resolved.policy.circuit_breaker_violations, 6);
        assert!(resolved.policy.is_delegation("dispatch"));
    }

    #[test]
    fn set_config_rejects_bad_input_without_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        assert!(set_config(&path, "thresholds.nope", "3").is_err());
        assert!(set_config(&path, "thresholds.exploration_calls", "-1").is_err());
        assert!(set_config(&path, "enforcement.mode", "lenient").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn list_values_accept_toml_arrays() {
        let value = parse_cli_value("vcs.write_subcommands", r#"["push", "commit"]"#)
            .expect("parse");
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn reset_removes_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        set_config(&path, "thresholds.exploration_calls", "3").expect("set");
        assert!(reset_config(&path).expect("reset"));
        assert!(!reset_config(&path).expect("reset again"));
    }

    #[test]
    fn effective_values_cover_every_fixed_key() {
        let values = effective_values(&PolicyConfig::default());
        for key in FIXED_KEYS {
            assert!(values.contains_key(*key), "missing {key}");
        }
        assert_eq!(
            values.get("anti_patterns.consecutive_read"),
            Some(&Value::Integer(5))
        );
    }
}
