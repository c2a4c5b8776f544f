//! Resolved policy thresholds shared by every policy-checking component.
//!
//! `io::config` layers project/user/built-in documents into one of these; the
//! matcher, violation tracker and breaker read nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::vcs::VcsRules;
use crate::core::violations::CountWindows;

/// Whether a tripped breaker blocks or only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Strict,
    Guidance,
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementMode::Strict => f.write_str("strict"),
            EnforcementMode::Guidance => f.write_str("guidance"),
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(EnforcementMode::Strict),
            "guidance" => Ok(EnforcementMode::Guidance),
            other => Err(format!("expected 'strict' or 'guidance', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Exploratory calls allowed between delegations.
    pub exploration_calls: u32,
    /// Effective count at which the breaker trips.
    pub circuit_breaker_violations: u32,
    pub violation_decay_seconds: u64,
    pub rapid_sequence_window: u64,
    /// Consecutive-call limits keyed by lowercase tool name.
    pub consecutive_limits: BTreeMap<String, u32>,
    pub vcs: VcsRules,
    /// Tools that hand work to a subagent.
    pub delegation_tools: BTreeSet<String>,
    /// Tools that count against the exploration budget.
    pub exploration_tools: BTreeSet<String>,
    pub mode: EnforcementMode,
}

pub const DEFAULT_EXPLORATION_CALLS: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_VIOLATIONS: u32 = 3;
pub const DEFAULT_VIOLATION_DECAY_SECONDS: u64 = 600;
pub const DEFAULT_RAPID_SEQUENCE_WINDOW: u64 = 10;
pub const DEFAULT_CONSECUTIVE_LIMITS: &[(&str, u32)] = &[
    ("bash", 5),
    ("edit", 5),
    ("glob", 5),
    ("grep", 5),
    ("read", 5),
    ("write", 5),
];
pub const DEFAULT_DELEGATION_TOOLS: &[&str] = &["Agent", "Task"];
pub const DEFAULT_EXPLORATION_TOOLS: &[&str] =
    &["Glob", "Grep", "LS", "Read", "WebFetch", "WebSearch"];

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exploration_calls: DEFAULT_EXPLORATION_CALLS,
            circuit_breaker_violations: DEFAULT_CIRCUIT_BREAKER_VIOLATIONS,
            violation_decay_seconds: DEFAULT_VIOLATION_DECAY_SECONDS,
            rapid_sequence_window: DEFAULT_RAPID_SEQUENCE_WINDOW,
            consecutive_limits: DEFAULT_CONSECUTIVE_LIMITS
                .iter()
                .map(|(tool, limit)| (tool.to_string(), *limit))
                .collect(),
            vcs: VcsRules::default(),
            delegation_tools: to_set(DEFAULT_DELEGATION_TOOLS),
            exploration_tools: to_set(DEFAULT_EXPLORATION_TOOLS),
            mode: EnforcementMode::Strict,
        }
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PolicyConfig {
    pub fn windows(&self) -> CountWindows {
        CountWindows::from_secs(self.violation_decay_seconds, self.rapid_sequence_window)
    }

    /// Consecutive-call limit for a tool (case-insensitive), if one is configured.
    pub fn consecutive_limit(&self, tool_name: &str) -> Option<u32> {
        self.consecutive_limits
            .get(&tool_name.to_lowercase())
            .copied()
    }

    pub fn is_delegation(&self, tool_name: &str) -> bool {
        contains_ignore_case(&self.delegation_tools, tool_name)
    }

    pub fn is_exploration(&self, tool_name: &str) -> bool {
        contains_ignore_case(&self.exploration_tools, tool_name)
    }

    /// Number of recent calls the matcher needs to see to evaluate every rule.
    pub fn history_window(&self) -> usize {
        let widest = self
            .consecutive_limits
            .values()
            .copied()
            .chain(std::iter::once(self.exploration_calls))
            .max()
            .unwrap_or(0) as usize;
        (widest * 20).max(200)
    }
}

fn contains_ignore_case(set: &BTreeSet<String>, tool_name: &str) -> bool {
    set.iter().any(|t| t.eq_ignore_ascii_case(tool_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_lookups_ignore_case() {
        let cfg = PolicyConfig::default();
        assert_eq!(cfg.consecutive_limit("Read"), Some(5));
        assert_eq!(cfg.consecutive_limit("READ"), Some(5));
        assert_eq!(cfg.consecutive_limit("TodoWrite"), None);
        assert!(cfg.is_delegation("task"));
        assert!(cfg.is_exploration("Grep"));
        assert!(!cfg.is_exploration("Bash"));
    }

    #[test]
    fn history_window_covers_widest_rule() {
        let mut cfg = PolicyConfig::default();
        assert_eq!(cfg.history_window(), 200);
        cfg.exploration_calls = 50;
        assert_eq!(cfg.history_window(), 1000);
    }

    #[test]
    fn enforcement_mode_parses() {
        assert_eq!("guidance".parse(), Ok(EnforcementMode::Guidance));
        assert!("lenient".parse::<EnforcementMode>().is_err());
    }
}
