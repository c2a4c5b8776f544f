//! Anti-pattern classification for the orchestrator's direct tool use.

use anyhow::Result;

use crate::core::context::ContextInfo;
use crate::core::rules::PolicyConfig;
use crate::core::types::{PatternKind, ToolCall};
use crate::core::vcs::classify_command;

/// Outcome of classifying one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// False when the call matches an anti-pattern.
    pub allowed: bool,
    pub pattern: Option<PatternKind>,
    pub reason: String,
    /// True when the call is exempt from the breaker (delegations, read-only git).
    pub exempt: bool,
}

impl Classification {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            pattern: None,
            reason: reason.into(),
            exempt: false,
        }
    }

    fn exempt(reason: impl Into<String>) -> Self {
        Self {
            exempt: true,
            ..Self::allow(reason)
        }
    }

    fn flag(pattern: PatternKind, reason: String) -> Self {
        Self {
            allowed: false,
            pattern: Some(pattern),
            reason,
            exempt: false,
        }
    }
}

/// Classifies a call given the session's prior tool calls.
///
/// `history` holds tool names of earlier calls in the same session, oldest first.
pub trait PatternMatcher {
    fn classify(
        &self,
        context: &ContextInfo,
        history: &[String],
        call: &ToolCall,
        config: &PolicyConfig,
    ) -> Result<Classification>;
}

/// Data-driven rules from [`PolicyConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMatcher;

impl PatternMatcher for RuleMatcher {
    fn classify(
        &self,
        context: &ContextInfo,
        history: &[String],
        call: &ToolCall,
        config: &PolicyConfig,
    ) -> Result<Classification> {
        if context.is_subagent {
            return Ok(Classification::exempt("delegated work is not policed"));
        }
        if config.is_delegation(&call.tool_name) {
            return Ok(Classification::exempt("delegation"));
        }
        if let Some(command) = call.shell_command()
            && classify_command(command, &config.vcs).is_read_only()
        {
            return Ok(Classification::exempt("read-only version control"));
        }

        if let Some(limit) = config.consecutive_limit(&call.tool_name) {
            let run = trailing_run(history, &call.tool_name) + 1;
            if fires_at(run, limit) {
                return Ok(Classification::flag(
                    PatternKind::Consecutive(call.tool_name.clone()),
                    format!(
                        "{run} consecutive {} calls (limit {limit}); delegate repetitive work",
                        call.tool_name
                    ),
                ));
            }
        }

        if config.is_exploration(&call.tool_name) {
            let explored = exploration_since_delegation(history, config) + 1;
            if fires_at(explored, config.exploration_calls) {
                return Ok(Classification::flag(
                    PatternKind::DirectExploration,
                    format!(
                        "{explored} exploratory calls without delegating (limit {}); \
                         delegate exploration to a subagent",
                        config.exploration_calls
                    ),
                ));
            }
        }

        Ok(Classification::allow("no anti-pattern"))
    }
}

/// True when a run of length `count` crosses `limit`.
///
/// Fires once at `limit + 1`, then again every further `limit` calls
/// (`2*limit + 1`, ...), so a long run is neither flagged on every call nor
/// allowed to continue silently.
pub fn fires_at(count: usize, limit: u32) -> bool {
    let limit = limit as usize;
    limit > 0 && count > limit && (count - 1) % limit == 0
}

fn trailing_run(history: &[String], tool_name: &str) -> usize {
    history
        .iter()
        .rev()
        .take_while(|t| t.eq_ignore_ascii_case(tool_name))
        .count()
}

fn exploration_since_delegation(history: &[String], config: &PolicyConfig) -> usize {
    history
        .iter()
        .rev()
        .take_while(|t| !config.is_delegation(t))
        .filter(|t| config.is_exploration(t))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ContextSource;
    use serde_json::json;

    fn top() -> ContextInfo {
        ContextInfo::top_level("orchestrator")
    }

    fn read() -> ToolCall {
        ToolCall::new("Read", json!({"file_path": "src/lib.rs"}))
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn quiet_exploration() -> PolicyConfig {
        PolicyConfig {
            exploration_calls: 1_000,
            ..PolicyConfig::default()
        }
    }

    #[test]
    fn ten_reads_fire_once_at_sixth_call() {
        let cfg = quiet_exploration();
        let mut history = Vec::new();
        let mut fired_at = Vec::new();
        for call_no in 1..=10 {
            let result = RuleMatcher.classify(&top(), &history, &read(), &cfg).expect("classify");
            if let Some(pattern) = result.pattern {
                assert_eq!(pattern.to_string(), "consecutive-Read");
                fired_at.push(call_no);
            }
            history.push("Read".to_string());
        }
        assert_eq!(fired_at, vec![6]);
    }

    #[test]
    fn long_runs_refire_every_limit_calls() {
        let cfg = quiet_exploration();
        let mut history = Vec::new();
        let mut fired_at = Vec::new();
        for call_no in 1..=16 {
            let result = RuleMatcher.classify(&top(), &history, &read(), &cfg).expect("classify");
            if result.pattern.is_some() {
                fired_at.push(call_no);
            }
            history.push("Read".to_string());
        }
        assert_eq!(fired_at, vec![6, 11, 16]);
    }

    #[test]
    fn limits_match_any_spelling_and_keep_it_in_the_pattern() {
        let cfg = PolicyConfig {
            consecutive_limits: [("bash".to_string(), 2)].into_iter().collect(),
            ..quiet_exploration()
        };
        let call = ToolCall::new("BASH", json!({"command": "make"}));
        let result = RuleMatcher
            .classify(&top(), &names(&["Bash", "bash"]), &call, &cfg)
            .expect("classify");
        assert_eq!(
            result.pattern.map(|p| p.to_string()).as_deref(),
            Some("consecutive-BASH")
        );
    }

    #[test]
    fn different_tool_breaks_the_run() {
        let cfg = quiet_exploration();
        let history = names(&["Read", "Read", "Read", "Edit", "Read", "Read"]);
        let result = RuleMatcher.classify(&top(), &history, &read(), &cfg).expect("classify");
        assert!(result.allowed);
    }

    #[test]
    fn exploration_budget_counts_since_last_delegation() {
        let cfg = PolicyConfig::default();
        let grep = ToolCall::new("Grep", json!({"pattern": "fn main"}));

        let history = names(&["Read", "Glob", "Edit", "Grep", "Read", "LS"]);
        let result = RuleMatcher.classify(&top(), &history, &grep, &cfg).expect("classify");
        assert_eq!(result.pattern, Some(PatternKind::DirectExploration));

        let history = names(&["Read", "Glob", "Task", "Grep", "Read", "LS"]);
        let result = RuleMatcher.classify(&top(), &history, &grep, &cfg).expect("classify");
        assert!(result.allowed);
    }

    #[test]
    fn subagent_context_skips_every_rule() {
        let mut ctx = top();
        ctx.is_subagent = true;
        ctx.parent_session_id = Some("S1".to_string());
        ctx.source = ContextSource::SubagentMarker;
        let history = names(&["Read"; 20]);
        let result = RuleMatcher
            .classify(&ctx, &history, &read(), &PolicyConfig::default())
            .expect("classify");
        assert!(result.allowed);
        assert!(result.exempt);
    }

    #[test]
    fn read_only_git_is_always_allowed() {
        let cfg = PolicyConfig::default();
        let history = names(&["Bash"; 5]);
        let status = ToolCall::new("Bash", json!({"command": "git status"}));
        let result = RuleMatcher.classify(&top(), &history, &status, &cfg).expect("classify");
        assert!(result.allowed);
        assert!(result.exempt);

        let commit = ToolCall::new("Bash", json!({"command": "git commit -m wip"}));
        let result = RuleMatcher.classify(&top(), &history, &commit, &cfg).expect("classify");
        assert_eq!(
            result.pattern,
            Some(PatternKind::Consecutive("Bash".to_string()))
        );
    }

    #[test]
    fn delegation_is_exempt() {
        let cfg = PolicyConfig::default();
        let task = ToolCall::new("Task", json!({"prompt": "explore"}));
        let history = names(&["Task"; 10]);
        let result = RuleMatcher.classify(&top(), &history, &task, &cfg).expect("classify");
        assert!(result.exempt);
    }

    #[test]
    fn fires_at_is_zero_safe() {
        assert!(!fires_at(10, 0));
        assert!(!fires_at(5, 5));
        assert!(fires_at(6, 5));
        assert!(!fires_at(7, 5));
        assert!(fires_at(2, 1));
        assert!(fires_at(3, 1));
    }
}
