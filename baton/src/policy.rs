//! Policy engine: classification, violation bookkeeping and the circuit
//! breaker, combined into one allow/warn/block decision per call.
//!
//! The engine fails open. Any error or panic while classifying or counting
//! resolves to `allow`, because a broken policy must never stop the agent.

use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::breaker::{BreakerState, block_message, breaker_state, warn_message};
use crate::core::context::ContextInfo;
use crate::core::matcher::PatternMatcher;
use crate::core::rules::{EnforcementMode, PolicyConfig};
use crate::core::types::{PatternKind, ToolCall, ViolationRecord};
use crate::core::violations::effective_count;
use crate::error::BatonError;
use crate::io::clock::Clock;
use crate::io::store::{Store, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub state: BreakerState,
    pub effective_count: usize,
    pub pattern_kind: Option<String>,
    pub message: Option<String>,
}

impl Decision {
    fn allow_silently(state: BreakerState, effective_count: usize) -> Self {
        Self {
            allow: true,
            state,
            effective_count,
            pattern_kind: None,
            message: None,
        }
    }
}

pub struct PolicyEngine<'a, S: ?Sized, C: ?Sized, M: ?Sized> {
    store: &'a S,
    clock: &'a C,
    matcher: &'a M,
    config: &'a PolicyConfig,
}

impl<'a, S, C, M> PolicyEngine<'a, S, C, M>
where
    S: Store + ?Sized,
    C: Clock + ?Sized,
    M: PatternMatcher + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a C, matcher: &'a M, config: &'a PolicyConfig) -> Self {
        Self {
            store,
            clock,
            matcher,
            config,
        }
    }

    /// Decide whether `call` may run in `session_id`.
    #[instrument(skip_all, fields(session_id = %session_id, tool = %call.tool_name))]
    pub fn check(&self, context: &ContextInfo, session_id: &str, call: &ToolCall) -> Decision {
        if context.is_subagent {
            return Decision::allow_silently(BreakerState::Normal, 0);
        }
        match catch_unwind(AssertUnwindSafe(|| self.evaluate(context, session_id, call))) {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                let err = BatonError::PolicyInternal(format!("{err:#}"));
                warn!(error = %err, "policy check failed; allowing");
                Decision::allow_silently(BreakerState::Normal, 0)
            }
            Err(_) => {
                error!("policy check panicked; allowing");
                Decision::allow_silently(BreakerState::Normal, 0)
            }
        }
    }

    fn evaluate(
        &self,
        context: &ContextInfo,
        session_id: &str,
        call: &ToolCall,
    ) -> Result<Decision> {
        let history = self.history(session_id)?;
        let classification = self
            .matcher
            .classify(context, &history, call, self.config)?;
        let now = self.clock.now();
        if let Some(pattern) = &classification.pattern {
            self.record_violation(session_id, pattern, &call.tool_name, now)?;
        }

        let count = self.effective_count_at(session_id, now)?;
        let threshold = self.config.circuit_breaker_violations;
        let state = breaker_state(count, threshold);
        let pattern_kind = classification.pattern.as_ref().map(ToString::to_string);
        debug!(%state, count, pattern = ?pattern_kind, "policy evaluated");

        if state == BreakerState::Tripped && !classification.exempt {
            let message = block_message(&call.tool_name, count, threshold);
            let allow = self.config.mode == EnforcementMode::Guidance;
            if !allow {
                info!(count, threshold, "blocking call");
            }
            return Ok(Decision {
                allow,
                state,
                effective_count: count,
                pattern_kind,
                message: Some(message),
            });
        }

        let message = match (&classification.pattern, state) {
            (Some(_), _) => Some(warn_message(Some(&classification.reason), count, threshold)),
            (None, BreakerState::Warned | BreakerState::Tripped) => {
                Some(warn_message(None, count, threshold))
            }
            (None, BreakerState::Normal) => None,
        };
        Ok(Decision {
            allow: true,
            state,
            effective_count: count,
            pattern_kind,
            message,
        })
    }

    /// Tool names of the session's recent calls, oldest first.
    fn history(&self, session_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .store
            .recent_events(session_id, self.config.history_window())?
            .into_iter()
            .map(|event| event.tool_name)
            .collect())
    }

    /// Append one violation. Never modifies earlier records.
    pub fn record_violation(
        &self,
        session_id: &str,
        pattern: &PatternKind,
        tool_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        info!(session_id, %pattern, tool_name, "violation recorded");
        self.store.append_violation(&ViolationRecord {
            session_id: session_id.to_string(),
            timestamp: at,
            pattern_kind: pattern.to_string(),
            tool_name: tool_name.to_string(),
        })
    }

    /// Effective violation count of a session right now.
    pub fn effective_count(&self, session_id: &str) -> StoreResult<usize> {
        self.effective_count_at(session_id, self.clock.now())
    }

    /// Breaker state and effective count of a session right now.
    pub fn status(&self, session_id: &str) -> StoreResult<(BreakerState, usize)> {
        let count = self.effective_count(session_id)?;
        Ok((
            breaker_state(count, self.config.circuit_breaker_violations),
            count,
        ))
    }

    fn effective_count_at(&self, session_id: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let windows = self.config.windows();
        let since = now
            .checked_sub_signed(windows.decay)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let records = self.store.query_recent_violations(session_id, since)?;
        Ok(effective_count(&records, now, windows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::core::context::{ContextInfo, resolve_context, spawn_env};
    use crate::core::matcher::RuleMatcher;
    use crate::core::types::EventStatus;
    use crate::io::store::{MemoryStore, UnavailableStore};
    use crate::test_support::{FailingMatcher, FixedClock, bash, call, started_event};

    fn orchestrator() -> ContextInfo {
        ContextInfo::top_level("orchestrator")
    }

    fn seed_violations(store: &MemoryStore, clock: &FixedClock, count: usize) {
        for _ in 0..count {
            store
                .append_violation(&ViolationRecord {
                    session_id: "S1".to_string(),
                    timestamp: clock.now(),
                    pattern_kind: "consecutive-Bash".to_string(),
                    tool_name: "Bash".to_string(),
                })
                .expect("append");
            clock.advance(Duration::seconds(30));
        }
    }

    /// Records `tool` as a completed call so it shows up in history.
    fn observe(store: &MemoryStore, id: &str, tool: &str) {
        let mut event = started_event(id, "S1", tool, 0);
        event.status = EventStatus::Ok;
        store.append_event(&event).expect("append");
    }

    #[test]
    fn warned_then_tripped_at_threshold() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig {
            circuit_breaker_violations: 5,
            consecutive_limits: [("bash".to_string(), 1)].into_iter().collect(),
            ..PolicyConfig::default()
        };
        seed_violations(&store, &clock, 4);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);

        let decision = engine.check(&orchestrator(), "S1", &call("Write"));
        assert!(decision.allow);
        assert_eq!(decision.state, BreakerState::Warned);
        assert_eq!(decision.effective_count, 4);

        // Two Bash calls in a row exceed the limit of one and record the fifth violation.
        observe(&store, "E1", "Bash");
        let decision = engine.check(&orchestrator(), "S1", &bash("cargo build"));
        assert!(!decision.allow);
        assert_eq!(decision.state, BreakerState::Tripped);
        assert_eq!(decision.effective_count, 5);
        assert_eq!(decision.pattern_kind.as_deref(), Some("consecutive-Bash"));
        let message = decision.message.expect("message");
        assert!(message.contains("Bash"));
        assert!(message.contains("5/5"));
        assert!(message.contains("baton set-config thresholds.circuit_breaker_violations"));
    }

    #[test]
    fn tripped_breaker_still_allows_delegation_and_read_only_git() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        seed_violations(&store, &clock, 3);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);

        assert!(!engine.check(&orchestrator(), "S1", &call("Write")).allow);
        assert!(engine.check(&orchestrator(), "S1", &call("Task")).allow);
        assert!(engine.check(&orchestrator(), "S1", &bash("git status")).allow);
        assert!(!engine.check(&orchestrator(), "S1", &bash("git push")).allow);
    }

    #[test]
    fn tripped_breaker_blocks_git_with_side_effects() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        seed_violations(&store, &clock, 3);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);

        for cmd in [
            "git log $(cargo publish)",
            "git show HEAD:Cargo.toml > Cargo.toml",
            "git diff --output=patch.diff",
        ] {
            let decision = engine.check(&orchestrator(), "S1", &bash(cmd));
            assert!(!decision.allow, "{cmd}");
            assert_eq!(decision.state, BreakerState::Tripped);
        }
        assert!(engine.check(&orchestrator(), "S1", &bash("git log -3")).allow);
    }

    #[test]
    fn breaker_recovers_as_violations_decay() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        seed_violations(&store, &clock, 3);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);
        assert_eq!(engine.status("S1").expect("status").0, BreakerState::Tripped);

        clock.advance(Duration::seconds(config.violation_decay_seconds as i64));
        let (state, count) = engine.status("S1").expect("status");
        assert_eq!(state, BreakerState::Normal);
        assert_eq!(count, 0);
        assert!(engine.check(&orchestrator(), "S1", &call("Write")).allow);
    }

    #[test]
    fn guidance_mode_reports_but_never_blocks() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig {
            mode: EnforcementMode::Guidance,
            ..PolicyConfig::default()
        };
        seed_violations(&store, &clock, 3);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);
        let decision = engine.check(&orchestrator(), "S1", &call("Write"));
        assert!(decision.allow);
        assert_eq!(decision.state, BreakerState::Tripped);
        assert!(decision.message.is_some());
    }

    #[test]
    fn subagents_bypass_policy() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        seed_violations(&store, &clock, 10);
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);
        let ctx = resolve_context(&spawn_env("S0", None, "gemini"), None, None);
        assert!(engine.check(&ctx, "S1", &call("Write")).allow);
    }

    #[test]
    fn matcher_errors_and_panics_fail_open() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        seed_violations(&store, &clock, 10);

        let failing = FailingMatcher::default();
        let engine = PolicyEngine::new(&store, &clock, &failing, &config);
        assert!(engine.check(&orchestrator(), "S1", &call("Write")).allow);

        let panicking = FailingMatcher::panicking();
        let engine = PolicyEngine::new(&store, &clock, &panicking, &config);
        assert!(engine.check(&orchestrator(), "S1", &call("Write")).allow);
    }

    #[test]
    fn store_failure_fails_open() {
        let store = UnavailableStore::new("locked");
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);
        assert!(engine.check(&orchestrator(), "S1", &call("Write")).allow);
    }

    #[test]
    fn ten_reads_record_exactly_one_violation() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig {
            exploration_calls: 100,
            ..PolicyConfig::default()
        };
        let engine = PolicyEngine::new(&store, &clock, &RuleMatcher, &config);
        for i in 0..10 {
            engine.check(&orchestrator(), "S1", &call("Read"));
            observe(&store, &format!("R{i}"), "Read");
            clock.advance(Duration::seconds(1));
        }
        let records = store
            .query_recent_violations("S1", DateTime::<Utc>::MIN_UTC)
            .expect("query");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pattern_kind, "consecutive-Read");
    }
}
