//! Inbound hook pipeline: host payload → context → session → policy → events.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::breaker::BreakerState;
use crate::core::context::{ContextInfo, SpawnEnv};
use crate::core::ids::new_id;
use crate::core::matcher::PatternMatcher;
use crate::core::rules::PolicyConfig;
use crate::core::types::{EventStatus, ToolCall};
use crate::correlate::{EventCorrelator, EventEnd, EventStart};
use crate::io::clock::Clock;
use crate::io::store::Store;
use crate::policy::{Decision, PolicyEngine};
use crate::session::SessionRegistry;

/// Hook payload as delivered by the host on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct HookPayload {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    /// Host-side conversation id. Informational only.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
}

impl HookPayload {
    /// Parse and validate raw stdin.
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: HookPayload = serde_json::from_str(raw).context("parse hook payload")?;
        if payload.tool_name.trim().is_empty() {
            bail!("hook payload has an empty tool_name");
        }
        if !(payload.tool_input.is_object() || payload.tool_input.is_null()) {
            bail!("hook payload tool_input must be an object");
        }
        Ok(payload)
    }

    pub fn tool_call(&self) -> ToolCall {
        ToolCall::new(self.tool_name.trim(), self.tool_input.clone())
    }

    fn tool_use_id(&self) -> Option<&str> {
        self.tool_use_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Completion status derived from `tool_response`.
    pub fn outcome(&self) -> (EventStatus, Option<String>) {
        let Some(response) = &self.tool_response else {
            return (EventStatus::Ok, None);
        };
        let flagged = response.get("is_error").and_then(Value::as_bool) == Some(true)
            || response.get("success").and_then(Value::as_bool) == Some(false);
        let message = response
            .get("error")
            .and_then(|err| match err {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|text| !text.is_empty());
        if flagged || message.is_some() {
            (EventStatus::Error, message)
        } else {
            (EventStatus::Ok, None)
        }
    }
}

/// Collaborators shared by both hook phases.
pub struct HookRuntime<'a, S: ?Sized, C: ?Sized, M: ?Sized> {
    pub store: &'a S,
    pub clock: &'a C,
    pub matcher: &'a M,
    pub config: &'a PolicyConfig,
    pub env: &'a SpawnEnv,
    pub marker_path: Option<&'a Path>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreToolOutcome {
    pub session_id: String,
    pub event_id: String,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostToolOutcome {
    pub session_id: String,
    pub event_id: String,
    pub status: EventStatus,
    /// False when the event was already complete or could not be stored.
    pub recorded: bool,
}

impl<'a, S, C, M> HookRuntime<'a, S, C, M>
where
    S: Store + ?Sized,
    C: Clock + ?Sized,
    M: PatternMatcher + ?Sized,
{
    fn registry(&self) -> SessionRegistry<'a, S, C> {
        let registry = SessionRegistry::new(self.store, self.clock);
        match self.marker_path {
            Some(path) => registry.with_marker(path),
            None => registry,
        }
    }

    fn resolve(&self) -> (ContextInfo, String) {
        let registry = self.registry();
        let context = registry.extract_context(self.env);
        let session = registry.get_or_create(&context);
        (context, session.id)
    }

    /// Policy check, then record the call's start (or its refusal).
    #[instrument(skip_all, fields(tool = %payload.tool_name))]
    pub fn pre_tool(&self, payload: &HookPayload) -> PreToolOutcome {
        let (context, session_id) = self.resolve();
        let call = payload.tool_call();
        let decision = PolicyEngine::new(self.store, self.clock, self.matcher, self.config)
            .check(&context, &session_id, &call);

        let correlator = EventCorrelator::new(self.store, self.clock);
        let start = EventStart {
            session_id: &session_id,
            tool_name: &call.tool_name,
            input: &call.tool_args,
            parent_event_id: context.parent_event_id.as_deref(),
            event_id: payload.tool_use_id(),
        };
        let event_id = if decision.allow {
            correlator.record_start(&start)
        } else {
            let message = decision
                .message
                .as_deref()
                .unwrap_or("circuit breaker tripped");
            correlator.record_blocked(&start, message)
        };
        debug!(%session_id, %event_id, allow = decision.allow, "pre-tool handled");
        PreToolOutcome {
            session_id,
            event_id,
            decision,
        }
    }

    /// Record the call's completion.
    #[instrument(skip_all, fields(tool = %payload.tool_name))]
    pub fn post_tool(&self, payload: &HookPayload) -> PostToolOutcome {
        let (context, session_id) = self.resolve();
        let (status, error) = payload.outcome();
        // Without a host id there is nothing to correlate with.
        let event_id = payload
            .tool_use_id()
            .map(str::to_string)
            .unwrap_or_else(new_id);
        let recorded = EventCorrelator::new(self.store, self.clock).record_end(&EventEnd {
            event_id: &event_id,
            session_id: &session_id,
            tool_name: payload.tool_name.trim(),
            parent_event_id: context.parent_event_id.as_deref(),
            output: payload.tool_response.as_ref(),
            status,
            error: error.as_deref(),
        });
        PostToolOutcome {
            session_id,
            event_id,
            status,
            recorded,
        }
    }
}

/// Decision used when the hook cannot run at all (unreadable payload).
pub fn fail_open_decision() -> Decision {
    Decision {
        allow: true,
        state: BreakerState::Normal,
        effective_count: 0,
        pattern_kind: None,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::spawn_env;
    use crate::core::matcher::RuleMatcher;
    use crate::io::store::MemoryStore;
    use crate::test_support::FixedClock;
    use chrono::Duration;
    use serde_json::json;

    fn payload(value: Value) -> HookPayload {
        HookPayload::parse(&value.to_string()).expect("payload")
    }

    #[test]
    fn parse_rejects_missing_tool_name() {
        assert!(HookPayload::parse(r#"{"tool_input": {}}"#).is_err());
        assert!(HookPayload::parse(r#"{"tool_name": " "}"#).is_err());
        assert!(HookPayload::parse(r#"{"tool_name": "Bash", "tool_input": 3}"#).is_err());
        assert!(HookPayload::parse("not json").is_err());
    }

    #[test]
    fn outcome_reads_error_markers() {
        let ok = payload(json!({"tool_name": "Bash", "tool_response": {"stdout": "hi"}}));
        assert_eq!(ok.outcome(), (EventStatus::Ok, None));

        let failed = payload(json!({
            "tool_name": "Bash",
            "tool_response": {"is_error": true, "error": "exit 1"}
        }));
        assert_eq!(
            failed.outcome(),
            (EventStatus::Error, Some("exit 1".to_string()))
        );
    }

    #[test]
    fn pre_then_post_correlates_by_tool_use_id() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        let env = SpawnEnv::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("current_session.json");
        let runtime = HookRuntime {
            store: &store,
            clock: &clock,
            matcher: &RuleMatcher,
            config: &config,
            env: &env,
            marker_path: Some(&marker),
        };

        let pre = runtime.pre_tool(&payload(json!({
            "tool_name": "Bash",
            "tool_input": {"command": "ls"},
            "tool_use_id": "toolu_01"
        })));
        assert!(pre.decision.allow);
        assert_eq!(pre.event_id, "toolu_01");

        clock.advance(Duration::milliseconds(40));
        let post = runtime.post_tool(&payload(json!({
            "tool_name": "Bash",
            "tool_response": {"stdout": "a\nb"},
            "tool_use_id": "toolu_01"
        })));
        assert!(post.recorded);
        assert_eq!(post.session_id, pre.session_id);
        let event = store.get_event("toolu_01").expect("get").expect("some");
        assert_eq!(event.duration_ms, Some(40));
    }

    #[test]
    fn subagent_calls_link_to_delegation_event() {
        let store = MemoryStore::new();
        let clock = FixedClock::default();
        let config = PolicyConfig::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("current_session.json");
        let top_env = SpawnEnv::default();
        let orchestrator = HookRuntime {
            store: &store,
            clock: &clock,
            matcher: &RuleMatcher,
            config: &config,
            env: &top_env,
            marker_path: Some(&marker),
        };
        let delegation = orchestrator.pre_tool(&payload(json!({
            "tool_name": "Task",
            "tool_input": {"prompt": "dig"},
            "tool_use_id": "D1"
        })));

        let child_env = spawn_env(&delegation.session_id, Some("D1"), "gemini");
        let subagent = HookRuntime {
            env: &child_env,
            ..orchestrator
        };
        let child = subagent.pre_tool(&payload(json!({
            "tool_name": "Read",
            "tool_input": {"file_path": "src/lib.rs"},
            "tool_use_id": "C1"
        })));
        assert_ne!(child.session_id, delegation.session_id);
        let event = store.get_event("C1").expect("get").expect("some");
        assert_eq!(event.parent_event_id.as_deref(), Some("D1"));
    }
}
