//! Test-only helpers: a controllable clock, record builders and a matcher
//! that always fails.

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::core::context::ContextInfo;
use crate::core::matcher::{Classification, PatternMatcher};
use crate::core::rules::PolicyConfig;
use crate::core::types::{Event, EventStatus, Session, SessionStatus, ToolCall};
use crate::io::clock::Clock;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(epoch())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed reference instant used by [`FixedClock::default`].
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Active top-level session with deterministic fields.
pub fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        agent_label: "orchestrator".to_string(),
        is_subagent: false,
        parent_session_id: None,
        created_at: epoch(),
        status: SessionStatus::Active,
        violation_history: Vec::new(),
    }
}

/// Open event for `tool_name` in `session_id`, started `offset_secs` after [`epoch`].
pub fn started_event(id: &str, session_id: &str, tool_name: &str, offset_secs: i64) -> Event {
    Event {
        event_id: id.to_string(),
        session_id: session_id.to_string(),
        tool_name: tool_name.to_string(),
        input_summary: "{}".to_string(),
        output_summary: None,
        start_time: epoch() + Duration::seconds(offset_secs),
        end_time: None,
        duration_ms: None,
        status: EventStatus::Started,
        parent_event_id: None,
        error_message: None,
    }
}

/// Shell tool call running `command`.
pub fn bash(command: &str) -> ToolCall {
    ToolCall::new("Bash", serde_json::json!({ "command": command }))
}

/// Call to `tool_name` with empty arguments.
pub fn call(tool_name: &str) -> ToolCall {
    ToolCall::new(tool_name, serde_json::json!({}))
}

/// Matcher that errors, or panics when built with [`FailingMatcher::panicking`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingMatcher {
    panic: bool,
}

impl FailingMatcher {
    pub fn panicking() -> Self {
        Self { panic: true }
    }
}

impl PatternMatcher for FailingMatcher {
    fn classify(
        &self,
        _context: &ContextInfo,
        _history: &[String],
        _call: &ToolCall,
        _config: &PolicyConfig,
    ) -> Result<Classification> {
        if self.panic {
            panic!("matcher exploded");
        }
        Err(anyhow!("matcher failed"))
    }
}
