//! Shared deterministic types for the attribution and policy core.
//!
//! These types define stable contracts between components and the store. They
//! do not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
    /// Marked idle by a reaper, or an ephemeral session built while the store was unavailable.
    Stale,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Stale => "stale",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            "stale" => Ok(SessionStatus::Stale),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// One execution context: the top-level orchestrator or a delegated subagent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_label: String,
    pub is_subagent: bool,
    /// Always set when `is_subagent` is true.
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Time-ordered raw violations. Populated by `Store::get_session`.
    #[serde(default)]
    pub violation_history: Vec<ViolationRecord>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Completion state of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Ok,
    Error,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Ok => "ok",
            EventStatus::Error => "error",
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(EventStatus::Started),
            "ok" => Ok(EventStatus::Ok),
            "error" => Ok(EventStatus::Error),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

/// One tool invocation, created on start and completed at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input_summary: String,
    pub output_summary: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` while started, and for end-only events whose start was never seen.
    pub duration_ms: Option<i64>,
    pub status: EventStatus,
    pub parent_event_id: Option<String>,
    pub error_message: Option<String>,
}

impl Event {
    pub fn is_open(&self) -> bool {
        self.status == EventStatus::Started
    }
}

/// Milliseconds between two instants, clamped at zero to absorb clock skew.
pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

/// One detected anti-pattern occurrence. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub pattern_kind: String,
    pub tool_name: String,
}

/// Anti-pattern kinds the matcher can flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternKind {
    /// Same tool used too many times in a row (`consecutive-<tool>`).
    Consecutive(String),
    /// Too many exploratory calls without delegating (`direct-exploration`).
    DirectExploration,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Consecutive(tool) => write!(f, "consecutive-{tool}"),
            PatternKind::DirectExploration => f.write_str("direct-exploration"),
        }
    }
}

/// A single inbound tool invocation, validated from the host payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_args: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, tool_args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
        }
    }

    /// Shell command text for shell-like tools (`tool_args.command`).
    pub fn shell_command(&self) -> Option<&str> {
        self.tool_args.get("command").and_then(Value::as_str)
    }
}

/// Render a timestamp in the canonical storage format (RFC 3339, millisecond precision, `Z`).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_ts`] (any RFC 3339 offset is accepted).
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}
