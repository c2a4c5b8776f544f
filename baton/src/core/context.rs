//! Execution context resolution: orchestrator or delegated subagent.
//!
//! Resolution order (first match wins):
//!
//! 1. `BATON_SUBAGENT_TYPE` in the inherited environment.
//! 2. `BATON_PARENT_SESSION` in the inherited environment.
//! 3. The shared "current session" marker, when its record is a subagent.
//! 4. The marker record's own parent pointer.
//! 5. A subagent session inferred from the store.
//!
//! Spawn-time variables are private to one process tree, while the shared
//! marker is visible to every process in the project, so the environment
//! always outranks the marker.

use std::collections::BTreeMap;

use crate::core::types::{Session, SessionStatus};

pub const ENV_SUBAGENT_TYPE: &str = "BATON_SUBAGENT_TYPE";
pub const ENV_PARENT_SESSION: &str = "BATON_PARENT_SESSION";
pub const ENV_PARENT_EVENT: &str = "BATON_PARENT_EVENT";
pub const ENV_AGENT_LABEL: &str = "BATON_AGENT_LABEL";

pub const DEFAULT_ORCHESTRATOR_LABEL: &str = "orchestrator";
pub const DEFAULT_SUBAGENT_LABEL: &str = "subagent";

/// The spawn-time environment contract, parsed from process variables.
///
/// Empty values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnEnv {
    pub subagent_type: Option<String>,
    pub parent_session: Option<String>,
    pub parent_event: Option<String>,
    pub agent_label: Option<String>,
}

impl SpawnEnv {
    /// Build from `(name, value)` pairs; unknown names are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut env = SpawnEnv::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                ENV_SUBAGENT_TYPE => &mut env.subagent_type,
                ENV_PARENT_SESSION => &mut env.parent_session,
                ENV_PARENT_EVENT => &mut env.parent_event,
                ENV_AGENT_LABEL => &mut env.agent_label,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        env
    }

    /// True when no contract key is present ("not a subagent").
    pub fn is_empty(&self) -> bool {
        self.subagent_type.is_none()
            && self.parent_session.is_none()
            && self.parent_event.is_none()
            && self.agent_label.is_none()
    }

    /// Variables to inject into a child process, in stable order.
    pub fn to_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        let pairs = [
            (ENV_SUBAGENT_TYPE, &self.subagent_type),
            (ENV_PARENT_SESSION, &self.parent_session),
            (ENV_PARENT_EVENT, &self.parent_event),
            (ENV_AGENT_LABEL, &self.agent_label),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                vars.insert(key, value.clone());
            }
        }
        vars
    }
}

/// Build the environment a delegating session hands to the child it spawns.
///
/// `delegation_event_id` is the id of the delegation call itself; it becomes
/// the `parent_event_id` of every event the child records.
pub fn spawn_env(
    parent_session_id: &str,
    delegation_event_id: Option<&str>,
    subagent_type: &str,
) -> SpawnEnv {
    SpawnEnv {
        subagent_type: Some(subagent_type.to_string()),
        parent_session: Some(parent_session_id.to_string()),
        parent_event: delegation_event_id.map(str::to_string),
        agent_label: Some(subagent_type.to_string()),
    }
}

/// Which check produced the resolved context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    SubagentMarker,
    ParentMarker,
    SharedMarkerSubagent,
    SharedMarkerParent,
    StoreInference,
    TopLevel,
}

impl ContextSource {
    /// True for sources that come from this process's own spawn environment.
    pub fn is_explicit(self) -> bool {
        matches!(self, ContextSource::SubagentMarker | ContextSource::ParentMarker)
    }
}

/// Resolved execution context for the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub is_subagent: bool,
    pub parent_session_id: Option<String>,
    /// Only ever taken from the spawn environment.
    pub parent_event_id: Option<String>,
    pub parent_agent_label: Option<String>,
    pub subagent_type: Option<String>,
    pub agent_label: String,
    pub source: ContextSource,
}

impl ContextInfo {
    /// Context of a top-level orchestrator with no parent.
    pub fn top_level(agent_label: impl Into<String>) -> Self {
        Self {
            is_subagent: false,
            parent_session_id: None,
            parent_event_id: None,
            parent_agent_label: None,
            subagent_type: None,
            agent_label: agent_label.into(),
            source: ContextSource::TopLevel,
        }
    }
}

/// Resolve the execution context.
///
/// `marker` is the session named by the shared "current session" marker and
/// `inferred` a best-effort subagent candidate from the store; both are
/// consulted only when the environment carries no contract keys.
pub fn resolve_context(
    env: &SpawnEnv,
    marker: Option<&Session>,
    inferred: Option<&Session>,
) -> ContextInfo {
    let marker = marker.filter(|s| s.status != SessionStatus::Closed);

    if let Some(subagent_type) = &env.subagent_type {
        // A subagent marker without a parent can only borrow the marker's
        // top-level session; it never borrows a sibling subagent.
        let parent = env.parent_session.clone().or_else(|| {
            marker
                .filter(|s| !s.is_subagent)
                .map(|s| s.id.clone())
        });
        return ContextInfo {
            is_subagent: true,
            parent_session_id: parent,
            parent_event_id: env.parent_event.clone(),
            parent_agent_label: None,
            subagent_type: Some(subagent_type.clone()),
            agent_label: env
                .agent_label
                .clone()
                .unwrap_or_else(|| subagent_type.clone()),
            source: ContextSource::SubagentMarker,
        };
    }

    if let Some(parent) = &env.parent_session {
        return ContextInfo {
            is_subagent: true,
            parent_session_id: Some(parent.clone()),
            parent_event_id: env.parent_event.clone(),
            parent_agent_label: None,
            subagent_type: None,
            agent_label: env
                .agent_label
                .clone()
                .unwrap_or_else(|| DEFAULT_SUBAGENT_LABEL.to_string()),
            source: ContextSource::ParentMarker,
        };
    }

    if let Some(record) = marker {
        if record.is_subagent {
            return inherited(record, ContextSource::SharedMarkerSubagent);
        }
        if record.parent_session_id.is_some() {
            return inherited(record, ContextSource::SharedMarkerParent);
        }
    }

    if let Some(record) = inferred.filter(|s| s.is_subagent && s.parent_session_id.is_some()) {
        return inherited(record, ContextSource::StoreInference);
    }

    ContextInfo::top_level(
        env.agent_label
            .clone()
            .unwrap_or_else(|| DEFAULT_ORCHESTRATOR_LABEL.to_string()),
    )
}

fn inherited(record: &Session, source: ContextSource) -> ContextInfo {
    ContextInfo {
        is_subagent: true,
        parent_session_id: record.parent_session_id.clone(),
        parent_event_id: None,
        parent_agent_label: None,
        subagent_type: None,
        agent_label: record.agent_label.clone(),
        source,
    }
}
