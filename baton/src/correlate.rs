//! Event correlator: pairs the start and end of each tool call and links
//! calls into a causal tree across sessions.
//!
//! Every operation is best-effort. Store failures and correlation misses are
//! logged and never surface to the host's tool call.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::ids::new_id;
use crate::core::redact::{summarize, summarize_error};
use crate::core::tree::{CallNode, build_call_tree};
use crate::core::types::{Event, EventStatus, duration_ms};
use crate::error::BatonError;
use crate::io::clock::Clock;
use crate::io::store::{Store, StoreResult};

/// Start of a tool call.
#[derive(Debug, Clone, Copy)]
pub struct EventStart<'r> {
    pub session_id: &'r str,
    pub tool_name: &'r str,
    pub input: &'r Value,
    /// Delegation event that spawned this session, from the spawn environment.
    pub parent_event_id: Option<&'r str>,
    /// Host-supplied tool-use id; allocated when absent.
    pub event_id: Option<&'r str>,
}

/// End of a tool call. Session, tool and parent are used only when no start
/// was recorded.
#[derive(Debug, Clone, Copy)]
pub struct EventEnd<'r> {
    pub event_id: &'r str,
    pub session_id: &'r str,
    pub tool_name: &'r str,
    pub parent_event_id: Option<&'r str>,
    pub output: Option<&'r Value>,
    pub status: EventStatus,
    pub error: Option<&'r str>,
}

pub struct EventCorrelator<'a, S: ?Sized, C: ?Sized> {
    store: &'a S,
    clock: &'a C,
}

impl<'a, S, C> EventCorrelator<'a, S, C>
where
    S: Store + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a C) -> Self {
        Self { store, clock }
    }

    /// Persist a `started` event and return its id.
    #[instrument(skip_all, fields(session_id = start.session_id, tool = start.tool_name))]
    pub fn record_start(&self, start: &EventStart<'_>) -> String {
        let event_id = event_id_or_new(start.event_id);
        let event = Event {
            parent_event_id: self.verified_parent(start.parent_event_id, &event_id),
            event_id,
            session_id: start.session_id.to_string(),
            tool_name: start.tool_name.to_string(),
            input_summary: summarize(start.input),
            output_summary: None,
            start_time: self.clock.now(),
            end_time: None,
            duration_ms: None,
            status: EventStatus::Started,
            error_message: None,
        };
        self.append(&event);
        event.event_id
    }

    /// Persist a call refused by policy as an already-completed error event.
    pub fn record_blocked(&self, start: &EventStart<'_>, message: &str) -> String {
        let now = self.clock.now();
        let event_id = event_id_or_new(start.event_id);
        let event = Event {
            parent_event_id: self.verified_parent(start.parent_event_id, &event_id),
            event_id,
            session_id: start.session_id.to_string(),
            tool_name: start.tool_name.to_string(),
            input_summary: summarize(start.input),
            output_summary: None,
            start_time: now,
            end_time: Some(now),
            duration_ms: Some(0),
            status: EventStatus::Error,
            error_message: Some(summarize_error(&format!("blocked by policy: {message}"))),
        };
        self.append(&event);
        event.event_id
    }

    /// Complete an event. Returns true if this call recorded the completion.
    ///
    /// Without a matching start an end-only event is stored with no duration.
    /// Completing an event twice is a no-op returning false.
    #[instrument(skip_all, fields(event_id = end.event_id, tool = end.tool_name))]
    pub fn record_end(&self, end: &EventEnd<'_>) -> bool {
        match self.try_record_end(end) {
            Ok(recorded) => recorded,
            Err(err) => {
                warn!(error = %err, "event end not recorded");
                false
            }
        }
    }

    fn try_record_end(&self, end: &EventEnd<'_>) -> StoreResult<bool> {
        let now = self.clock.now();
        let status = match end.status {
            EventStatus::Started => EventStatus::Ok,
            other => other,
        };
        let output_summary = end.output.map(summarize);
        let error_message = end.error.map(summarize_error);

        match self.store.get_event(end.event_id)? {
            Some(started) if started.is_open() => {
                let completed = Event {
                    output_summary,
                    end_time: Some(now),
                    duration_ms: Some(duration_ms(started.start_time, now)),
                    status,
                    error_message,
                    ..started
                };
                self.store.update_event(&completed)
            }
            Some(_) => {
                debug!("event already completed");
                Ok(false)
            }
            None => {
                let miss = BatonError::CorrelationMiss(format!("no start for {}", end.event_id));
                warn!(error = %miss, "recording end-only event");
                let event = Event {
                    event_id: end.event_id.to_string(),
                    session_id: end.session_id.to_string(),
                    tool_name: end.tool_name.to_string(),
                    input_summary: String::new(),
                    output_summary,
                    start_time: now,
                    end_time: Some(now),
                    duration_ms: None,
                    status,
                    parent_event_id: self.verified_parent(end.parent_event_id, end.event_id),
                    error_message,
                };
                self.store.append_event(&event)?;
                Ok(true)
            }
        }
    }

    /// Causal tree of a session and every session descending from it.
    pub fn call_tree(&self, session_id: &str) -> StoreResult<Vec<CallNode>> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([session_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            events.extend(self.store.session_events(&id)?);
            for child in self.store.child_sessions(&id)? {
                queue.push_back(child.id);
            }
        }
        debug!(sessions = seen.len(), events = events.len(), "assembled call tree");
        Ok(build_call_tree(&events))
    }

    /// Keep `parent` only if it names a stored event other than `event_id`.
    fn verified_parent(&self, parent: Option<&str>, event_id: &str) -> Option<String> {
        let parent = parent.filter(|p| !p.is_empty())?;
        if parent == event_id {
            warn!(parent, "event cannot be its own parent");
            return None;
        }
        match self.store.get_event(parent) {
            Ok(Some(_)) => Some(parent.to_string()),
            Ok(None) => {
                let miss = BatonError::CorrelationMiss(format!("unknown parent event {parent}"));
                warn!(error = %miss, "dropping parent link");
                None
            }
            Err(err) => {
                warn!(error = %err, "parent event lookup failed");
                None
            }
        }
    }

    fn append(&self, event: &Event) {
        if let Err(err) = self.store.append_event(event) {
            warn!(error = %err, event_id = %event.event_id, "event not recorded");
        }
    }
}

fn event_id_or_new(host_id: Option<&str>) -> String {
    host_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_id)
}
