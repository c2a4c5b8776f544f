use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{Store, StoreResult};
use crate::core::types::{Event, EventStatus, Session, SessionStatus, ViolationRecord};
use crate::error::BatonError;

#[derive(Debug, Default)]
struct State {
    // Insertion order breaks ties between equal timestamps.
    sessions: BTreeMap<String, (u64, Session)>,
    events: BTreeMap<String, (u64, Event)>,
    violations: Vec<ViolationRecord>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn sorted_sessions<'a>(&'a self, filter: impl Fn(&Session) -> bool) -> Vec<Session> {
        let mut found: Vec<&'a (u64, Session)> =
            self.sessions.values().filter(|(_, s)| filter(s)).collect();
        found.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        found.into_iter().map(|(_, s)| s.clone()).collect()
    }

    fn sorted_events(&self, session_id: &str) -> Vec<Event> {
        let mut found: Vec<&(u64, Event)> = self
            .events
            .values()
            .filter(|(_, e)| e.session_id == session_id)
            .collect();
        found.sort_by(|a, b| a.1.start_time.cmp(&b.1.start_time).then(a.0.cmp(&b.0)));
        found.into_iter().map(|(_, e)| e.clone()).collect()
    }

    fn violations_since(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Vec<ViolationRecord> {
        let mut found: Vec<ViolationRecord> = self
            .violations
            .iter()
            .filter(|v| v.session_id == session_id)
            .filter(|v| since.is_none_or(|since| v.timestamp >= since))
            .cloned()
            .collect();
        // Stable sort keeps append order for equal timestamps.
        found.sort_by_key(|v| v.timestamp);
        found
    }
}

/// In-process store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BatonError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        let mut state = self.lock()?;
        if !state.sessions.contains_key(&session.id) {
            let seq = state.next_seq();
            let mut stored = session.clone();
            stored.violation_history.clear();
            state.sessions.insert(session.id.clone(), (seq, stored));
        }
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let state = self.lock()?;
        Ok(state.sessions.get(id).map(|(_, session)| {
            let mut session = session.clone();
            session.violation_history = state.violations_since(id, None);
            session
        }))
    }

    fn update_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<bool> {
        let mut state = self.lock()?;
        Ok(match state.sessions.get_mut(id) {
            Some((_, session)) => {
                session.status = status;
                true
            }
            None => false,
        })
    }

    fn link_session(&self, id: &str, parent_id: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        Ok(match state.sessions.get_mut(id) {
            Some((_, session)) => {
                session.parent_session_id = Some(parent_id.to_string());
                true
            }
            None => false,
        })
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self.lock()?.sorted_sessions(|_| true))
    }

    fn child_sessions(&self, parent_id: &str) -> StoreResult<Vec<Session>> {
        Ok(self
            .lock()?
            .sorted_sessions(|s| s.parent_session_id.as_deref() == Some(parent_id)))
    }

    fn find_active_subagent(&self, agent_label: &str) -> StoreResult<Option<Session>> {
        let found = self.lock()?.sorted_sessions(|s| {
            s.is_subagent && s.agent_label == agent_label && s.status == SessionStatus::Active
        });
        Ok(found.into_iter().last())
    }

    fn append_event(&self, event: &Event) -> StoreResult<()> {
        let mut state = self.lock()?;
        if !state.events.contains_key(&event.event_id) {
            let seq = state.next_seq();
            state
                .events
                .insert(event.event_id.clone(), (seq, event.clone()));
        }
        Ok(())
    }

    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        Ok(self.lock()?.events.get(event_id).map(|(_, e)| e.clone()))
    }

    fn update_event(&self, event: &Event) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some((_, stored)) = state.events.get_mut(&event.event_id) else {
            return Ok(false);
        };
        if stored.status != EventStatus::Started {
            return Ok(false);
        }
        stored.output_summary = event.output_summary.clone();
        stored.end_time = event.end_time;
        stored.duration_ms = event.duration_ms;
        stored.status = event.status;
        stored.error_message = event.error_message.clone();
        Ok(true)
    }

    fn recent_events(&self, session_id: &str, limit: usize) -> StoreResult<Vec<Event>> {
        let mut events = self.lock()?.sorted_events(session_id);
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    fn session_events(&self, session_id: &str) -> StoreResult<Vec<Event>> {
        Ok(self.lock()?.sorted_events(session_id))
    }

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()> {
        self.lock()?.violations.push(violation.clone());
        Ok(())
    }

    fn query_recent_violations(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ViolationRecord>> {
        Ok(self.lock()?.violations_since(session_id, Some(since)))
    }
}
