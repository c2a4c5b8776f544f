//! Persistence collaborator interface.
//!
//! The engine needs only minimal CRUD over sessions, events and violations.
//! [`SqliteStore`] is the shared, multi-process implementation; [`MemoryStore`]
//! backs tests and embedders that bring their own persistence.

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::types::{Event, Session, SessionStatus, ViolationRecord};
use crate::error::BatonError;

pub type StoreResult<T> = Result<T, BatonError>;

pub trait Store {
    /// Insert a session. Inserting an existing id is a no-op.
    fn create_session(&self, session: &Session) -> StoreResult<()>;

    /// Fetch a session with its violation history (oldest first).
    fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Returns false if the session does not exist.
    fn update_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<bool>;

    /// Point `id` at a new parent. Returns false if the session does not exist.
    fn link_session(&self, id: &str, parent_id: &str) -> StoreResult<bool>;

    /// All sessions, oldest first.
    fn list_sessions(&self) -> StoreResult<Vec<Session>>;

    /// Direct children of a session, oldest first.
    fn child_sessions(&self, parent_id: &str) -> StoreResult<Vec<Session>>;

    /// Most recently created active subagent session carrying `agent_label`.
    fn find_active_subagent(&self, agent_label: &str) -> StoreResult<Option<Session>>;

    /// Insert an event. Inserting an existing id is a no-op.
    fn append_event(&self, event: &Event) -> StoreResult<()>;

    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>>;

    /// Write completion fields, only if the stored event is still `started`.
    ///
    /// Returns true if this call performed the completion.
    fn update_event(&self, event: &Event) -> StoreResult<bool>;

    /// Latest `limit` events of a session, returned oldest first.
    fn recent_events(&self, session_id: &str, limit: usize) -> StoreResult<Vec<Event>>;

    /// Every event of a session, oldest first.
    fn session_events(&self, session_id: &str) -> StoreResult<Vec<Event>>;

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()>;

    /// Violations of a session at or after `since`, oldest first.
    fn query_recent_violations(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ViolationRecord>>;
}

/// Store standing in for one that could not be opened. Every call fails with
/// [`BatonError::StoreUnavailable`], which each caller recovers from locally.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> StoreResult<T> {
        Err(BatonError::StoreUnavailable(self.reason.clone()))
    }
}

impl Store for UnavailableStore {
    fn create_session(&self, _session: &Session) -> StoreResult<()> {
        self.fail()
    }

    fn get_session(&self, _id: &str) -> StoreResult<Option<Session>> {
        self.fail()
    }

    fn update_session_status(&self, _id: &str, _status: SessionStatus) -> StoreResult<bool> {
        self.fail()
    }

    fn link_session(&self, _id: &str, _parent_id: &str) -> StoreResult<bool> {
        self.fail()
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        self.fail()
    }

    fn child_sessions(&self, _parent_id: &str) -> StoreResult<Vec<Session>> {
        self.fail()
    }

    fn find_active_subagent(&self, _agent_label: &str) -> StoreResult<Option<Session>> {
        self.fail()
    }

    fn append_event(&self, _event: &Event) -> StoreResult<()> {
        self.fail()
    }

    fn get_event(&self, _event_id: &str) -> StoreResult<Option<Event>> {
        self.fail()
    }

    fn update_event(&self, _event: &Event) -> StoreResult<bool> {
        self.fail()
    }

    fn recent_events(&self, _session_id: &str, _limit: usize) -> StoreResult<Vec<Event>> {
        self.fail()
    }

    fn session_events(&self, _session_id: &str) -> StoreResult<Vec<Event>> {
        self.fail()
    }

    fn append_violation(&self, _violation: &ViolationRecord) -> StoreResult<()> {
        self.fail()
    }

    fn query_recent_violations(
        &self,
        _session_id: &str,
        _since: DateTime<Utc>,
    ) -> StoreResult<Vec<ViolationRecord>> {
        self.fail()
    }
}
