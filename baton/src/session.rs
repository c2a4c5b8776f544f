//! Session registry: the only component that creates, closes and relinks
//! sessions.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Duration;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{ContextInfo, SpawnEnv, resolve_context};
use crate::core::ids::{new_id, subagent_session_id};
use crate::core::types::{Session, SessionStatus};
use crate::error::BatonError;
use crate::io::clock::Clock;
use crate::io::marker::{SessionMarker, clear_marker_if, read_marker, write_marker};
use crate::io::store::{Store, StoreResult};

pub struct SessionRegistry<'a, S: ?Sized, C: ?Sized> {
    store: &'a S,
    clock: &'a C,
    marker_path: Option<PathBuf>,
}

impl<'a, S, C> SessionRegistry<'a, S, C>
where
    S: Store + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a C) -> Self {
        Self {
            store,
            clock,
            marker_path: None,
        }
    }

    /// Use the shared current-session marker at `path`.
    pub fn with_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.marker_path = Some(path.into());
        self
    }

    /// Resolve this process's context from its spawn environment, the shared
    /// marker and the store.
    pub fn extract_context(&self, env: &SpawnEnv) -> ContextInfo {
        let marker = self.marker_session();
        let inferred = if env.subagent_type.is_none() && env.parent_session.is_none() {
            env.agent_label
                .as_deref()
                .and_then(|label| match self.store.find_active_subagent(label) {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(error = %err, "subagent inference skipped");
                        None
                    }
                })
        } else {
            None
        };
        let mut context = resolve_context(env, marker.as_ref(), inferred.as_ref());
        if let Some(parent) = &context.parent_session_id {
            context.parent_agent_label = match self.store.get_session(parent) {
                Ok(found) => found.map(|session| session.agent_label),
                Err(err) => {
                    warn!(error = %err, "parent session lookup failed");
                    None
                }
            };
        }
        debug!(
            source = ?context.source,
            is_subagent = context.is_subagent,
            parent = ?context.parent_session_id,
            "context resolved"
        );
        context
    }

    /// Session for `context`. Never fails: when the store is unavailable an
    /// unpersisted `stale` session is returned.
    #[instrument(skip_all, fields(agent_label = %context.agent_label))]
    pub fn get_or_create(&self, context: &ContextInfo) -> Session {
        match self.try_get_or_create(context) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "store unavailable; using ephemeral session");
                self.ephemeral(context)
            }
        }
    }

    fn try_get_or_create(&self, context: &ContextInfo) -> StoreResult<Session> {
        if context.is_subagent {
            return match &context.parent_session_id {
                Some(parent) => self.subagent_session(parent, &context.agent_label),
                None => self.orphan_session(&context.agent_label),
            };
        }

        if let Some(marker) = self.read_marker()
            && let Some(existing) = self.store.get_session(&marker.session_id)?
            && existing.is_active()
            && !existing.is_subagent
        {
            return Ok(existing);
        }

        let session = Session {
            id: new_id(),
            agent_label: context.agent_label.clone(),
            is_subagent: false,
            parent_session_id: None,
            created_at: self.clock.now(),
            status: SessionStatus::Active,
            violation_history: Vec::new(),
        };
        self.store.create_session(&session)?;
        info!(session_id = %session.id, "created top-level session");
        self.point_marker_at(&session);
        Ok(session)
    }

    fn subagent_session(&self, parent: &str, agent_label: &str) -> StoreResult<Session> {
        let id = subagent_session_id(parent, agent_label);
        let session = Session {
            id: id.clone(),
            agent_label: agent_label.to_string(),
            is_subagent: true,
            parent_session_id: Some(parent.to_string()),
            created_at: self.clock.now(),
            status: SessionStatus::Active,
            violation_history: Vec::new(),
        };
        self.converge(session)
    }

    /// A subagent whose parent cannot be resolved still needs somewhere to
    /// record its calls. It gets a top-level record that never takes the marker.
    fn orphan_session(&self, agent_label: &str) -> StoreResult<Session> {
        warn!(agent_label, "subagent without a resolvable parent");
        let session = Session {
            id: subagent_session_id("", agent_label),
            agent_label: agent_label.to_string(),
            is_subagent: false,
            parent_session_id: None,
            created_at: self.clock.now(),
            status: SessionStatus::Active,
            violation_history: Vec::new(),
        };
        self.converge(session)
    }

    /// Create `fresh` unless a record with its id exists; reactivate that
    /// record when it was reaped or closed.
    fn converge(&self, fresh: Session) -> StoreResult<Session> {
        match self.store.get_session(&fresh.id)? {
            Some(existing) if existing.is_active() => Ok(existing),
            Some(mut existing) => {
                self.store
                    .update_session_status(&existing.id, SessionStatus::Active)?;
                info!(
                    session_id = %existing.id,
                    previous = existing.status.as_str(),
                    "reactivated session"
                );
                existing.status = SessionStatus::Active;
                Ok(existing)
            }
            None => {
                self.store.create_session(&fresh)?;
                info!(
                    session_id = %fresh.id,
                    parent = ?fresh.parent_session_id,
                    "created session"
                );
                Ok(fresh)
            }
        }
    }

    fn ephemeral(&self, context: &ContextInfo) -> Session {
        let parent = context.parent_session_id.clone();
        Session {
            id: new_id(),
            agent_label: context.agent_label.clone(),
            is_subagent: context.is_subagent && parent.is_some(),
            parent_session_id: parent,
            created_at: self.clock.now(),
            status: SessionStatus::Stale,
            violation_history: Vec::new(),
        }
    }

    /// Mark a session closed. Closing an already-closed session is a no-op.
    ///
    /// Returns false if the session does not exist.
    pub fn close(&self, session_id: &str) -> StoreResult<bool> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(false);
        };
        if session.status != SessionStatus::Closed {
            self.store
                .update_session_status(session_id, SessionStatus::Closed)?;
            info!(session_id, "closed session");
        }
        if let Some(path) = &self.marker_path
            && let Err(err) = clear_marker_if(path, session_id)
        {
            warn!(error = %format!("{err:#}"), "could not clear marker");
        }
        Ok(true)
    }

    /// Re-parent `child` under `parent`.
    pub fn link(&self, child: &str, parent: &str) -> Result<(), BatonError> {
        if child == parent {
            return Err(BatonError::InvalidLink(format!(
                "{child} cannot be its own parent"
            )));
        }
        if self.store.get_session(child)?.is_none() {
            return Err(BatonError::InvalidLink(format!("unknown session {child}")));
        }

        let mut seen = HashSet::new();
        let mut cursor = Some(parent.to_string());
        while let Some(id) = cursor {
            if id == child {
                return Err(BatonError::InvalidLink(format!(
                    "{parent} descends from {child}; linking would create a cycle"
                )));
            }
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = self
                .store
                .get_session(&id)?
                .and_then(|session| session.parent_session_id);
        }

        self.store.link_session(child, parent)?;
        info!(child, parent, "linked session");
        Ok(())
    }

    /// Mark active sessions with no activity for longer than `max_idle` stale.
    ///
    /// Returns the ids that were marked.
    pub fn reap_stale(&self, max_idle: Duration) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let mut reaped = Vec::new();
        for session in self.store.list_sessions()? {
            if !session.is_active() {
                continue;
            }
            let last_activity = self
                .store
                .recent_events(&session.id, 1)?
                .into_iter()
                .map(|event| event.end_time.unwrap_or(event.start_time))
                .chain(std::iter::once(session.created_at))
                .max()
                .unwrap_or(session.created_at);
            if now - last_activity > max_idle {
                self.store
                    .update_session_status(&session.id, SessionStatus::Stale)?;
                reaped.push(session.id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale sessions");
        }
        Ok(reaped)
    }

    fn read_marker(&self) -> Option<SessionMarker> {
        let path = self.marker_path.as_ref()?;
        match read_marker(path) {
            Ok(marker) => marker,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ignoring unreadable marker");
                None
            }
        }
    }

    fn marker_session(&self) -> Option<Session> {
        let marker = self.read_marker()?;
        match self.store.get_session(&marker.session_id) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "marker session lookup failed");
                None
            }
        }
    }

    fn point_marker_at(&self, session: &Session) {
        let Some(path) = &self.marker_path else {
            return;
        };
        let marker = SessionMarker {
            session_id: session.id.clone(),
            agent_label: session.agent_label.clone(),
            updated_at: self.clock.now(),
        };
        if let Err(err) = write_marker(path, &marker) {
            warn!(error = %format!("{err:#}"), "could not write marker");
        }
    }
}
