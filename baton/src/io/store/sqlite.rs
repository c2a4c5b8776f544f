//! SQLite-backed store shared by every process in a project.
//!
//! Each operation is a single short statement (autocommit), so concurrent
//! hook processes never hold locks across calls. WAL mode plus a busy timeout
//! absorbs write contention between parallel subagents.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::{Store, StoreResult};
use crate::core::types::{
    Event, EventStatus, Session, SessionStatus, ViolationRecord, format_ts, parse_ts,
};
use crate::error::BatonError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    agent_label TEXT NOT NULL,
    is_subagent INTEGER NOT NULL,
    parent_session_id TEXT,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    input_summary TEXT NOT NULL,
    output_summary TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_ms INTEGER,
    status TEXT NOT NULL,
    parent_event_id TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, start_time);
CREATE INDEX IF NOT EXISTS idx_events_parent ON events(parent_event_id);

CREATE TABLE IF NOT EXISTS violations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    pattern_kind TEXT NOT NULL,
    tool_name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_violations_session ON violations(session_id, timestamp);
";

const SESSION_COLUMNS: &str =
    "id, agent_label, is_subagent, parent_session_id, created_at, status";
const EVENT_COLUMNS: &str = "event_id, session_id, tool_name, input_summary, output_summary, \
     start_time, end_time, duration_ms, status, parent_event_id, error_message";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                BatonError::StoreUnavailable(format!("create {}: {err}", parent.display()))
            })?;
        }
        debug!(path = %path.display(), "opening store");
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn load_violations(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let since = since.map(format_ts).unwrap_or_default();
        let mut stmt = self.conn.prepare(
            "SELECT session_id, timestamp, pattern_kind, tool_name FROM violations
             WHERE session_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id, since], |row| {
            Ok(ViolationRecord {
                session_id: row.get(0)?,
                timestamp: ts_column(row, 1)?,
                pattern_kind: row.get(2)?,
                tool_name: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_sessions(&self, sql_where: &str, param: Option<&str>) -> StoreResult<Vec<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions {sql_where}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match param {
            Some(value) => stmt.query_map(params![value], session_row)?,
            None => stmt.query_map([], session_row)?,
        };
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_events(
        &self,
        sql_tail: &str,
        session_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events {sql_tail}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, limit], event_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl Store for SqliteStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions
             (id, agent_label, is_subagent, parent_session_id, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.agent_label,
                session.is_subagent,
                session.parent_session_id,
                format_ts(session.created_at),
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let session = self
            .conn
            .query_row(&sql, params![id], session_row)
            .optional()?;
        match session {
            Some(mut session) => {
                session.violation_history = self.load_violations(id, None)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn update_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    fn link_session(&self, id: &str, parent_id: &str) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET parent_session_id = ?1 WHERE id = ?2",
            params![parent_id, id],
        )?;
        Ok(changed > 0)
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        self.query_sessions("ORDER BY created_at ASC, rowid ASC", None)
    }

    fn child_sessions(&self, parent_id: &str) -> StoreResult<Vec<Session>> {
        self.query_sessions(
            "WHERE parent_session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            Some(parent_id),
        )
    }

    fn find_active_subagent(&self, agent_label: &str) -> StoreResult<Option<Session>> {
        let found = self.query_sessions(
            "WHERE agent_label = ?1 AND is_subagent = 1 AND status = 'active'
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            Some(agent_label),
        )?;
        Ok(found.into_iter().next())
    }

    fn append_event(&self, event: &Event) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO events
             (event_id, session_id, tool_name, input_summary, output_summary, start_time,
              end_time, duration_ms, status, parent_event_id, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.event_id,
                event.session_id,
                event.tool_name,
                event.input_summary,
                event.output_summary,
                format_ts(event.start_time),
                event.end_time.map(format_ts),
                event.duration_ms,
                event.status.as_str(),
                event.parent_event_id,
                event.error_message,
            ],
        )?;
        Ok(())
    }

    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![event_id], event_row)
            .optional()?)
    }

    fn update_event(&self, event: &Event) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE events
             SET output_summary = ?1, end_time = ?2, duration_ms = ?3, status = ?4,
                 error_message = ?5
             WHERE event_id = ?6 AND status = 'started'",
            params![
                event.output_summary,
                event.end_time.map(format_ts),
                event.duration_ms,
                event.status.as_str(),
                event.error_message,
                event.event_id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn recent_events(&self, session_id: &str, limit: usize) -> StoreResult<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut events = self.query_events(
            "WHERE session_id = ?1 ORDER BY start_time DESC, rowid DESC LIMIT ?2",
            session_id,
            limit,
        )?;
        events.reverse();
        Ok(events)
    }

    fn session_events(&self, session_id: &str) -> StoreResult<Vec<Event>> {
        self.query_events(
            "WHERE session_id = ?1 ORDER BY start_time ASC, rowid ASC LIMIT ?2",
            session_id,
            -1,
        )
    }

    fn append_violation(&self, violation: &ViolationRecord) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO violations (session_id, timestamp, pattern_kind, tool_name)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                violation.session_id,
                format_ts(violation.timestamp),
                violation.pattern_kind,
                violation.tool_name,
            ],
        )?;
        Ok(())
    }

    fn query_recent_violations(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ViolationRecord>> {
        self.load_violations(session_id, Some(since))
    }
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        agent_label: row.get(1)?,
        is_subagent: row.get(2)?,
        parent_session_id: row.get(3)?,
        created_at: ts_column(row, 4)?,
        status: parse_column(row, 5)?,
        violation_history: Vec::new(),
    })
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let end_time: Option<String> = row.get(6)?;
    let end_time = end_time
        .map(|raw| parse_ts(&raw).map_err(|err| conversion_error(6, err)))
        .transpose()?;
    Ok(Event {
        event_id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        input_summary: row.get(3)?,
        output_summary: row.get(4)?,
        start_time: ts_column(row, 5)?,
        end_time,
        duration_ms: row.get(7)?,
        status: parse_column(row, 8)?,
        parent_event_id: row.get(9)?,
        error_message: row.get(10)?,
    })
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|err| conversion_error(idx, err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|err| conversion_error(idx, err))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}
