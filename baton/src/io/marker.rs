//! Shared "current session" marker (`.baton/state/current_session.json`).
//!
//! Only top-level sessions write the marker. Every process in the project can
//! read it, so it is a low-priority fallback behind the spawn environment.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::paths::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMarker {
    pub session_id: String,
    pub agent_label: String,
    pub updated_at: DateTime<Utc>,
}

/// Load the marker. A missing file is `None`.
pub fn read_marker(path: &Path) -> Result<Option<SessionMarker>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read marker {}", path.display()))?;
    let marker: SessionMarker = serde_json::from_str(&contents)
        .with_context(|| format!("parse marker {}", path.display()))?;
    debug!(session_id = %marker.session_id, "marker loaded");
    Ok(Some(marker))
}

/// Atomically point the marker at a session.
pub fn write_marker(path: &Path, marker: &SessionMarker) -> Result<()> {
    debug!(path = %path.display(), session_id = %marker.session_id, "writing marker");
    let mut buf = serde_json::to_string_pretty(marker).context("serialize marker")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Remove the marker if it still names `session_id`.
pub fn clear_marker_if(path: &Path, session_id: &str) -> Result<bool> {
    match read_marker(path)? {
        Some(marker) if marker.session_id == session_id => {
            fs::remove_file(path).with_context(|| format!("remove marker {}", path.display()))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn marker(id: &str) -> SessionMarker {
        SessionMarker {
            session_id: id.to_string(),
            agent_label: "orchestrator".to_string(),
            updated_at: Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn missing_marker_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_marker(&temp.path().join("m.json")).expect("read"), None);
    }

    #[test]
    fn clear_only_removes_matching_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("current_session.json");
        write_marker(&path, &marker("S1")).expect("write");
        assert_eq!(read_marker(&path).expect("read"), Some(marker("S1")));

        assert!(!clear_marker_if(&path, "S2").expect("clear other"));
        assert!(path.exists());
        assert!(clear_marker_if(&path, "S1").expect("clear"));
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_marker_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("m.json");
        fs::write(&path, "{not json").expect("write");
        assert!(read_marker(&path).is_err());
    }
}
