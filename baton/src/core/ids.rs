//! Identifier helpers.

use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Deterministic id for a subagent session spawned under `parent_session_id`.
///
/// Every call inside one spawned process resolves the same parent and label,
/// so they converge on a single session instead of creating duplicates.
pub fn subagent_session_id(parent_session_id: &str, agent_label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_session_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(agent_label.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("sub-{}", &digest[..16])
}

/// Fresh, time-ordered identifier for sessions and events.
pub fn new_id() -> String {
    Ulid::new().to_string()
}
