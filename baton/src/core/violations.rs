//! Effective violation count: decay filter + rapid-sequence collapsing.
//!
//! The count is always derived from the raw, append-only history; nothing here
//! keeps a running counter.

use chrono::{DateTime, Duration, Utc};

use crate::core::types::ViolationRecord;

/// Windows used to derive the effective count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountWindows {
    /// Records older than this (relative to now) no longer count.
    pub decay: Duration,
    /// A record this close to the previous retained record merges into it.
    pub rapid_sequence: Duration,
}

impl CountWindows {
    pub fn from_secs(decay_secs: u64, rapid_secs: u64) -> Self {
        Self {
            decay: seconds(decay_secs),
            rapid_sequence: seconds(rapid_secs),
        }
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Compute the effective count of `records` at `now`.
///
/// Input order does not matter; records are walked in timestamp order.
pub fn effective_count(
    records: &[ViolationRecord],
    now: DateTime<Utc>,
    windows: CountWindows,
) -> usize {
    let mut timestamps: Vec<DateTime<Utc>> = records.iter().map(|r| r.timestamp).collect();
    timestamps.sort();
    effective_count_of(&timestamps, now, windows)
}

/// Same as [`effective_count`] over already-sorted timestamps.
pub fn effective_count_of(
    sorted: &[DateTime<Utc>],
    now: DateTime<Utc>,
    windows: CountWindows,
) -> usize {
    let mut count = 0;
    let mut anchor: Option<DateTime<Utc>> = None;
    for &ts in sorted.iter().filter(|&&ts| now - ts <= windows.decay) {
        match anchor {
            Some(prev) if ts - prev <= windows.rapid_sequence => {}
            _ => {
                anchor = Some(ts);
                count += 1;
            }
        }
    }
    count
}
