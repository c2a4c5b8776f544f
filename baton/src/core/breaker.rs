//! Circuit breaker state, re-derived from the live effective count on every call.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Normal,
    Warned,
    Tripped,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Normal => f.write_str("normal"),
            BreakerState::Warned => f.write_str("warned"),
            BreakerState::Tripped => f.write_str("tripped"),
        }
    }
}

/// Breaker state for an effective count. Not sticky: a lower count later
/// yields a lower state.
pub fn breaker_state(effective_count: usize, threshold: u32) -> BreakerState {
    if effective_count == 0 {
        BreakerState::Normal
    } else if effective_count >= threshold as usize {
        BreakerState::Tripped
    } else {
        BreakerState::Warned
    }
}

/// Short actionable message for a blocked call.
pub fn block_message(tool_name: &str, effective_count: usize, threshold: u32) -> String {
    format!(
        "Blocked direct {tool_name} call: circuit breaker tripped \
         ({effective_count}/{threshold} recent violations). Delegate this work to a subagent, \
         wait for violations to decay, or raise the limit with \
         `baton set-config thresholds.circuit_breaker_violations <n>`."
    )
}

/// Warning attached to an allowed call while violations are outstanding.
pub fn warn_message(reason: Option<&str>, effective_count: usize, threshold: u32) -> String {
    match reason {
        Some(reason) => format!(
            "Delegation reminder: {reason} ({effective_count}/{threshold} recent violations)."
        ),
        None => format!(
            "Delegation reminder: {effective_count}/{threshold} recent violations; \
             the breaker trips at {threshold}."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_follow_threshold() {
        assert_eq!(breaker_state(0, 5), BreakerState::Normal);
        assert_eq!(breaker_state(4, 5), BreakerState::Warned);
        assert_eq!(breaker_state(5, 5), BreakerState::Tripped);
        assert_eq!(breaker_state(9, 5), BreakerState::Tripped);
    }

    #[test]
    fn state_recovers_when_count_drops() {
        assert_eq!(breaker_state(5, 5), BreakerState::Tripped);
        assert_eq!(breaker_state(2, 5), BreakerState::Warned);
    }

    #[test]
    fn block_message_is_actionable() {
        let msg = block_message("Bash", 5, 5);
        assert!(msg.contains("Bash"));
        assert!(msg.contains("5/5"));
        assert!(msg.contains("thresholds.circuit_breaker_violations"));
    }
}
