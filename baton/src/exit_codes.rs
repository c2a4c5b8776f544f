//! Stable exit codes for baton CLI commands.

/// Command succeeded, or the hook allowed the tool call.
pub const OK: i32 = 0;
/// Command failed due to an invalid argument, key, value or other error.
pub const INVALID: i32 = 1;
/// `baton hook pre-tool` refused the tool call.
pub const BLOCK: i32 = 2;
