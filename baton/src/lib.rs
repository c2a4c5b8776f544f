//! Delegation-aware event attribution and policy enforcement for AI coding agents.
//!
//! Every tool call made by an orchestrating agent, or by a subagent it spawned,
//! passes through a pair of hooks. The crate attributes each call to a session,
//! links calls into a causal tree across process boundaries and enforces a
//! "delegate tactical work" policy with a decaying circuit breaker.
//!
//! - **[`core`]**: Pure, deterministic logic (context resolution, version-control
//!   classification, pattern matching, violation arithmetic, redaction).
//! - **[`io`]**: Side-effecting operations (config documents, persistence, the
//!   shared session marker, environment, clock).
//!
//! Orchestration modules ([`session`], [`correlate`], [`policy`], [`hook`],
//! [`settings`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod correlate;
pub mod error;
pub mod exit_codes;
pub mod hook;
pub mod io;
pub mod logging;
pub mod policy;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
