//! Deterministic, pure logic shared by the attribution and policy engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod breaker;
pub mod context;
pub mod ids;
pub mod matcher;
pub mod redact;
pub mod rules;
pub mod tree;
pub mod types;
pub mod vcs;
pub mod violations;
