//! I/O helpers for baton commands: config documents, persistence, the shared
//! session marker, the process environment and the clock.

pub mod clock;
pub mod config;
pub mod env;
pub mod marker;
pub mod paths;
pub mod store;
