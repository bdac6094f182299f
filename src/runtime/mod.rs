//! # Runtime Module
//!
//! Runtime components for the operator: initialization, the HTTP server,
//! the watch loop and error backoff.

pub mod error_policy;
pub mod initialization;
pub mod server;
pub mod watch_loop;

pub use initialization::*;
pub use watch_loop::*;
