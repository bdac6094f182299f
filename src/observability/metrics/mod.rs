//! # Metrics Module
//!
//! Prometheus metrics for monitoring the operator, organized by
//! responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup and registration
//! - `controller_metrics` - Reconcile counters, durations, dependency
//!   triggers and manual-run outcomes

pub mod controller_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use registry::*;
