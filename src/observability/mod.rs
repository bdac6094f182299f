//! # Observability
//!
//! Prometheus metrics for the operator. Structured logging lives in the
//! runtime initialization; this module only owns the metric statics and
//! their registry.

pub mod metrics;
