//! # Controller Metrics
//!
//! Metrics for reconcile outcomes, dependency fan-out triggers and manual
//! runs.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec};
use std::sync::LazyLock;

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "ansible_operator_reconcile_total",
            "Number of reconciliations",
        ),
        &["kind", "result"],
    )
    .expect("Failed to create RECONCILE_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "ansible_operator_reconcile_duration_seconds",
            "Duration of reconciliations in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static DEPENDENCY_TRIGGERS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "ansible_operator_dependency_triggers_total",
            "Number of dependent resources nudged via the trigger annotation",
        ),
        &["kind"],
    )
    .expect("Failed to create DEPENDENCY_TRIGGERS_TOTAL metric - this should never happen")
});

static MANUAL_RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "ansible_operator_manual_runs_total",
            "Number of manual runs by outcome",
        ),
        &["result"],
    )
    .expect("Failed to create MANUAL_RUNS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "ansible_operator_requeues_total",
            "Number of reconciliation requeues",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

/// Register controller metrics with the registry
pub(crate) fn register_controller_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(DEPENDENCY_TRIGGERS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MANUAL_RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    Ok(())
}

// Public functions for controller metrics

pub fn inc_reconcile(kind: &str, result: &str) {
    RECONCILE_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn observe_reconcile_duration(kind: &str, duration: f64) {
    RECONCILE_DURATION.with_label_values(&[kind]).observe(duration);
}

pub fn inc_dependency_trigger(kind: &str) {
    DEPENDENCY_TRIGGERS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn inc_manual_run(result: &str) {
    MANUAL_RUNS_TOTAL.with_label_values(&[result]).inc();
}

pub fn inc_requeue(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_reconcile() {
        let before = RECONCILE_TOTAL
            .with_label_values(&["Repository", "success"])
            .get();
        inc_reconcile("Repository", "success");
        let after = RECONCILE_TOTAL
            .with_label_values(&["Repository", "success"])
            .get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_observe_reconcile_duration() {
        observe_reconcile_duration("Schedule", 0.2);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_inc_dependency_trigger() {
        let before = DEPENDENCY_TRIGGERS_TOTAL.with_label_values(&["Playbook"]).get();
        inc_dependency_trigger("Playbook");
        let after = DEPENDENCY_TRIGGERS_TOTAL.with_label_values(&["Playbook"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_inc_manual_run() {
        let before = MANUAL_RUNS_TOTAL.with_label_values(&["Started"]).get();
        inc_manual_run("Started");
        let after = MANUAL_RUNS_TOTAL.with_label_values(&["Started"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_inc_requeue() {
        let before = REQUEUES_TOTAL.with_label_values(&["backoff"]).get();
        inc_requeue("backoff");
        let after = REQUEUES_TOTAL.with_label_values(&["backoff"]).get();
        assert_eq!(after, before + 1u64);
    }
}
