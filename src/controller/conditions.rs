//! Condition merge engine.
//!
//! Conditions are merged diff-aware: an unchanged condition keeps its
//! original transition timestamp and produces neither a status write nor an
//! Event. Only the changed subset is reported back to the caller.

use crate::constants::{COND_BLOCKED_BY_CONCURRENCY, COND_READY};
use crate::crd::status::Condition;
use crate::crd::ConcurrencyPolicy;

use super::events::EventType;

/// Merges `desired` into `existing`. Returns the merged list and the
/// conditions that actually changed. Conditions of types not named in
/// `desired` are carried over untouched.
pub fn merge_conditions(
    existing: &[Condition],
    desired: Vec<Condition>,
) -> (Vec<Condition>, Vec<Condition>) {
    let mut merged: Vec<Condition> = existing.to_vec();
    let mut changed = Vec::new();

    for d in desired {
        match merged.iter_mut().find(|c| c.r#type == d.r#type) {
            Some(current) if current.same_as(&d) => {}
            Some(current) => {
                *current = d.clone();
                changed.push(d);
            }
            None => {
                merged.push(d.clone());
                changed.push(d);
            }
        }
    }
    (merged, changed)
}

/// Observed cluster state a Schedule's conditions are derived from.
#[derive(Debug, Clone)]
pub struct ScheduleObservation {
    pub cronjob_exists: bool,
    pub playbook_ready: bool,
    pub concurrency_policy: ConcurrencyPolicy,
    pub concurrent_jobs: bool,
    /// Human-readable detail, e.g. `Active Jobs: job-1, job-2`.
    pub concurrent_detail: String,
}

/// Derives the Ready and BlockedByConcurrency conditions for a Schedule.
///
/// Precedence for Ready: a missing CronJob wins over an unready Playbook,
/// which wins over a concurrency block. Only the `Forbid` policy turns
/// concurrent Jobs into a Ready failure; `Allow` and `Replace` schedules
/// stay Ready while BlockedByConcurrency still reports the observed state.
pub fn desired_schedule_conditions(obs: &ScheduleObservation) -> Vec<Condition> {
    let ready = if !obs.cronjob_exists {
        Condition::new(
            COND_READY,
            "False",
            "CronJobMissing",
            "CronJob does not exist",
        )
    } else if !obs.playbook_ready {
        Condition::new(
            COND_READY,
            "False",
            "PlaybookNotReady",
            "Referenced Playbook is not ready",
        )
    } else if obs.concurrency_policy == ConcurrencyPolicy::Forbid && obs.concurrent_jobs {
        Condition::new(
            COND_READY,
            "False",
            "BlockedByConcurrency",
            &format!("Concurrent Jobs prevent new runs: {}", obs.concurrent_detail),
        )
    } else {
        Condition::new(COND_READY, "True", "Ready", "Schedule is ready")
    };

    let blocked = if obs.concurrent_jobs {
        Condition::new(
            COND_BLOCKED_BY_CONCURRENCY,
            "True",
            "ConcurrentJobsRunning",
            &obs.concurrent_detail,
        )
    } else {
        Condition::new(
            COND_BLOCKED_BY_CONCURRENCY,
            "False",
            "NoConcurrentJobs",
            "No concurrent Jobs running",
        )
    };

    vec![ready, blocked]
}

/// Event severity for a changed condition: losing readiness and becoming
/// blocked are warnings, everything else is informational.
pub fn condition_event_type(condition: &Condition) -> EventType {
    let degraded = (condition.r#type == COND_READY && condition.status != "True")
        || (condition.r#type == COND_BLOCKED_BY_CONCURRENCY && condition.status == "True");
    if degraded {
        EventType::Warning
    } else {
        EventType::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> ScheduleObservation {
        ScheduleObservation {
            cronjob_exists: true,
            playbook_ready: true,
            concurrency_policy: ConcurrencyPolicy::Forbid,
            concurrent_jobs: false,
            concurrent_detail: String::new(),
        }
    }

    fn find<'a>(conditions: &'a [Condition], r#type: &str) -> &'a Condition {
        conditions.iter().find(|c| c.r#type == r#type).unwrap()
    }

    #[test]
    fn healthy_schedule_is_ready() {
        let conditions = desired_schedule_conditions(&observation());
        let ready = find(&conditions, COND_READY);
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "Ready");
        assert_eq!(ready.message, "Schedule is ready");
        let blocked = find(&conditions, COND_BLOCKED_BY_CONCURRENCY);
        assert_eq!(blocked.status, "False");
        assert_eq!(blocked.reason, "NoConcurrentJobs");
        assert_eq!(blocked.message, "No concurrent Jobs running");
    }

    #[test]
    fn missing_cronjob_wins_over_everything() {
        let mut obs = observation();
        obs.cronjob_exists = false;
        obs.playbook_ready = false;
        obs.concurrent_jobs = true;
        let conditions = desired_schedule_conditions(&obs);
        assert_eq!(find(&conditions, COND_READY).reason, "CronJobMissing");
    }

    #[test]
    fn unready_playbook_blocks_ready() {
        let mut obs = observation();
        obs.playbook_ready = false;
        let conditions = desired_schedule_conditions(&obs);
        assert_eq!(find(&conditions, COND_READY).reason, "PlaybookNotReady");
    }

    #[test]
    fn forbid_policy_with_concurrent_jobs_blocks_ready() {
        let mut obs = observation();
        obs.concurrent_jobs = true;
        obs.concurrent_detail = "Active Jobs: job-1".to_string();
        let conditions = desired_schedule_conditions(&obs);
        let ready = find(&conditions, COND_READY);
        assert_eq!(ready.reason, "BlockedByConcurrency");
        assert!(ready.message.contains("job-1"));
        let blocked = find(&conditions, COND_BLOCKED_BY_CONCURRENCY);
        assert_eq!(blocked.reason, "ConcurrentJobsRunning");
        assert!(blocked.message.contains("job-1"));
    }

    #[test]
    fn allow_and_replace_policies_stay_ready_while_blocked_reports() {
        for policy in [ConcurrencyPolicy::Allow, ConcurrencyPolicy::Replace] {
            let mut obs = observation();
            obs.concurrency_policy = policy;
            obs.concurrent_jobs = true;
            obs.concurrent_detail = "Active Jobs: job-1".to_string();
            let conditions = desired_schedule_conditions(&obs);
            assert_eq!(find(&conditions, COND_READY).reason, "Ready");
            assert_eq!(
                find(&conditions, COND_BLOCKED_BY_CONCURRENCY).reason,
                "ConcurrentJobsRunning"
            );
        }
    }

    #[test]
    fn unchanged_conditions_produce_no_diff() {
        let existing = desired_schedule_conditions(&observation());
        let (merged, changed) = merge_conditions(&existing, desired_schedule_conditions(&observation()));
        assert!(changed.is_empty());
        // Original transition timestamps survive.
        assert_eq!(
            merged[0].last_transition_time,
            existing[0].last_transition_time
        );
    }

    #[test]
    fn changed_condition_is_reported_and_replaced() {
        let existing = desired_schedule_conditions(&observation());
        let mut obs = observation();
        obs.playbook_ready = false;
        let (merged, changed) = merge_conditions(&existing, desired_schedule_conditions(&obs));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].reason, "PlaybookNotReady");
        assert_eq!(find(&merged, COND_READY).reason, "PlaybookNotReady");
        // The unchanged BlockedByConcurrency condition is untouched.
        assert_eq!(find(&merged, COND_BLOCKED_BY_CONCURRENCY).reason, "NoConcurrentJobs");
    }

    #[test]
    fn unrelated_conditions_are_carried_over() {
        let mut existing = desired_schedule_conditions(&observation());
        existing.push(Condition::new("AuthValid", "True", "ProbeSucceeded", "ok"));
        let (merged, _) = merge_conditions(&existing, desired_schedule_conditions(&observation()));
        assert!(merged.iter().any(|c| c.r#type == "AuthValid"));
    }

    #[test]
    fn event_type_classification() {
        let ready_false = Condition::new(COND_READY, "False", "PlaybookNotReady", "m");
        let ready_true = Condition::new(COND_READY, "True", "Ready", "m");
        let blocked_true =
            Condition::new(COND_BLOCKED_BY_CONCURRENCY, "True", "ConcurrentJobsRunning", "m");
        let blocked_false =
            Condition::new(COND_BLOCKED_BY_CONCURRENCY, "False", "NoConcurrentJobs", "m");
        assert_eq!(condition_event_type(&ready_false), EventType::Warning);
        assert_eq!(condition_event_type(&ready_true), EventType::Normal);
        assert_eq!(condition_event_type(&blocked_true), EventType::Warning);
        assert_eq!(condition_event_type(&blocked_false), EventType::Normal);
    }
}
