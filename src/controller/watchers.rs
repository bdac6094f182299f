//! Watch handlers for child Jobs and CronJobs.
//!
//! Probe Jobs, manual-run Jobs and Schedule-owned Jobs all surface as Job
//! watch events; they are discriminated by label before any status is
//! written back. Every handler tolerates the owning custom resource having
//! been deleted concurrently — that is a no-op, not an error.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::Api;
use kube::ResourceExt;
use kube_runtime::{watcher, WatchStreamExt};
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::WatchScope;
use crate::constants::{
    ANNOTATION_REVISION, API_GROUP_VERSION, COND_AUTH_VALID, COND_CLONE_READY, COND_READY,
    LABEL_MANAGED_BY, LABEL_OWNER_KIND, LABEL_OWNER_NAME, LABEL_PROBE_TYPE, LABEL_RUN_ID,
    LABEL_RUN_TYPE, MANAGED_BY, PROBE_TYPE_CONNECTIVITY, RUN_TYPE_MANUAL,
};
use crate::crd::status::Condition;
use crate::crd::{Playbook, Repository, Schedule};

use super::conditions::merge_conditions;
use super::events::{emit_event, log_best_effort, EventType};
use super::{patch_status, Context};

/// Watches Jobs carrying our managed-by label and folds completion state
/// back into the owning resources. Restarts the stream on failure.
pub async fn run_job_watcher(ctx: Arc<Context>) {
    loop {
        let api: Api<Job> = scoped_api(&ctx);
        let config =
            watcher::Config::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));
        let stream = watcher(api, config).default_backoff().applied_objects();
        let mut stream = std::pin::pin!(stream);
        let result: Result<(), watcher::Error> = async {
            while let Some(job) = stream.try_next().await? {
                handle_job_event(&ctx, &job).await;
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            error!(%err, "job watch stream failed, restarting");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Watches managed CronJobs and republishes their schedule bookkeeping to
/// the owning Schedule's status.
pub async fn run_cronjob_watcher(ctx: Arc<Context>) {
    loop {
        let api: Api<CronJob> = scoped_api(&ctx);
        let config =
            watcher::Config::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));
        let stream = watcher(api, config).default_backoff().applied_objects();
        let mut stream = std::pin::pin!(stream);
        let result: Result<(), watcher::Error> = async {
            while let Some(cronjob) = stream.try_next().await? {
                handle_cronjob_event(&ctx, &cronjob).await;
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            error!(%err, "cronjob watch stream failed, restarting");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

fn scoped_api<K>(ctx: &Context) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match &ctx.config.watch_scope {
        WatchScope::All => Api::all(ctx.client.clone()),
        WatchScope::Namespace(ns) => Api::namespaced(ctx.client.clone(), ns),
    }
}

async fn handle_job_event(ctx: &Context, job: &Job) {
    let labels = job.labels();
    if labels.get(LABEL_PROBE_TYPE).map(String::as_str) == Some(PROBE_TYPE_CONNECTIVITY) {
        handle_probe_job(ctx, job).await;
        return;
    }
    if labels.get(LABEL_RUN_TYPE).map(String::as_str) == Some(RUN_TYPE_MANUAL) {
        handle_manual_job(ctx, job).await;
    }
    if labels.get(LABEL_OWNER_KIND).map(String::as_str) == Some("Schedule") {
        handle_schedule_job(ctx, job).await;
    }
}

/// Probe Job completion drives the Repository's AuthValid/CloneReady/Ready
/// conditions.
async fn handle_probe_job(ctx: &Context, job: &Job) {
    let job_name = job.name_any();
    let Some(namespace) = job.namespace() else { return };
    let Some(repository_name) = job_name.strip_suffix("-probe") else {
        return;
    };

    // The first owner reference must be the Repository.
    let Some(owner) = job.owner_references().first() else {
        return;
    };
    if owner.kind != "Repository" || owner.api_version != API_GROUP_VERSION {
        return;
    }

    let api: Api<Repository> = Api::namespaced(ctx.client.clone(), &namespace);
    let repository = match api.get(repository_name).await {
        Ok(repository) => repository,
        // Deleted concurrently; nothing to update.
        Err(_) => return,
    };

    let status = job.status.clone().unwrap_or_default();
    let succeeded = status.succeeded.unwrap_or(0);
    let failed = status.failed.unwrap_or(0);

    let (desired, event_reason, event_message, event_type) = if succeeded > 0 {
        info!(resource = %format!("{namespace}/{repository_name}"), "connectivity probe succeeded");
        (
            vec![
                Condition::new(
                    COND_AUTH_VALID,
                    "True",
                    "ProbeSucceeded",
                    "Connectivity probe successful",
                ),
                Condition::new(
                    COND_CLONE_READY,
                    "True",
                    "ProbeSucceeded",
                    "Repository clone ready",
                ),
                Condition::new(COND_READY, "True", "Validated", "Repository is ready for use"),
            ],
            "ValidateSucceeded",
            "Repository connectivity and clone capability verified",
            EventType::Normal,
        )
    } else if failed > 0 {
        info!(resource = %format!("{namespace}/{repository_name}"), "connectivity probe failed");
        (
            vec![
                Condition::new(
                    COND_AUTH_VALID,
                    "False",
                    "ProbeFailed",
                    "Connectivity probe failed",
                ),
                Condition::new(
                    COND_CLONE_READY,
                    "False",
                    "ProbeFailed",
                    "Cannot attempt clone without connectivity",
                ),
                Condition::new(
                    COND_READY,
                    "False",
                    "ProbeFailed",
                    "Repository connectivity check failed",
                ),
            ],
            "ValidateFailed",
            "Repository connectivity check failed",
            EventType::Warning,
        )
    } else {
        // Probe still running.
        return;
    };

    let existing = repository
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let (merged, changed) = merge_conditions(&existing, desired);
    if changed.is_empty() {
        return;
    }
    log_best_effort(
        patch_status(&api, repository_name, json!({"status": {"conditions": merged}})).await,
        "repository status patch",
    );
    log_best_effort(
        emit_event(
            ctx.client.clone(),
            "Repository",
            &namespace,
            repository_name,
            event_reason,
            event_message,
            event_type,
        )
        .await,
        "repository event",
    );
}

/// Manual-run Job completion updates `status.lastManualRun` on the owner
/// (Playbook or Schedule, as recorded in the owner-kind label).
async fn handle_manual_job(ctx: &Context, job: &Job) {
    let labels = job.labels();
    let Some((namespace, owner_name)) = parse_owner_name(labels.get(LABEL_OWNER_NAME)) else {
        return;
    };
    let Some(run_id) = labels.get(LABEL_RUN_ID) else {
        return;
    };
    let owner_kind = labels
        .get(LABEL_OWNER_KIND)
        .map(String::as_str)
        .unwrap_or("Playbook");

    let status = job.status.clone().unwrap_or_default();
    let job_name = job.name_any();
    let (run_status, reason, message, event_type) = if status.succeeded.unwrap_or(0) > 0 {
        (
            "Succeeded",
            "JobSucceeded",
            format!("Manual run Job '{job_name}' succeeded"),
            EventType::Normal,
        )
    } else if status.failed.unwrap_or(0) > 0 {
        (
            "Failed",
            "JobFailed",
            format!("Manual run Job '{job_name}' failed"),
            EventType::Warning,
        )
    } else {
        return;
    };

    let completion_time = status
        .completion_time
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

    let body = json!({
        "status": {
            "lastManualRun": {
                "runId": run_id,
                "jobRef": format!("{namespace}/{job_name}"),
                "status": run_status,
                "reason": reason,
                "message": message,
                "completionTime": completion_time,
            }
        }
    });

    let patched = match owner_kind {
        "Schedule" => {
            let api: Api<Schedule> = Api::namespaced(ctx.client.clone(), &namespace);
            patch_status(&api, &owner_name, body).await
        }
        _ => {
            let api: Api<Playbook> = Api::namespaced(ctx.client.clone(), &namespace);
            patch_status(&api, &owner_name, body).await
        }
    };
    // Owner may be gone; that is fine.
    log_best_effort(patched, "manual-run completion patch");

    log_best_effort(
        emit_event(
            ctx.client.clone(),
            owner_kind,
            &namespace,
            &owner_name,
            reason,
            &message,
            event_type,
        )
        .await,
        "manual-run completion event",
    );
}

/// Any Schedule-owned Job observation refreshes the Schedule's last-run
/// bookkeeping.
async fn handle_schedule_job(ctx: &Context, job: &Job) {
    let labels = job.labels();
    let Some((namespace, schedule_name)) = parse_owner_name(labels.get(LABEL_OWNER_NAME)) else {
        return;
    };

    let job_name = job.name_any();
    let mut status = json!({
        "lastJobRef": format!("{namespace}/{job_name}"),
    });
    if let Some(created) = &job.metadata.creation_timestamp {
        status["lastRunTime"] = json!(created.0.to_rfc3339());
    }
    if let Some(revision) = job.annotations().get(ANNOTATION_REVISION) {
        status["lastRunRevision"] = json!(revision);
    }

    let api: Api<Schedule> = Api::namespaced(ctx.client.clone(), &namespace);
    log_best_effort(
        patch_status(&api, &schedule_name, json!({"status": status})).await,
        "schedule job-status patch",
    );
    debug!(
        resource = %format!("{namespace}/{schedule_name}"),
        job = %job_name,
        "schedule status updated from job"
    );
}

async fn handle_cronjob_event(ctx: &Context, cronjob: &CronJob) {
    let labels = cronjob.labels();
    let Some((namespace, schedule_name)) = parse_owner_name(labels.get(LABEL_OWNER_NAME)) else {
        return;
    };

    let mut status = json!({});
    if let Some(last) = cronjob
        .status
        .as_ref()
        .and_then(|s| s.last_schedule_time.as_ref())
    {
        status["lastRunTime"] = json!(last.0.to_rfc3339());
    }
    if let Some(next) =
        super::schedule::observed_next_run(ctx.client.clone(), &namespace, &cronjob.name_any())
            .await
    {
        status["nextRunTime"] = json!(next);
    }
    let Some(fields) = status.as_object() else { return };
    if fields.is_empty() {
        return;
    }

    let api: Api<Schedule> = Api::namespaced(ctx.client.clone(), &namespace);
    log_best_effort(
        patch_status(&api, &schedule_name, json!({"status": status})).await,
        "schedule cronjob-status patch",
    );
    debug!(
        resource = %format!("{namespace}/{schedule_name}"),
        "schedule status updated from cronjob"
    );
}

/// Splits the `{namespace}.{name}` owner label.
fn parse_owner_name(value: Option<&String>) -> Option<(String, String)> {
    let value = value?;
    let (namespace, name) = value.split_once('.')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_name_label_parses() {
        let label = "prod.nightly-deploy".to_string();
        assert_eq!(
            parse_owner_name(Some(&label)),
            Some(("prod".to_string(), "nightly-deploy".to_string()))
        );
    }

    #[test]
    fn owner_name_without_separator_is_rejected() {
        let label = "nightly-deploy".to_string();
        assert_eq!(parse_owner_name(Some(&label)), None);
        assert_eq!(parse_owner_name(None), None);
    }

    #[test]
    fn owner_name_splits_on_first_dot_only() {
        let label = "prod.app.v2".to_string();
        assert_eq!(
            parse_owner_name(Some(&label)),
            Some(("prod".to_string(), "app.v2".to_string()))
        );
    }
}
