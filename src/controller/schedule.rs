//! Schedule reconciler.
//!
//! Expands the schedule expression (including the deterministic random
//! macros), materializes the CronJob, guards adoption of name-colliding
//! CronJobs and derives the Ready/BlockedByConcurrency conditions from the
//! observed cluster state. Condition writes are diff-aware: an unchanged
//! condition produces neither a status write nor an Event.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use serde_json::json;
use tracing::{info, warn};

use crate::builders::cronjob::{self, CronJobParams};
use crate::constants::{
    ANNOTATION_RUN_NOW, COND_READY, FIELD_MANAGER, PERIODIC_REQUEUE_SECS,
    VALIDATION_REQUEUE_SECS,
};
use crate::crd::status::{find_condition, Condition};
use crate::crd::{Playbook, PlaybookSpec, Repository, RepositorySpec, Schedule};
use crate::cron;
use crate::observability::metrics;

use super::concurrency::{can_adopt_cronjob, check_concurrent_jobs, Adoption};
use super::conditions::{
    condition_event_type, desired_schedule_conditions, merge_conditions, ScheduleObservation,
};
use super::events::{emit_event, log_best_effort, EventType};
use super::manual_run::{self, ManualRunRequest};
use super::{patch_status, Context, Error, Result};

pub async fn reconcile(schedule: Arc<Schedule>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&schedule, &ctx).await;
    metrics::observe_reconcile_duration("Schedule", started.elapsed().as_secs_f64());
    match &result {
        Ok(_) => metrics::inc_reconcile("Schedule", "success"),
        Err(_) => metrics::inc_reconcile("Schedule", "error"),
    }
    result
}

async fn reconcile_inner(schedule: &Schedule, ctx: &Context) -> Result<Action> {
    let name = schedule
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingMetadata("name"))?;
    let namespace = schedule
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingMetadata("namespace"))?;
    let uid = schedule
        .metadata
        .uid
        .as_deref()
        .ok_or(Error::MissingMetadata("uid"))?;

    info!(resource = %format!("{namespace}/{name}"), uid, "reconciling schedule");

    if schedule.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let api: Api<Schedule> = Api::namespaced(ctx.client.clone(), namespace);
    let existing_conditions = schedule
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let (computed, used_macro) = cron::resolve_schedule(&schedule.spec.schedule, uid);
    if used_macro {
        info!(resource = %format!("{namespace}/{name}"), schedule = %computed, "expanded random schedule macro");
    }

    let playbook_ref = &schedule.spec.playbook_ref;
    if playbook_ref.name.is_empty() {
        let desired = vec![Condition::new(
            COND_READY,
            "False",
            "PlaybookRefMissing",
            "spec.playbookRef.name must be set",
        )];
        let (merged, changed) = merge_conditions(&existing_conditions, desired);
        let mut status = json!({"computedSchedule": computed});
        if !changed.is_empty() {
            status["conditions"] = serde_json::to_value(&merged)?;
            log_best_effort(
                emit_event(
                    ctx.client.clone(),
                    "Schedule",
                    namespace,
                    name,
                    "ValidateFailed",
                    "spec.playbookRef.name must be set",
                    EventType::Warning,
                )
                .await,
                "schedule event",
            );
        }
        log_best_effort(
            patch_status(&api, name, json!({"status": status})).await,
            "schedule status patch",
        );
        return Ok(Action::requeue(std::time::Duration::from_secs(
            VALIDATION_REQUEUE_SECS,
        )));
    }

    // Fetch the referenced Playbook and its Repository best-effort; a
    // missing Playbook still renders a CronJob (it will crash-loop until
    // fixed) but marks the Schedule unready.
    let playbook = fetch_playbook(ctx, namespace, &playbook_ref.name).await;
    let (playbook_spec, playbook_ready) = match &playbook {
        Some(pb) => (pb.spec.clone(), playbook_is_ready(pb)),
        None => (empty_playbook_spec(), false),
    };
    let (repository_spec, known_hosts_available) =
        fetch_repository_context(ctx, namespace, name, &playbook_spec).await;

    handle_manual_run(schedule, ctx, &api, namespace, name, uid, &playbook_spec, repository_spec.as_ref(), known_hosts_available)
        .await;

    let manifest = cronjob::build(&CronJobParams {
        schedule_name: name,
        namespace,
        computed_schedule: &computed,
        playbook_spec: &playbook_spec,
        repository_spec: repository_spec.as_ref(),
        known_hosts_available,
        schedule_spec: &schedule.spec,
        owner_uid: uid,
        image_default: &ctx.config.runner_image,
        image_digest: ctx.config.runner_image_digest.as_deref(),
        executor_service_account: ctx.config.executor_service_account.as_deref(),
    })?;

    let cronjob_api: Api<CronJob> = Api::namespaced(ctx.client.clone(), namespace);
    let cronjob_name = manifest.name_any();
    match apply_cronjob(ctx, &cronjob_api, &manifest, namespace, name, uid).await? {
        Applied::Done => {}
        Applied::AdoptionRefused(reason) => {
            let desired = vec![Condition::new(
                COND_READY,
                "False",
                "AdoptionSkipped",
                &format!("Cannot safely adopt existing CronJob: {reason}"),
            )];
            let (merged, changed) = merge_conditions(&existing_conditions, desired);
            let mut status = json!({"computedSchedule": computed});
            if !changed.is_empty() {
                status["conditions"] = serde_json::to_value(&merged)?;
            }
            log_best_effort(
                patch_status(&api, name, json!({"status": status})).await,
                "schedule status patch",
            );
            return Ok(Action::requeue(std::time::Duration::from_secs(
                VALIDATION_REQUEUE_SECS,
            )));
        }
    }

    let (concurrent_jobs, concurrent_detail) =
        check_concurrent_jobs(ctx.client.clone(), namespace, uid).await;

    let observation = ScheduleObservation {
        cronjob_exists: true,
        playbook_ready,
        concurrency_policy: schedule.spec.concurrency_policy.unwrap_or_default(),
        concurrent_jobs,
        concurrent_detail,
    };
    let (merged, changed) = merge_conditions(&existing_conditions, desired_schedule_conditions(&observation));

    let mut status = json!({"computedSchedule": computed});
    if !changed.is_empty() {
        status["conditions"] = serde_json::to_value(&merged)?;
    }
    if let Some(next_run) =
        observed_next_run(ctx.client.clone(), namespace, &cronjob_name).await
    {
        let published = schedule
            .status
            .as_ref()
            .and_then(|s| s.next_run_time.as_deref());
        if published != Some(next_run.as_str()) {
            status["nextRunTime"] = json!(next_run);
        }
    }
    log_best_effort(
        patch_status(&api, name, json!({"status": status})).await,
        "schedule status patch",
    );

    for condition in &changed {
        log_best_effort(
            emit_event(
                ctx.client.clone(),
                "Schedule",
                namespace,
                name,
                &condition.reason,
                &condition.message,
                condition_event_type(condition),
            )
            .await,
            "schedule condition event",
        );
    }

    ctx.deps
        .index_playbook_dependencies(ctx.client.clone(), namespace, &playbook_ref.name)
        .await;

    ctx.reset_backoff(namespace, name);
    Ok(Action::requeue(std::time::Duration::from_secs(
        PERIODIC_REQUEUE_SECS,
    )))
}

enum Applied {
    Done,
    AdoptionRefused(String),
}

/// Create-then-adopt flow for the CronJob. On a name conflict the adoption
/// safety check decides between patching and refusing; a CronJob that
/// disappears between the conflict and the read is retried once.
async fn apply_cronjob(
    ctx: &Context,
    api: &Api<CronJob>,
    manifest: &CronJob,
    namespace: &str,
    name: &str,
    uid: &str,
) -> Result<Applied> {
    let cronjob_name = manifest.name_any();
    match api.create(&PostParams::default(), manifest).await {
        Ok(_) => {
            info!(resource = %format!("{namespace}/{name}"), cronjob = %cronjob_name, "cronjob created");
            log_best_effort(
                emit_event(
                    ctx.client.clone(),
                    "Schedule",
                    namespace,
                    name,
                    "CronJobCreated",
                    &format!("CronJob '{cronjob_name}' created"),
                    EventType::Normal,
                )
                .await,
                "schedule event",
            );
            Ok(Applied::Done)
        }
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
            match api.get(&cronjob_name).await {
                Ok(existing) => match can_adopt_cronjob(&existing, uid, name) {
                    Adoption::Adopt { reason } => {
                        api.patch(
                            &cronjob_name,
                            &PatchParams::apply(FIELD_MANAGER).force(),
                            &Patch::Apply(manifest),
                        )
                        .await?;
                        info!(
                            resource = %format!("{namespace}/{name}"),
                            cronjob = %cronjob_name,
                            adoption_reason = reason,
                            "cronjob adopted and patched"
                        );
                        log_best_effort(
                            emit_event(
                                ctx.client.clone(),
                                "Schedule",
                                namespace,
                                name,
                                "CronJobAdopted",
                                &format!("CronJob '{cronjob_name}' adopted and patched"),
                                EventType::Normal,
                            )
                            .await,
                            "schedule event",
                        );
                        Ok(Applied::Done)
                    }
                    Adoption::Refuse { reason } => {
                        warn!(
                            resource = %format!("{namespace}/{name}"),
                            cronjob = %cronjob_name,
                            adoption_reason = %reason,
                            "cannot safely adopt existing cronjob"
                        );
                        log_best_effort(
                            emit_event(
                                ctx.client.clone(),
                                "Schedule",
                                namespace,
                                name,
                                "CronJobAdoptionSkipped",
                                &format!("Cannot safely adopt CronJob '{cronjob_name}': {reason}"),
                                EventType::Warning,
                            )
                            .await,
                            "schedule event",
                        );
                        Ok(Applied::AdoptionRefused(reason))
                    }
                },
                // Disappeared between conflict and read; try once more.
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                    api.create(&PostParams::default(), manifest).await?;
                    log_best_effort(
                        emit_event(
                            ctx.client.clone(),
                            "Schedule",
                            namespace,
                            name,
                            "CronJobCreated",
                            &format!("CronJob '{cronjob_name}' created (retry)"),
                            EventType::Normal,
                        )
                        .await,
                        "schedule event",
                    );
                    Ok(Applied::Done)
                }
                Err(err) => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

async fn fetch_playbook(ctx: &Context, namespace: &str, name: &str) -> Option<Playbook> {
    let api: Api<Playbook> = Api::namespaced(ctx.client.clone(), namespace);
    api.get(name).await.ok()
}

fn playbook_is_ready(playbook: &Playbook) -> bool {
    let conditions = playbook
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    find_condition(conditions, COND_READY).is_some_and(|c| c.status == "True")
}

fn empty_playbook_spec() -> PlaybookSpec {
    PlaybookSpec {
        repository_ref: Default::default(),
        playbook_path: String::new(),
        inventory_path: None,
        inventory_paths: None,
        ansible_cfg_path: None,
        extra_vars: None,
        execution: None,
        secrets: None,
        runtime: None,
    }
}

/// Best-effort fetch of the Repository behind the Playbook, plus a check
/// that the referenced known-hosts ConfigMap actually exists. A missing
/// ConfigMap under strict host-key checking gets a Warning event; the
/// CronJob is still rendered and will fail closed inside the pod.
async fn fetch_repository_context(
    ctx: &Context,
    namespace: &str,
    schedule_name: &str,
    playbook_spec: &PlaybookSpec,
) -> (Option<RepositorySpec>, bool) {
    let repo_ref = &playbook_spec.repository_ref;
    if repo_ref.name.is_empty() {
        return (None, false);
    }
    let api: Api<Repository> = Api::namespaced(ctx.client.clone(), namespace);
    let Ok(repository) = api.get(&repo_ref.name).await else {
        return (None, false);
    };

    let ssh = repository.spec.ssh.clone().unwrap_or_default();
    let Some(cm_ref) = &ssh.known_hosts_config_map_ref else {
        return (Some(repository.spec), false);
    };

    let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    match cm_api.get(&cm_ref.name).await {
        Ok(_) => (Some(repository.spec), true),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            if ssh.strict_host_key_checking {
                log_best_effort(
                    emit_event(
                        ctx.client.clone(),
                        "Schedule",
                        namespace,
                        schedule_name,
                        "ConfigMapNotFound",
                        &format!(
                            "SSH known hosts ConfigMap '{}' not found - pod will fail with strict checking",
                            cm_ref.name
                        ),
                        EventType::Warning,
                    )
                    .await,
                    "schedule event",
                );
            }
            (Some(repository.spec), false)
        }
        Err(_) => (Some(repository.spec), false),
    }
}

/// Reads the CronJob's observed `nextScheduleTime`. The field is not part
/// of the typed batch/v1 status, so the object is fetched dynamically; on
/// clusters that do not report it this returns `None` and `nextRunTime` is
/// left alone.
pub(crate) async fn observed_next_run(
    client: kube::Client,
    namespace: &str,
    cronjob_name: &str,
) -> Option<String> {
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", "CronJob"));
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &resource);
    let cronjob = api.get(cronjob_name).await.ok()?;
    cronjob.data["status"]["nextScheduleTime"]
        .as_str()
        .map(String::from)
}

#[allow(clippy::too_many_arguments)]
async fn handle_manual_run(
    schedule: &Schedule,
    ctx: &Context,
    api: &Api<Schedule>,
    namespace: &str,
    name: &str,
    uid: &str,
    playbook_spec: &PlaybookSpec,
    repository_spec: Option<&RepositorySpec>,
    known_hosts_available: bool,
) {
    let Some(run_id) = schedule
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_RUN_NOW))
    else {
        return;
    };

    if !run_id.is_empty() {
        let outcome = manual_run::execute(
            ctx,
            &ManualRunRequest {
                owner_kind: "Schedule",
                owner_name: name,
                namespace,
                owner_uid: uid,
                run_id,
                playbook_name: &schedule.spec.playbook_ref.name,
                playbook_spec,
                repository_spec,
                known_hosts_available,
            },
        )
        .await;
        log_best_effort(
            patch_status(api, name, json!({"status": {"lastManualRun": outcome}})).await,
            "manual-run status patch",
        );
    }

    log_best_effort(
        manual_run::clear_annotation(api, name).await,
        "run-now annotation clear",
    );
}
