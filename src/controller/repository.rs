//! Repository reconciler.
//!
//! Validates the spec, materializes the connectivity-probe Job and parks
//! the conditions in `Unknown` until the probe Job watcher observes the
//! outcome. A finalizer guarantees the probe Job is cleaned up before the
//! Repository disappears.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use serde_json::json;
use tracing::{info, warn};

use crate::builders::probe_job;
use crate::constants::{
    COND_AUTH_VALID, COND_CLONE_READY, COND_READY, FIELD_MANAGER, FINALIZER,
    VALIDATION_REQUEUE_SECS,
};
use crate::crd::status::Condition;
use crate::crd::Repository;
use crate::dependencies::UpstreamKind;
use crate::observability::metrics;

use super::conditions::merge_conditions;
use super::events::{emit_event, log_best_effort, EventType};
use super::{finalizer_phase, patch_status, Context, Error, FinalizerPhase, Result};

pub async fn reconcile(repo: Arc<Repository>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&repo, &ctx).await;
    metrics::observe_reconcile_duration("Repository", started.elapsed().as_secs_f64());
    match &result {
        Ok(_) => metrics::inc_reconcile("Repository", "success"),
        Err(_) => metrics::inc_reconcile("Repository", "error"),
    }
    result
}

async fn reconcile_inner(repo: &Repository, ctx: &Context) -> Result<Action> {
    let name = repo.metadata.name.as_deref().ok_or(Error::MissingMetadata("name"))?;
    let namespace = repo
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingMetadata("namespace"))?;
    let uid = repo.metadata.uid.as_deref().ok_or(Error::MissingMetadata("uid"))?;

    info!(resource = %format!("{namespace}/{name}"), uid, "reconciling repository");

    let api: Api<Repository> = Api::namespaced(ctx.client.clone(), namespace);

    match finalizer_phase(&repo.metadata, FINALIZER) {
        FinalizerPhase::Cleanup => {
            cleanup(repo, ctx, &api, namespace, name).await?;
            ctx.deps.cleanup(namespace, UpstreamKind::Repository, name);
            return Ok(Action::await_change());
        }
        FinalizerPhase::Released => return Ok(Action::await_change()),
        FinalizerPhase::NeedsFinalizer => {
            let mut finalizers = repo.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            let patch = json!({"metadata": {"finalizers": finalizers}});
            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
            info!(resource = %format!("{namespace}/{name}"), "added repository finalizer");
        }
        FinalizerPhase::Active => {}
    }

    let existing = repo
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    if let Some(invalid) = validate(repo, ctx, namespace, name).await? {
        let (merged, changed) = merge_conditions(&existing, invalid.conditions);
        if !changed.is_empty() {
            log_best_effort(
                patch_status(&api, name, json!({"status": {"conditions": merged}})).await,
                "repository status patch",
            );
        }
        log_best_effort(
            emit_event(
                ctx.client.clone(),
                "Repository",
                namespace,
                name,
                "ValidateFailed",
                &invalid.event_message,
                EventType::Warning,
            )
            .await,
            "repository event",
        );
        return Ok(Action::requeue(std::time::Duration::from_secs(
            VALIDATION_REQUEUE_SECS,
        )));
    }

    let probe = apply_probe_job(repo, ctx, namespace, name, uid).await?;

    let desired = match probe {
        ProbeState::Succeeded => vec![
            Condition::new(
                COND_AUTH_VALID,
                "True",
                "ProbeSucceeded",
                "Connectivity probe successful",
            ),
            Condition::new(COND_CLONE_READY, "True", "ProbeSucceeded", "Repository clone ready"),
            Condition::new(COND_READY, "True", "Validated", "Repository is ready for use"),
        ],
        ProbeState::Failed => vec![
            Condition::new(COND_AUTH_VALID, "False", "ProbeFailed", "Connectivity probe failed"),
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
        ProbeState::Running => vec![
            Condition::new(
                COND_AUTH_VALID,
                "Unknown",
                "ProbeRunning",
                "Connectivity probe in progress",
            ),
            Condition::new(
                COND_CLONE_READY,
                "Unknown",
                "Deferred",
                "Waiting for connectivity probe",
            ),
            Condition::new(
                COND_READY,
                "Unknown",
                "Deferred",
                "Repository connectivity being probed",
            ),
        ],
    };
    let (merged, changed) = merge_conditions(&existing, desired);
    if !changed.is_empty() {
        log_best_effort(
            patch_status(&api, name, json!({"status": {"conditions": merged}})).await,
            "repository status patch",
        );
    }

    ctx.deps
        .index_repository_dependencies(ctx.client.clone(), namespace, name)
        .await;
    ctx.deps
        .requeue_dependent_playbooks(ctx.client.clone(), namespace, name)
        .await;

    ctx.reset_backoff(namespace, name);
    Ok(Action::await_change())
}

struct ValidationFailure {
    conditions: Vec<Condition>,
    event_message: String,
}

/// Spec validation short of touching the repository itself. Returns the
/// failure to report, or `None` when the spec passes.
async fn validate(
    repo: &Repository,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Option<ValidationFailure>> {
    if repo.spec.url.is_empty() {
        return Ok(Some(ValidationFailure {
            conditions: vec![
                Condition::new(COND_AUTH_VALID, "False", "MissingURL", "spec.url must be set"),
                Condition::new(COND_READY, "False", "InvalidSpec", "Repository spec invalid"),
            ],
            event_message: "Missing spec.url".to_string(),
        }));
    }

    if let Some(auth) = &repo.spec.auth {
        if auth.method.is_some() && auth.secret_ref.as_ref().is_none_or(|r| r.name.is_empty()) {
            return Ok(Some(ValidationFailure {
                conditions: vec![
                    Condition::new(
                        COND_AUTH_VALID,
                        "False",
                        "SecretMissing",
                        "auth.secretRef.name must be set when auth.method is provided",
                    ),
                    Condition::new(COND_READY, "False", "InvalidSpec", "Repository auth invalid"),
                ],
                event_message: "auth.method set but auth.secretRef.name missing".to_string(),
            }));
        }
    }

    let ssh = repo.spec.ssh.clone().unwrap_or_default();
    if ssh.strict_host_key_checking {
        if let Some(cm_ref) = &ssh.known_hosts_config_map_ref {
            let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
            match cm_api.get(&cm_ref.name).await {
                Ok(_) => {}
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                    let message =
                        format!("SSH known hosts ConfigMap '{}' not found", cm_ref.name);
                    return Ok(Some(ValidationFailure {
                        conditions: vec![
                            Condition::new(COND_AUTH_VALID, "False", "ConfigMapNotFound", &message),
                            Condition::new(
                                COND_READY,
                                "False",
                                "InvalidSpec",
                                "Repository auth invalid",
                            ),
                        ],
                        event_message: message,
                    }));
                }
                // Transient read failures do not fail validation.
                Err(err) => {
                    warn!(resource = %format!("{namespace}/{name}"), %err, "known-hosts ConfigMap read failed");
                }
            }
        }
    }

    Ok(None)
}

/// Observed state of the probe Job after the upsert.
enum ProbeState {
    Running,
    Succeeded,
    Failed,
}

/// Creates the probe Job. A 409 reads the existing Job and short-circuits
/// to its terminal state; a completed probe is never re-patched, so a
/// finished outcome survives until the next spec change recreates the Job.
async fn apply_probe_job(
    repo: &Repository,
    ctx: &Context,
    namespace: &str,
    name: &str,
    uid: &str,
) -> Result<ProbeState> {
    let job = probe_job::build(
        name,
        namespace,
        &repo.spec,
        uid,
        &ctx.config.runner_image,
        ctx.config.runner_image_digest.as_deref(),
        ctx.config.executor_service_account.as_deref(),
    )?;
    let job_name = job.name_any();

    let api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    match api.create(&PostParams::default(), &job).await {
        Ok(_) => Ok(ProbeState::Running),
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
            match api.get(&job_name).await {
                Ok(existing) => {
                    let status = existing.status.unwrap_or_default();
                    if status.succeeded.unwrap_or(0) > 0 {
                        return Ok(ProbeState::Succeeded);
                    }
                    if status.failed.unwrap_or(0) > 0 {
                        return Ok(ProbeState::Failed);
                    }
                    api.patch(
                        &job_name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(&job),
                    )
                    .await?;
                    Ok(ProbeState::Running)
                }
                // Deleted between conflict and read; try once more.
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                    api.create(&PostParams::default(), &job).await?;
                    Ok(ProbeState::Running)
                }
                Err(err) => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Finalizer cleanup: delete the probe Job, then release the finalizer and
/// report the outcome as an Event.
async fn cleanup(
    repo: &Repository,
    ctx: &Context,
    api: &Api<Repository>,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let job_name = format!("{name}-probe");
    let delete_params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..DeleteParams::default()
    };
    let cleanup_ok = match jobs.delete(&job_name, &delete_params).await {
        Ok(_) => {
            info!(resource = %format!("{namespace}/{name}"), job = %job_name, "probe job deletion initiated");
            true
        }
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            info!(resource = %format!("{namespace}/{name}"), job = %job_name, "probe job already gone");
            true
        }
        Err(err) => {
            warn!(resource = %format!("{namespace}/{name}"), job = %job_name, %err, "probe job deletion failed");
            false
        }
    };

    let finalizers: Vec<String> = repo
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    let (reason, message, event_type) = if cleanup_ok {
        (
            "CleanupSucceeded",
            "Repository finalizer cleanup completed successfully",
            EventType::Normal,
        )
    } else {
        (
            "CleanupFailed",
            "Repository finalizer cleanup completed with errors",
            EventType::Warning,
        )
    };
    log_best_effort(
        emit_event(ctx.client.clone(), "Repository", namespace, name, reason, message, event_type)
            .await,
        "repository cleanup event",
    );
    Ok(())
}
