//! Playbook reconciler.
//!
//! Validates the reference chain (Playbook -> Repository), checks the
//! referenced paths against an out-of-band clone and serves manual-run
//! requests. Readiness of the upstream Repository is read off its `Ready`
//! condition rather than re-probed.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::error::ErrorResponse;
use kube_runtime::controller::Action;
use serde_json::json;
use tracing::info;

use crate::constants::{
    ANNOTATION_RUN_NOW, COND_READY, PERIODIC_REQUEUE_SECS, VALIDATION_REQUEUE_SECS,
};
use crate::crd::status::{find_condition, Condition};
use crate::crd::{Playbook, Repository, RepositorySpec};
use crate::dependencies::UpstreamKind;
use crate::observability::metrics;

use super::conditions::merge_conditions;
use super::events::{emit_event, log_best_effort, EventType};
use super::manual_run::{self, ManualRunRequest};
use super::{patch_status, Context, Error, Result};

pub async fn reconcile(playbook: Arc<Playbook>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&playbook, &ctx).await;
    metrics::observe_reconcile_duration("Playbook", started.elapsed().as_secs_f64());
    match &result {
        Ok(_) => metrics::inc_reconcile("Playbook", "success"),
        Err(_) => metrics::inc_reconcile("Playbook", "error"),
    }
    result
}

async fn reconcile_inner(playbook: &Playbook, ctx: &Context) -> Result<Action> {
    let name = playbook
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingMetadata("name"))?;
    let namespace = playbook
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingMetadata("namespace"))?;
    let uid = playbook
        .metadata
        .uid
        .as_deref()
        .ok_or(Error::MissingMetadata("uid"))?;

    info!(resource = %format!("{namespace}/{name}"), uid, "reconciling playbook");

    let api: Api<Playbook> = Api::namespaced(ctx.client.clone(), namespace);

    if playbook.metadata.deletion_timestamp.is_some() {
        ctx.deps.cleanup(namespace, UpstreamKind::Playbook, name);
        return Ok(Action::await_change());
    }

    handle_manual_run(playbook, ctx, &api, namespace, name, uid).await;

    let existing = playbook
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let outcome = validate(playbook, ctx, namespace).await?;

    let (condition, event_reason, event_message, event_type, action) = match outcome {
        Validated::Failed { reason, message, event_message } => (
            Condition::new(COND_READY, "False", &reason, &message),
            "ValidateFailed",
            event_message,
            EventType::Warning,
            Action::requeue(std::time::Duration::from_secs(VALIDATION_REQUEUE_SECS)),
        ),
        Validated::Ok => (
            Condition::new(
                COND_READY,
                "True",
                "Validated",
                "Playbook paths and repository validated successfully",
            ),
            "ValidateSucceeded",
            "Playbook validation completed successfully".to_string(),
            EventType::Normal,
            Action::requeue(std::time::Duration::from_secs(PERIODIC_REQUEUE_SECS)),
        ),
    };

    let (merged, changed) = merge_conditions(&existing, vec![condition]);
    if !changed.is_empty() {
        log_best_effort(
            patch_status(&api, name, json!({"status": {"conditions": merged}})).await,
            "playbook status patch",
        );
        log_best_effort(
            emit_event(
                ctx.client.clone(),
                "Playbook",
                namespace,
                name,
                event_reason,
                &event_message,
                event_type,
            )
            .await,
            "playbook event",
        );
    }

    // Keep both index directions fresh: this Playbook as a dependent of its
    // Repository, and its own Schedules as dependents. A readiness change
    // then fans out to Schedules.
    let repo_ref = &playbook.spec.repository_ref;
    if !repo_ref.name.is_empty()
        && repo_ref.namespace.as_deref().is_none_or(|ns| ns == namespace)
    {
        ctx.deps
            .index_repository_dependencies(ctx.client.clone(), namespace, &repo_ref.name)
            .await;
    }
    ctx.deps
        .index_playbook_dependencies(ctx.client.clone(), namespace, name)
        .await;
    if !changed.is_empty() {
        ctx.deps
            .requeue_dependent_schedules(ctx.client.clone(), namespace, name)
            .await;
    }

    ctx.reset_backoff(namespace, name);
    Ok(action)
}

enum Validated {
    Ok,
    Failed {
        reason: String,
        message: String,
        event_message: String,
    },
}

impl Validated {
    fn failed(reason: &str, message: impl Into<String>, event_message: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.to_string(),
            message: message.into(),
            event_message: event_message.into(),
        }
    }
}

async fn validate(playbook: &Playbook, ctx: &Context, namespace: &str) -> Result<Validated> {
    let repo_ref = &playbook.spec.repository_ref;
    if repo_ref.name.is_empty() {
        return Ok(Validated::failed(
            "RepoRefMissing",
            "spec.repositoryRef.name must be set",
            "spec.repositoryRef.name must be set",
        ));
    }
    if playbook.spec.playbook_path.is_empty() {
        return Ok(Validated::failed(
            "InvalidPath",
            "spec.playbookPath must be set",
            "spec.playbookPath must be set",
        ));
    }

    let repo_namespace = repo_ref.namespace.as_deref().unwrap_or(namespace);
    let repo_api: Api<Repository> = Api::namespaced(ctx.client.clone(), repo_namespace);
    let repository = match repo_api.get(&repo_ref.name).await {
        Ok(repository) => repository,
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            let message = format!("Repository {} not found", repo_ref.name);
            return Ok(Validated::failed("RepoNotReady", message.clone(), message));
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(message) = repository_not_ready(&repository) {
        return Ok(Validated::failed(
            "RepoNotReady",
            message.clone(),
            format!("Repository not ready: {message}"),
        ));
    }

    let validation = ctx
        .git
        .validate_paths(&repository.spec, &playbook.spec)
        .await;
    if !validation.is_valid() {
        let message = validation.message().to_string();
        return Ok(Validated::failed(
            "InvalidPath",
            message.clone(),
            format!("Path validation failed: {message}"),
        ));
    }

    Ok(Validated::Ok)
}

/// Returns the not-ready detail, or `None` when the Repository's Ready
/// condition is True.
fn repository_not_ready(repository: &Repository) -> Option<String> {
    let conditions = repository
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    match find_condition(conditions, COND_READY) {
        None => Some("Repository Ready condition not found".to_string()),
        Some(ready) if ready.status != "True" => Some(format!(
            "Repository not ready: {} - {}",
            ready.reason, ready.message
        )),
        Some(_) => None,
    }
}

async fn handle_manual_run(
    playbook: &Playbook,
    ctx: &Context,
    api: &Api<Playbook>,
    namespace: &str,
    name: &str,
    uid: &str,
) {
    let Some(run_id) = playbook
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_RUN_NOW))
    else {
        return;
    };

    if !run_id.is_empty() {
        let (repository_spec, known_hosts_available) =
            fetch_repository_context(playbook, ctx, namespace).await;
        let outcome = manual_run::execute(
            ctx,
            &ManualRunRequest {
                owner_kind: "Playbook",
                owner_name: name,
                namespace,
                owner_uid: uid,
                run_id,
                playbook_name: name,
                playbook_spec: &playbook.spec,
                repository_spec: repository_spec.as_ref(),
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

/// Best-effort fetch of the Repository spec and known-hosts availability
/// for manifest rendering. A missing Repository renders a Job without git
/// credentials rather than failing the manual run.
async fn fetch_repository_context(
    playbook: &Playbook,
    ctx: &Context,
    namespace: &str,
) -> (Option<RepositorySpec>, bool) {
    let repo_ref = &playbook.spec.repository_ref;
    if repo_ref.name.is_empty() {
        return (None, false);
    }
    let repo_namespace = repo_ref.namespace.as_deref().unwrap_or(namespace);
    let repo_api: Api<Repository> = Api::namespaced(ctx.client.clone(), repo_namespace);
    let Ok(repository) = repo_api.get(&repo_ref.name).await else {
        return (None, false);
    };

    let known_hosts_available = match repository
        .spec
        .ssh
        .as_ref()
        .and_then(|s| s.known_hosts_config_map_ref.as_ref())
    {
        Some(cm_ref) => {
            let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
            cm_api.get(&cm_ref.name).await.is_ok()
        }
        None => false,
    };
    (Some(repository.spec), known_hosts_available)
}
