//! Manual (ad-hoc) runs.
//!
//! A caller requests a run by setting the run-now annotation to a run id of
//! their choosing; the id doubles as the idempotency key. The annotation is
//! cleared after acting on it, success or failure, so a stale annotation
//! can never re-trigger a run. A Job already carrying the run id means the
//! annotation was re-delivered and the run is skipped.

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{info, warn};

use crate::builders::run_job::{self, ManualRunParams};
use crate::constants::{
    ANNOTATION_RUN_NOW, FIELD_MANAGER, LABEL_OWNER_UID, LABEL_RUN_ID,
};
use crate::crd::status::ManualRunStatus;
use crate::crd::{PlaybookSpec, RepositorySpec};
use crate::observability::metrics;

use super::events::BestEffortError;
use super::Context;

/// Inputs for one manual run. `owner_kind`/`owner_name` are the resource
/// the annotation was found on: a Playbook owns its runs, a Schedule owns
/// runs requested through it.
#[derive(Debug)]
pub struct ManualRunRequest<'a> {
    pub owner_kind: &'a str,
    pub owner_name: &'a str,
    pub namespace: &'a str,
    pub owner_uid: &'a str,
    pub run_id: &'a str,
    pub playbook_name: &'a str,
    pub playbook_spec: &'a PlaybookSpec,
    pub repository_spec: Option<&'a RepositorySpec>,
    pub known_hosts_available: bool,
}

/// Creates the manual-run Job and reports the outcome for
/// `status.lastManualRun`. Never returns an error; failures are folded
/// into the returned status so the reconcile pass completes and the
/// annotation gets cleared.
pub async fn execute(ctx: &Context, req: &ManualRunRequest<'_>) -> ManualRunStatus {
    let started_at = chrono::Utc::now().to_rfc3339();
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), req.namespace);

    if let Some(existing) = find_existing_run(&api, req).await {
        info!(
            namespace = %req.namespace,
            owner = %req.owner_name,
            run_id = %req.run_id,
            job = %existing,
            "manual run already has a Job, skipping"
        );
        metrics::inc_manual_run("Skipped");
        return ManualRunStatus {
            run_id: req.run_id.to_string(),
            job_ref: Some(format!("{}/{existing}", req.namespace)),
            status: "Skipped".to_string(),
            reason: Some("DuplicateRun".to_string()),
            message: Some(format!("Job for run id '{}' already exists", req.run_id)),
            start_time: Some(started_at),
            completion_time: None,
        };
    }

    let job = match run_job::build(&ManualRunParams {
        playbook_name: req.playbook_name,
        namespace: req.namespace,
        playbook_spec: req.playbook_spec,
        repository_spec: req.repository_spec,
        known_hosts_available: req.known_hosts_available,
        run_id: req.run_id,
        owner_uid: req.owner_uid,
        owner_kind: req.owner_kind,
        owner_name: req.owner_name,
        image_default: &ctx.config.runner_image,
        image_digest: ctx.config.runner_image_digest.as_deref(),
        executor_service_account: ctx.config.executor_service_account.as_deref(),
    }) {
        Ok(job) => job,
        Err(err) => {
            warn!(%err, run_id = %req.run_id, "failed to render manual-run Job");
            metrics::inc_manual_run("Failed");
            return failed(req, started_at, "RenderFailed", &err.to_string());
        }
    };
    let job_name = job.name_any();

    match api.create(&PostParams::default(), &job).await {
        Ok(_) => {
            info!(
                namespace = %req.namespace,
                owner = %req.owner_name,
                run_id = %req.run_id,
                job = %job_name,
                "manual run Job created"
            );
            metrics::inc_manual_run("Started");
            ManualRunStatus {
                run_id: req.run_id.to_string(),
                job_ref: Some(format!("{}/{job_name}", req.namespace)),
                status: "Started".to_string(),
                reason: Some("JobCreated".to_string()),
                message: Some(format!("Manual run Job '{job_name}' created")),
                start_time: Some(started_at),
                completion_time: None,
            }
        }
        // A name collision means the same run id was already materialized.
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
            metrics::inc_manual_run("Skipped");
            ManualRunStatus {
                run_id: req.run_id.to_string(),
                job_ref: Some(format!("{}/{job_name}", req.namespace)),
                status: "Skipped".to_string(),
                reason: Some("DuplicateRun".to_string()),
                message: Some(format!("Job '{job_name}' already exists")),
                start_time: Some(started_at),
                completion_time: None,
            }
        }
        Err(err) => {
            warn!(%err, run_id = %req.run_id, "failed to create manual-run Job");
            metrics::inc_manual_run("Failed");
            failed(req, started_at, "JobCreateFailed", &err.to_string())
        }
    }
}

/// Removes the run-now annotation with a merge patch. Failures are
/// non-critical; the duplicate check keeps a re-delivered annotation from
/// starting a second run.
pub async fn clear_annotation<K>(api: &Api<K>, name: &str) -> Result<(), BestEffortError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_RUN_NOW: null,
            }
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(BestEffortError::Status)?;
    Ok(())
}

async fn find_existing_run(api: &Api<Job>, req: &ManualRunRequest<'_>) -> Option<String> {
    let selector = format!(
        "{LABEL_RUN_ID}={},{LABEL_OWNER_UID}={}",
        req.run_id, req.owner_uid
    );
    match api.list(&ListParams::default().labels(&selector)).await {
        Ok(jobs) => jobs.items.first().map(ResourceExt::name_any),
        Err(err) => {
            // Fall through to create; a duplicate surfaces as a 409 there.
            warn!(%err, run_id = %req.run_id, "duplicate-run lookup failed");
            None
        }
    }
}

fn failed(
    req: &ManualRunRequest<'_>,
    started_at: String,
    reason: &str,
    message: &str,
) -> ManualRunStatus {
    ManualRunStatus {
        run_id: req.run_id.to_string(),
        job_ref: None,
        status: "Failed".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        start_time: Some(started_at),
        completion_time: Some(chrono::Utc::now().to_rfc3339()),
    }
}
