//! Concurrency guards: detecting overlapping Jobs for a Schedule and
//! deciding whether a name-colliding CronJob may be adopted.

use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::warn;

use crate::constants::{
    ANNOTATION_OWNER_UID, LABEL_MANAGED_BY, LABEL_OWNER_UID, MANAGED_BY,
};

/// Whether a Job still counts against the concurrency policy. A Job with
/// neither `succeeded` nor `failed` set has not finished; pending Jobs
/// count as active so a burst of starts cannot slip past the `Forbid`
/// policy.
pub fn job_is_active(job: &Job) -> bool {
    match &job.status {
        Some(status) => {
            if status.active.unwrap_or(0) > 0 {
                return true;
            }
            status.succeeded.is_none() && status.failed.is_none()
        }
        None => true,
    }
}

/// Lists Jobs labelled with the Schedule's owner UID and reports whether
/// any are still active. API failures fail open (no block) so a transient
/// list error cannot wedge a Schedule in a blocked state.
pub async fn check_concurrent_jobs(
    client: Client,
    namespace: &str,
    owner_uid: &str,
) -> (bool, String) {
    let api: Api<Job> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("{LABEL_OWNER_UID}={owner_uid}"));
    match api.list(&params).await {
        Ok(jobs) => {
            let active: Vec<String> = jobs
                .items
                .iter()
                .filter(|j| job_is_active(j))
                .map(ResourceExt::name_any)
                .collect();
            if active.is_empty() {
                (false, String::new())
            } else {
                (true, format!("Active Jobs: {}", active.join(", ")))
            }
        }
        Err(err) => {
            warn!(%namespace, owner_uid, %err, "failed to list Jobs for concurrency check");
            (false, String::new())
        }
    }
}

/// Outcome of the CronJob adoption safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adoption {
    Adopt { reason: &'static str },
    Refuse { reason: String },
}

impl Adoption {
    pub fn reason(&self) -> &str {
        match self {
            Self::Adopt { reason } => reason,
            Self::Refuse { reason } => reason,
        }
    }
}

/// Decides whether a pre-existing CronJob that collides on name may be
/// patched by this Schedule.
///
/// An explicit managed-by claim takes precedence: a matching owner UID
/// adopts, a different one refuses so another owner's object is never
/// silently hijacked. Without the claim, a Schedule owner reference or a
/// bare owner-UID annotation (the manual-adoption escape hatch) suffice.
pub fn can_adopt_cronjob(existing: &CronJob, owner_uid: &str, owner_name: &str) -> Adoption {
    let labels = existing.labels();
    let annotations = existing.annotations();

    if labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY) {
        let existing_uid = labels
            .get(LABEL_OWNER_UID)
            .or_else(|| annotations.get(ANNOTATION_OWNER_UID));
        return match existing_uid {
            Some(uid) if uid == owner_uid => Adoption::Adopt {
                reason: "matching owner UID",
            },
            _ => Adoption::Refuse {
                reason: format!(
                    "different owner UID: existing={}, current={owner_uid}",
                    existing_uid.map(String::as_str).unwrap_or("None")
                ),
            },
        };
    }

    for reference in existing.owner_references() {
        if reference.kind == "Schedule"
            && reference.name == owner_name
            && reference.uid == owner_uid
        {
            return Adoption::Adopt {
                reason: "matching owner reference",
            };
        }
    }

    if annotations.get(ANNOTATION_OWNER_UID).map(String::as_str) == Some(owner_uid) {
        return Adoption::Adopt {
            reason: "matching UID annotation",
        };
    }

    Adoption::Refuse {
        reason: "no matching ownership indicators (labels, owner references, or UID annotation)"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    fn job(status: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "metadata": {"name": "j"},
            "spec": {"template": {"spec": {"containers": [], "restartPolicy": "Never"}}},
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn running_job_is_active() {
        assert!(job_is_active(&job(json!({"active": 1}))));
    }

    #[test]
    fn pending_job_counts_as_active() {
        // No active count yet and no terminal counters either.
        assert!(job_is_active(&job(json!({}))));
        let mut no_status = job(json!({}));
        no_status.status = None;
        assert!(job_is_active(&no_status));
    }

    #[test]
    fn finished_jobs_are_inactive() {
        assert!(!job_is_active(&job(json!({"succeeded": 1}))));
        assert!(!job_is_active(&job(json!({"failed": 1}))));
    }

    fn cronjob(metadata: serde_json::Value) -> CronJob {
        serde_json::from_value(json!({
            "metadata": metadata,
            "spec": {
                "schedule": "0 * * * *",
                "jobTemplate": {},
            },
        }))
        .unwrap()
    }

    #[test]
    fn managed_cronjob_with_matching_uid_is_adopted() {
        let cj = cronjob(json!({
            "name": "nightly",
            "labels": {
                LABEL_MANAGED_BY: MANAGED_BY,
                LABEL_OWNER_UID: "uid-1",
            },
        }));
        assert_eq!(
            can_adopt_cronjob(&cj, "uid-1", "nightly"),
            Adoption::Adopt { reason: "matching owner UID" }
        );
    }

    #[test]
    fn managed_cronjob_with_different_uid_is_refused() {
        let cj = cronjob(json!({
            "name": "nightly",
            "labels": {
                LABEL_MANAGED_BY: MANAGED_BY,
                LABEL_OWNER_UID: "uid-other",
            },
        }));
        let decision = can_adopt_cronjob(&cj, "uid-1", "nightly");
        assert_eq!(
            decision.reason(),
            "different owner UID: existing=uid-other, current=uid-1"
        );
    }

    #[test]
    fn managed_cronjob_uid_falls_back_to_annotation() {
        let cj = cronjob(json!({
            "name": "nightly",
            "labels": {LABEL_MANAGED_BY: MANAGED_BY},
            "annotations": {ANNOTATION_OWNER_UID: "uid-1"},
        }));
        assert_eq!(
            can_adopt_cronjob(&cj, "uid-1", "nightly"),
            Adoption::Adopt { reason: "matching owner UID" }
        );
    }

    #[test]
    fn owner_reference_adopts_unmanaged_cronjob() {
        let mut cj = cronjob(json!({"name": "nightly"}));
        cj.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "ansible.cloud37.dev/v1alpha1".to_string(),
            kind: "Schedule".to_string(),
            name: "nightly".to_string(),
            uid: "uid-1".to_string(),
            ..OwnerReference::default()
        }]);
        assert_eq!(
            can_adopt_cronjob(&cj, "uid-1", "nightly"),
            Adoption::Adopt { reason: "matching owner reference" }
        );
    }

    #[test]
    fn uid_annotation_is_manual_adoption_escape_hatch() {
        let cj = cronjob(json!({
            "name": "nightly",
            "annotations": {ANNOTATION_OWNER_UID: "uid-1"},
        }));
        assert_eq!(
            can_adopt_cronjob(&cj, "uid-1", "nightly"),
            Adoption::Adopt { reason: "matching UID annotation" }
        );
    }

    #[test]
    fn foreign_cronjob_is_refused() {
        let cj = cronjob(json!({"name": "nightly"}));
        let decision = can_adopt_cronjob(&cj, "uid-1", "nightly");
        assert_eq!(
            decision.reason(),
            "no matching ownership indicators (labels, owner references, or UID annotation)"
        );
    }
}
