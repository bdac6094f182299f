//! CronJob builder for Schedules.
//!
//! The rendered container clones the repository, checks out the pinned
//! revision or branch, installs Galaxy requirements when present and runs
//! `ansible-playbook`. CronJob tuning knobs from the Schedule spec are only
//! emitted when explicitly set.

use k8s_openapi::api::batch::v1::CronJob;
use serde_json::json;

use super::{
    config_map_volume, default_container_security, empty_dir_volume, git_auth_setup, mount,
    owner_labels, owner_reference, pin_image, read_only_mount, secret_env_var, secret_volume,
};
use crate::builders::run_job::execution_flags;
use crate::constants::{ANNOTATION_OWNER_UID, ANNOTATION_REVISION};
use crate::crd::{AuthMethod, PlaybookSpec, RepositorySpec, ScheduleSpec};

/// Inputs for [`build`].
#[derive(Debug)]
pub struct CronJobParams<'a> {
    pub schedule_name: &'a str,
    pub namespace: &'a str,
    /// Concrete cron expression, after macro expansion.
    pub computed_schedule: &'a str,
    pub playbook_spec: &'a PlaybookSpec,
    pub repository_spec: Option<&'a RepositorySpec>,
    /// Whether the referenced known-hosts ConfigMap actually exists.
    pub known_hosts_available: bool,
    pub schedule_spec: &'a ScheduleSpec,
    pub owner_uid: &'a str,
    pub image_default: &'a str,
    pub image_digest: Option<&'a str>,
    pub executor_service_account: Option<&'a str>,
}

/// Renders the CronJob manifest. Pure; does not talk to the API server.
pub fn build(p: &CronJobParams<'_>) -> Result<CronJob, serde_json::Error> {
    let spec = p.playbook_spec;
    let runtime = spec.runtime.clone().unwrap_or_default();
    let secrets = spec.secrets.clone().unwrap_or_default();
    let vault_ref = secrets.vault_password_secret_ref.as_ref();

    let image = pin_image(
        runtime.image.as_deref().unwrap_or(p.image_default),
        p.image_digest,
    );

    let mut env = Vec::new();
    for item in secrets.env.iter().flatten() {
        env.push(secret_env_var(
            &item.env_var_name,
            &item.secret_ref.name,
            &item.secret_ref.key,
        ));
    }
    let env_from: Vec<_> = secrets
        .env_from_secret_refs
        .iter()
        .flatten()
        .map(|r| json!({"secretRef": {"name": r.name}}))
        .collect();

    let mut volumes = vec![empty_dir_volume("workspace"), empty_dir_volume("home")];
    let mut volume_mounts = vec![mount("workspace", "/workspace"), mount("home", "/home/ansible")];

    let empty_repo = RepositorySpec::default();
    let repo = p.repository_spec.unwrap_or(&empty_repo);
    let auth_method = repo.auth.as_ref().and_then(|a| a.method);
    let auth_secret = repo
        .auth
        .as_ref()
        .and_then(|a| a.secret_ref.as_ref())
        .map(|r| r.name.as_str());
    let ssh = repo.ssh.clone().unwrap_or_default();
    let known_hosts_cm = ssh
        .known_hosts_config_map_ref
        .as_ref()
        .map(|r| r.name.as_str());

    if auth_method == Some(AuthMethod::Ssh) {
        if let Some(secret) = auth_secret {
            volumes.push(secret_volume("ssh-auth", secret));
            volume_mounts.push(read_only_mount("ssh-auth", "/ssh-auth"));
        }
    }
    if let Some(cm) = known_hosts_cm {
        if p.known_hosts_available {
            volumes.push(config_map_volume("ssh-known", cm));
            volume_mounts.push(read_only_mount("ssh-known", "/ssh-knownhosts"));
        }
    }
    if let Some(vault) = vault_ref {
        volumes.push(secret_volume("vault-password", &vault.name));
        volume_mounts.push(read_only_mount("vault-password", "/vault-password"));
    }
    if auth_method == Some(AuthMethod::Token) {
        if let Some(secret) = auth_secret {
            env.push(secret_env_var("REPO_TOKEN", secret, "token"));
        }
    }

    // PVC-backed cache for ~/.ansible when the Repository configures one.
    if let Some(cache) = &repo.cache {
        if cache.strategy.as_deref() == Some("pvc") {
            if let Some(pvc) = &cache.pvc_name {
                volumes.push(json!({
                    "name": "ansible-cache",
                    "persistentVolumeClaim": {"claimName": pvc},
                }));
                volume_mounts.push(mount("ansible-cache", "/home/ansible/.ansible"));
            }
        }
    }

    let script = build_script(p, repo, auth_method, &ssh)?;

    let mut container = json!({
        "name": "ansible-runner",
        "image": image,
        "securityContext": runtime
            .security_context
            .as_ref()
            .map_or_else(default_container_security, |cs| json!(cs)),
        "volumeMounts": volume_mounts,
        "command": ["/bin/bash", "-c"],
        "args": [script],
    });
    if let Some(resources) = &p.schedule_spec.resources {
        container["resources"] = serde_json::to_value(resources)?;
    }
    if !env.is_empty() {
        container["env"] = json!(env);
    }
    if !env_from.is_empty() {
        container["envFrom"] = json!(env_from);
    }

    let pod_labels = owner_labels("Schedule", p.namespace, p.schedule_name, p.owner_uid);
    let mut pod_metadata = json!({"labels": pod_labels.clone()});
    if let Some(revision) = &repo.revision {
        pod_metadata["annotations"] = json!({ANNOTATION_REVISION: revision});
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "securityContext": runtime
            .pod_security_context
            .as_ref()
            .map_or_else(|| json!({}), |ps| json!(ps)),
        "containers": [container],
        "volumes": volumes,
    });
    let service_account = runtime
        .service_account_name
        .as_deref()
        .or(p.executor_service_account);
    if let Some(sa) = service_account {
        pod_spec["serviceAccountName"] = json!(sa);
    }
    if let Some(pull_secrets) = runtime
        .image_pull_secrets
        .as_ref()
        .filter(|s| !s.is_empty())
    {
        pod_spec["imagePullSecrets"] = json!(pull_secrets
            .iter()
            .map(|r| json!({"name": r.name}))
            .collect::<Vec<_>>());
    }
    if let Some(selector) = runtime.node_selector.as_ref().filter(|s| !s.is_empty()) {
        pod_spec["nodeSelector"] = json!(selector);
    }

    let sched = p.schedule_spec;
    let mut job_spec = json!({
        "template": {"metadata": pod_metadata, "spec": pod_spec},
    });
    if let Some(backoff) = sched.backoff_limit {
        job_spec["backoffLimit"] = json!(backoff);
    }
    if let Some(deadline) = runtime.active_deadline_seconds {
        job_spec["activeDeadlineSeconds"] = json!(deadline);
    }
    if let Some(ttl) = sched.ttl_seconds_after_finished {
        job_spec["ttlSecondsAfterFinished"] = json!(ttl);
    }

    let mut cron_spec = json!({
        "schedule": p.computed_schedule,
        "concurrencyPolicy": sched.concurrency_policy.unwrap_or_default().as_str(),
        "jobTemplate": {"spec": job_spec},
    });
    if let Some(suspend) = sched.suspend {
        cron_spec["suspend"] = json!(suspend);
    }
    if let Some(deadline) = sched.starting_deadline_seconds {
        cron_spec["startingDeadlineSeconds"] = json!(deadline);
    }
    if let Some(limit) = sched.successful_jobs_history_limit {
        cron_spec["successfulJobsHistoryLimit"] = json!(limit);
    }
    if let Some(limit) = sched.failed_jobs_history_limit {
        cron_spec["failedJobsHistoryLimit"] = json!(limit);
    }

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": {
            "name": p.schedule_name,
            "namespace": p.namespace,
            "labels": pod_labels,
            "annotations": {ANNOTATION_OWNER_UID: p.owner_uid},
            "ownerReferences": [owner_reference("Schedule", p.schedule_name, p.owner_uid)],
        },
        "spec": cron_spec,
    }))
}

fn build_script(
    p: &CronJobParams<'_>,
    repo: &RepositorySpec,
    auth_method: Option<AuthMethod>,
    ssh: &crate::crd::SshConfig,
) -> Result<String, serde_json::Error> {
    let spec = p.playbook_spec;
    let mut lines = vec![
        "set -euo pipefail".to_string(),
        "export HOME=/home/ansible".to_string(),
    ];

    // Relative ansible.cfg paths resolve under the clone; without one Ansible
    // picks up an in-repo ansible.cfg naturally since we cd there.
    if let Some(cfg) = &spec.ansible_cfg_path {
        let resolved = if cfg.starts_with('/') {
            cfg.clone()
        } else {
            format!("/workspace/repo/{cfg}")
        };
        lines.push(format!("export ANSIBLE_CONFIG=\"{resolved}\""));
    }

    lines.extend(git_auth_setup(
        auth_method,
        ssh.strict_host_key_checking,
        p.known_hosts_available,
        &repo.url,
    ));

    lines.push(format!("git clone \"{}\" /workspace/repo", repo.url));
    lines.push("cd /workspace/repo".to_string());
    if let Some(revision) = &repo.revision {
        lines.push(format!("git checkout --detach \"{revision}\""));
    } else {
        let branch = repo.branch.as_deref().unwrap_or("main");
        lines.push(format!("git checkout \"{branch}\""));
    }

    let requirements = repo
        .paths
        .as_ref()
        .and_then(|paths| paths.requirements_file.as_deref())
        .unwrap_or("requirements.yml");
    lines.push(format!(
        "if [ -f {requirements} ]; then ansible-galaxy install -r {requirements}; fi"
    ));

    let mut parts = vec!["ansible-playbook".to_string(), spec.playbook_path.clone()];
    if let Some(path) = &spec.inventory_path {
        parts.push(format!("-i {path}"));
    }
    for path in spec.inventory_paths.iter().flatten() {
        parts.push(format!("-i {path}"));
    }
    if let Some(extra_vars) = spec.extra_vars.as_ref().filter(|v| !v.is_empty()) {
        parts.push("--extra-vars".to_string());
        parts.push(serde_json::to_string(extra_vars)?);
    }
    if spec
        .secrets
        .as_ref()
        .and_then(|s| s.vault_password_secret_ref.as_ref())
        .is_some()
    {
        parts.push("--vault-password-file /vault-password/password".to_string());
    }
    parts.extend(execution_flags(spec));

    lines.push("cd /workspace/repo".to_string());
    lines.push(parts.join(" "));
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ConcurrencyPolicy, NameRef, ObjectRef, RepositoryAuth, RuntimeConfig, SshConfig,
    };

    fn playbook_spec() -> PlaybookSpec {
        PlaybookSpec {
            repository_ref: ObjectRef {
                name: "infra".to_string(),
                namespace: None,
            },
            playbook_path: "site.yml".to_string(),
            inventory_path: None,
            inventory_paths: None,
            ansible_cfg_path: None,
            extra_vars: None,
            execution: None,
            secrets: None,
            runtime: None,
        }
    }

    fn repo_spec() -> RepositorySpec {
        RepositorySpec {
            url: "git@github.com:acme/infra.git".to_string(),
            auth: Some(RepositoryAuth {
                method: Some(AuthMethod::Ssh),
                secret_ref: Some(NameRef {
                    name: "deploy-key".to_string(),
                }),
            }),
            ssh: Some(SshConfig {
                known_hosts_config_map_ref: Some(NameRef {
                    name: "known-hosts".to_string(),
                }),
                strict_host_key_checking: true,
            }),
            ..RepositorySpec::default()
        }
    }

    fn schedule_spec() -> ScheduleSpec {
        ScheduleSpec {
            playbook_ref: ObjectRef {
                name: "deploy".to_string(),
                namespace: None,
            },
            schedule: "@daily-random".to_string(),
            suspend: None,
            concurrency_policy: None,
            backoff_limit: None,
            successful_jobs_history_limit: None,
            failed_jobs_history_limit: None,
            ttl_seconds_after_finished: None,
            starting_deadline_seconds: None,
            resources: None,
        }
    }

    fn base_params<'a>(
        playbook: &'a PlaybookSpec,
        repo: &'a RepositorySpec,
        sched: &'a ScheduleSpec,
    ) -> CronJobParams<'a> {
        CronJobParams {
            schedule_name: "nightly",
            namespace: "default",
            computed_schedule: "12 3 * * *",
            playbook_spec: playbook,
            repository_spec: Some(repo),
            known_hosts_available: true,
            schedule_spec: sched,
            owner_uid: "uid-1",
            image_default: "kenchrcum/ansible-runner:latest",
            image_digest: None,
            executor_service_account: None,
        }
    }

    fn script(cj: &CronJob) -> String {
        let job = cj.spec.as_ref().unwrap().job_template.spec.as_ref().unwrap();
        let pod = job.template.spec.as_ref().unwrap();
        pod.containers[0].args.as_ref().unwrap()[0].clone()
    }

    #[test]
    fn cronjob_named_after_schedule() {
        let (p, r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        let cj = build(&base_params(&p, &r, &s)).unwrap();
        assert_eq!(cj.metadata.name.as_deref(), Some("nightly"));
        let spec = cj.spec.as_ref().unwrap();
        assert_eq!(spec.schedule, "12 3 * * *");
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));
        assert!(spec.suspend.is_none());
        assert!(spec.starting_deadline_seconds.is_none());
    }

    #[test]
    fn optional_knobs_only_emitted_when_set() {
        let (p, r, mut s) = (playbook_spec(), repo_spec(), schedule_spec());
        s.suspend = Some(true);
        s.concurrency_policy = Some(ConcurrencyPolicy::Replace);
        s.backoff_limit = Some(2);
        s.ttl_seconds_after_finished = Some(600);
        s.successful_jobs_history_limit = Some(1);
        let cj = build(&base_params(&p, &r, &s)).unwrap();
        let spec = cj.spec.as_ref().unwrap();
        assert_eq!(spec.suspend, Some(true));
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Replace"));
        assert_eq!(spec.successful_jobs_history_limit, Some(1));
        assert!(spec.failed_jobs_history_limit.is_none());
        let job = spec.job_template.spec.as_ref().unwrap();
        assert_eq!(job.backoff_limit, Some(2));
        assert_eq!(job.ttl_seconds_after_finished, Some(600));
    }

    #[test]
    fn script_clones_and_checks_out_branch() {
        let (p, mut r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        r.branch = Some("release".to_string());
        let cj = build(&base_params(&p, &r, &s)).unwrap();
        let sh = script(&cj);
        assert!(sh.contains("git clone \"git@github.com:acme/infra.git\" /workspace/repo"));
        assert!(sh.contains("git checkout \"release\""));
        assert!(sh.contains("ansible-galaxy install -r requirements.yml"));
        assert!(sh.contains("ansible-playbook site.yml"));
    }

    #[test]
    fn pinned_revision_uses_detached_checkout() {
        let (p, mut r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        r.revision = Some("abc123".to_string());
        let cj = build(&base_params(&p, &r, &s)).unwrap();
        assert!(script(&cj).contains("git checkout --detach \"abc123\""));
        // Pinned revision is recorded on the pod template for run tracking.
        let spec = cj.spec.unwrap();
        let job = spec.job_template.spec.unwrap();
        let annotations = job.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(ANNOTATION_REVISION).map(String::as_str),
            Some("abc123")
        );
    }

    #[test]
    fn playbook_service_account_overrides_operator_default() {
        let (mut p, r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        p.runtime = Some(RuntimeConfig {
            service_account_name: Some("playbook-sa".to_string()),
            ..RuntimeConfig::default()
        });
        let mut params = base_params(&p, &r, &s);
        params.executor_service_account = Some("operator-sa");
        let cj = build(&params).unwrap();
        let pod = cj
            .spec
            .unwrap()
            .job_template
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("playbook-sa"));
    }

    #[test]
    fn operator_service_account_used_as_fallback() {
        let (p, r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        let mut params = base_params(&p, &r, &s);
        params.executor_service_account = Some("operator-sa");
        let cj = build(&params).unwrap();
        let pod = cj
            .spec
            .unwrap()
            .job_template
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("operator-sa"));
    }

    #[test]
    fn strict_ssh_without_known_hosts_fails_in_script() {
        let (p, r, s) = (playbook_spec(), repo_spec(), schedule_spec());
        let mut params = base_params(&p, &r, &s);
        params.known_hosts_available = false;
        let cj = build(&params).unwrap();
        assert!(script(&cj).contains("exit 1"));
    }
}
