//! Manual-run Job for Playbooks and Schedules.
//!
//! Rendered when a resource carries the run-now annotation. The run id is
//! stamped as a label so a re-delivered annotation never creates a second
//! Job for the same run.

use k8s_openapi::api::batch::v1::Job;
use serde_json::json;

use super::{
    config_map_volume, default_container_security, default_pod_security, empty_dir_volume,
    mount, owner_labels, owner_reference, pin_image, read_only_mount, secret_volume,
};
use crate::constants::{LABEL_RUN_ID, LABEL_RUN_TYPE, RUN_TYPE_MANUAL};
use crate::crd::{AuthMethod, PlaybookSpec, RepositorySpec};

/// Inputs for [`build`]. `owner_kind`/`owner_name` allow a Schedule to own
/// the Job when the run was requested on a Schedule.
#[derive(Debug)]
pub struct ManualRunParams<'a> {
    pub playbook_name: &'a str,
    pub namespace: &'a str,
    pub playbook_spec: &'a PlaybookSpec,
    pub repository_spec: Option<&'a RepositorySpec>,
    pub known_hosts_available: bool,
    pub run_id: &'a str,
    pub owner_uid: &'a str,
    pub owner_kind: &'a str,
    pub owner_name: &'a str,
    pub image_default: &'a str,
    pub image_digest: Option<&'a str>,
    pub executor_service_account: Option<&'a str>,
}

/// Renders the manual-run Job manifest. Pure; does not talk to the API
/// server.
pub fn build(p: &ManualRunParams<'_>) -> Result<Job, serde_json::Error> {
    let spec = p.playbook_spec;
    let runtime = spec.runtime.clone().unwrap_or_default();
    let vault_ref = spec
        .secrets
        .as_ref()
        .and_then(|s| s.vault_password_secret_ref.as_ref());

    let image = pin_image(
        runtime.image.as_deref().unwrap_or(p.image_default),
        p.image_digest,
    );

    let mut volumes = vec![empty_dir_volume("workspace"), empty_dir_volume("home")];
    let mut volume_mounts = vec![mount("workspace", "/workspace"), mount("home", "/home/ansible")];

    if let Some(repo) = p.repository_spec {
        let auth_method = repo.auth.as_ref().and_then(|a| a.method);
        let auth_secret = repo
            .auth
            .as_ref()
            .and_then(|a| a.secret_ref.as_ref())
            .map(|r| r.name.as_str());
        if auth_method == Some(AuthMethod::Ssh) {
            if let Some(secret) = auth_secret {
                volumes.push(secret_volume("ssh-auth", secret));
                volume_mounts.push(read_only_mount("ssh-auth", "/home/ansible/.ssh"));
            }
        }
        let known_hosts_cm = repo
            .ssh
            .as_ref()
            .and_then(|s| s.known_hosts_config_map_ref.as_ref());
        if let Some(cm) = known_hosts_cm {
            if p.known_hosts_available {
                volumes.push(config_map_volume("known-hosts", &cm.name));
                volume_mounts.push(json!({
                    "name": "known-hosts",
                    "mountPath": "/home/ansible/.ssh/known_hosts",
                    "subPath": "known_hosts",
                    "readOnly": true,
                }));
            }
        }
    }

    if let Some(vault) = vault_ref {
        volumes.push(secret_volume("vault-password", &vault.name));
        volume_mounts.push(json!({
            "name": "vault-password",
            "mountPath": "/home/ansible/.vault-password",
            "subPath": "password",
            "readOnly": true,
        }));
    }

    let inventory_arg = if let Some(path) = &spec.inventory_path {
        format!("-i /workspace/repo/{path}")
    } else if let Some(paths) = spec.inventory_paths.as_ref().filter(|p| !p.is_empty()) {
        let joined = paths
            .iter()
            .map(|p| format!("/workspace/repo/{p}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("-i {joined}")
    } else {
        "-i /workspace/repo/inventory".to_string()
    };

    let mut parts = vec!["ansible-playbook".to_string(), inventory_arg];
    parts.extend(execution_flags(spec));
    if vault_ref.is_some() {
        parts.push("--vault-password-file /home/ansible/.vault-password".to_string());
    }
    parts.push(spec.playbook_path.clone());
    let command = format!("cd /workspace/repo && {}", parts.join(" "));

    let mut labels = owner_labels(p.owner_kind, p.namespace, p.owner_name, p.owner_uid);
    labels[LABEL_RUN_ID] = json!(p.run_id);
    labels[LABEL_RUN_TYPE] = json!(RUN_TYPE_MANUAL);

    let run_suffix: String = p.run_id.chars().take(8).collect();
    let job_name = format!("{}-manual-{run_suffix}", p.playbook_name);

    let mut container = json!({
        "name": "ansible-runner",
        "image": image,
        "command": ["/bin/bash", "-c", command],
        "securityContext": default_container_security(),
        "volumeMounts": volume_mounts,
    });
    if let Some(resources) = &runtime.resources {
        container["resources"] = serde_json::to_value(resources)?;
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "securityContext": default_pod_security(),
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

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name,
            "namespace": p.namespace,
            "labels": labels.clone(),
            "ownerReferences": [owner_reference(p.owner_kind, p.owner_name, p.owner_uid)],
        },
        "spec": {
            "backoffLimit": 3,
            "ttlSecondsAfterFinished": 3600,
            "template": {
                "metadata": {"labels": labels},
                "spec": pod_spec,
            },
        },
    }))
}

/// `ansible-playbook` flags derived from `spec.execution`. Flags are only
/// emitted when set; `strategy` is skipped for `linear`, the Ansible
/// default.
pub(crate) fn execution_flags(spec: &PlaybookSpec) -> Vec<String> {
    let execution = spec.execution.clone().unwrap_or_default();
    let mut flags = Vec::new();

    if let Some(tags) = execution.tags.as_ref().filter(|t| !t.is_empty()) {
        flags.push(format!("--tags {}", tags.join(",")));
    }
    if let Some(skip) = execution.skip_tags.as_ref().filter(|t| !t.is_empty()) {
        flags.push(format!("--skip-tags {}", skip.join(",")));
    }
    if execution.check_mode {
        flags.push("--check".to_string());
    }
    if execution.diff {
        flags.push("--diff".to_string());
    }
    if execution.verbosity > 0 {
        flags.push(format!("-{}", "v".repeat(usize::from(execution.verbosity))));
    }
    if let Some(limit) = &execution.limit {
        flags.push(format!("--limit {limit}"));
    }
    if let Some(timeout) = execution.connection_timeout {
        flags.push(format!("--timeout {timeout}"));
    }
    if let Some(forks) = execution.forks {
        flags.push(format!("--forks {forks}"));
    }
    if let Some(strategy) = execution.strategy.as_ref().filter(|s| *s != "linear") {
        flags.push(format!("--strategy {strategy}"));
    }
    if execution.flush_cache {
        flags.push("--flush-cache".to_string());
    }
    if execution.force_handlers {
        flags.push("--force-handlers".to_string());
    }
    if let Some(task) = &execution.start_at_task {
        flags.push(format!("--start-at-task {task}"));
    }
    if execution.step {
        flags.push("--step".to_string());
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExecutionOptions, NameRef, ObjectRef, SecretsConfig};

    fn base_spec() -> PlaybookSpec {
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

    fn params<'a>(spec: &'a PlaybookSpec, run_id: &'a str) -> ManualRunParams<'a> {
        ManualRunParams {
            playbook_name: "deploy",
            namespace: "default",
            playbook_spec: spec,
            repository_spec: None,
            known_hosts_available: false,
            run_id,
            owner_uid: "uid-1",
            owner_kind: "Playbook",
            owner_name: "deploy",
            image_default: "kenchrcum/ansible-runner:latest",
            image_digest: None,
            executor_service_account: None,
        }
    }

    fn container_command(job: &Job) -> String {
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        pod.containers[0].command.as_ref().unwrap()[2].clone()
    }

    #[test]
    fn job_name_uses_truncated_run_id() {
        let spec = base_spec();
        let job = build(&params(&spec, "0123456789abcdef")).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("deploy-manual-01234567"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(LABEL_RUN_ID).map(String::as_str),
            Some("0123456789abcdef")
        );
        assert_eq!(
            labels.get(LABEL_RUN_TYPE).map(String::as_str),
            Some(RUN_TYPE_MANUAL)
        );
    }

    #[test]
    fn default_inventory_when_none_configured() {
        let spec = base_spec();
        let job = build(&params(&spec, "run1")).unwrap();
        assert!(container_command(&job).contains("-i /workspace/repo/inventory"));
    }

    #[test]
    fn single_inventory_path_takes_precedence() {
        let mut spec = base_spec();
        spec.inventory_path = Some("inv/prod".to_string());
        spec.inventory_paths = Some(vec!["inv/a".to_string(), "inv/b".to_string()]);
        let job = build(&params(&spec, "run1")).unwrap();
        let cmd = container_command(&job);
        assert!(cmd.contains("-i /workspace/repo/inv/prod"));
        assert!(!cmd.contains("inv/a"));
    }

    #[test]
    fn execution_flags_are_forwarded() {
        let mut spec = base_spec();
        spec.execution = Some(ExecutionOptions {
            tags: Some(vec!["setup".to_string(), "deploy".to_string()]),
            check_mode: true,
            verbosity: 2,
            strategy: Some("linear".to_string()),
            forks: Some(10),
            ..ExecutionOptions::default()
        });
        let job = build(&params(&spec, "run1")).unwrap();
        let cmd = container_command(&job);
        assert!(cmd.contains("--tags setup,deploy"));
        assert!(cmd.contains("--check"));
        assert!(cmd.contains("-vv"));
        assert!(cmd.contains("--forks 10"));
        assert!(!cmd.contains("--strategy"));
    }

    #[test]
    fn verbosity_renders_uncapped() {
        let mut spec = base_spec();
        spec.execution = Some(ExecutionOptions {
            verbosity: 6,
            ..ExecutionOptions::default()
        });
        let job = build(&params(&spec, "run1")).unwrap();
        let cmd = container_command(&job);
        assert!(cmd.contains(" -vvvvvv "));
        assert!(!cmd.contains("-vvvvvvv"));
    }

    #[test]
    fn vault_secret_adds_mount_and_flag() {
        let mut spec = base_spec();
        spec.secrets = Some(SecretsConfig {
            vault_password_secret_ref: Some(NameRef {
                name: "vault-pass".to_string(),
            }),
            env: None,
            env_from_secret_refs: None,
        });
        let job = build(&params(&spec, "run1")).unwrap();
        assert!(container_command(&job)
            .contains("--vault-password-file /home/ansible/.vault-password"));
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "vault-password"));
    }
}
