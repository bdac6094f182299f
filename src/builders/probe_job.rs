//! Connectivity-probe Job for Repositories.
//!
//! The probe runs `git ls-remote <url> HEAD` with the repository's
//! credentials. `backoffLimit: 0` fails fast and `ttlSecondsAfterFinished`
//! keeps finished probes from accumulating.

use k8s_openapi::api::batch::v1::Job;
use serde_json::json;

use super::{
    config_map_volume, default_container_security, default_pod_security, empty_dir_volume,
    git_auth_setup, mount, owner_labels, owner_reference, pin_image, read_only_mount,
    secret_env_var, secret_volume,
};
use crate::constants::{LABEL_PROBE_TYPE, PROBE_TYPE_CONNECTIVITY};
use crate::crd::{AuthMethod, RepositorySpec};

/// Renders the probe Job manifest. Pure; does not talk to the API server.
pub fn build(
    repository_name: &str,
    namespace: &str,
    spec: &RepositorySpec,
    owner_uid: &str,
    image_default: &str,
    image_digest: Option<&str>,
    executor_service_account: Option<&str>,
) -> Result<Job, serde_json::Error> {
    let auth_method = spec.auth.as_ref().and_then(|a| a.method);
    let auth_secret = spec
        .auth
        .as_ref()
        .and_then(|a| a.secret_ref.as_ref())
        .map(|r| r.name.as_str());
    let ssh = spec.ssh.clone().unwrap_or_default();
    let known_hosts_cm = ssh
        .known_hosts_config_map_ref
        .as_ref()
        .map(|r| r.name.as_str());

    let mut volumes = vec![empty_dir_volume("workspace"), empty_dir_volume("home")];
    let mut volume_mounts = vec![mount("workspace", "/workspace"), mount("home", "/home/ansible")];
    let mut env = Vec::new();

    if auth_method == Some(AuthMethod::Ssh) {
        if let Some(secret) = auth_secret {
            volumes.push(secret_volume("ssh-auth", secret));
            volume_mounts.push(read_only_mount("ssh-auth", "/ssh-auth"));
        }
    }
    if let Some(cm) = known_hosts_cm {
        if ssh.strict_host_key_checking {
            volumes.push(config_map_volume("ssh-known", cm));
            volume_mounts.push(read_only_mount("ssh-known", "/ssh-knownhosts"));
        }
    }
    if auth_method == Some(AuthMethod::Token) {
        if let Some(secret) = auth_secret {
            env.push(secret_env_var("REPO_TOKEN", secret, "token"));
        }
    }

    let repo_url = spec.url.as_str();
    let mut script = vec![
        "set -euo pipefail".to_string(),
        "export HOME=/home/ansible".to_string(),
    ];
    script.extend(git_auth_setup(
        auth_method,
        ssh.strict_host_key_checking,
        known_hosts_cm.is_some(),
        repo_url,
    ));
    script.push(format!("echo 'Testing connectivity to {repo_url}'"));
    script.push(format!("git ls-remote \"{repo_url}\" HEAD"));
    script.push("echo 'Connectivity test successful'".to_string());

    let mut labels = owner_labels("Repository", namespace, repository_name, owner_uid);
    labels[LABEL_PROBE_TYPE] = json!(PROBE_TYPE_CONNECTIVITY);

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "securityContext": default_pod_security(),
        "containers": [{
            "name": "connectivity-probe",
            "image": pin_image(image_default, image_digest),
            "securityContext": default_container_security(),
            "volumeMounts": volume_mounts,
            "command": ["/bin/bash", "-c"],
            "args": [script.join("\n")],
        }],
        "volumes": volumes,
    });
    if let Some(sa) = executor_service_account {
        pod_spec["serviceAccountName"] = json!(sa);
    }
    if !env.is_empty() {
        pod_spec["containers"][0]["env"] = json!(env);
    }

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": format!("{repository_name}-probe"),
            "namespace": namespace,
            "labels": labels,
            "ownerReferences": [owner_reference("Repository", repository_name, owner_uid)],
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": 300,
            "template": {"spec": pod_spec},
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NameRef, RepositoryAuth, SshConfig};

    fn ssh_spec(known_hosts: Option<&str>, strict: bool) -> RepositorySpec {
        RepositorySpec {
            url: "git@github.com:acme/infra.git".to_string(),
            auth: Some(RepositoryAuth {
                method: Some(AuthMethod::Ssh),
                secret_ref: Some(NameRef {
                    name: "deploy-key".to_string(),
                }),
            }),
            ssh: Some(SshConfig {
                known_hosts_config_map_ref: known_hosts.map(|n| NameRef {
                    name: n.to_string(),
                }),
                strict_host_key_checking: strict,
            }),
            ..RepositorySpec::default()
        }
    }

    fn container_script(job: &Job) -> String {
        let spec = job.spec.as_ref().unwrap();
        let pod = spec.template.spec.as_ref().unwrap();
        pod.containers[0].args.as_ref().unwrap()[0].clone()
    }

    #[test]
    fn probe_job_has_expected_shape() {
        let job = build(
            "infra",
            "default",
            &ssh_spec(Some("known-hosts"), true),
            "uid-1",
            "kenchrcum/ansible-runner:latest",
            None,
            None,
        )
        .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("infra-probe"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(LABEL_PROBE_TYPE).map(String::as_str),
            Some(PROBE_TYPE_CONNECTIVITY)
        );
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
        assert!(container_script(&job).contains("git ls-remote"));
    }

    #[test]
    fn strict_without_known_hosts_renders_failing_script() {
        let job = build(
            "infra",
            "default",
            &ssh_spec(None, true),
            "uid-1",
            "img:latest",
            None,
            None,
        )
        .unwrap();
        let script = container_script(&job);
        assert!(script
            .contains("known_hosts not provided while strictHostKeyChecking=true"));
        assert!(script.contains("exit 1"));
    }

    #[test]
    fn digest_pins_default_image() {
        let job = build(
            "infra",
            "default",
            &ssh_spec(None, false),
            "uid-1",
            "kenchrcum/ansible-runner:latest",
            Some("sha256:abc"),
            None,
        )
        .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("kenchrcum/ansible-runner@sha256:abc")
        );
    }

    #[test]
    fn executor_service_account_is_set_when_configured() {
        let job = build(
            "infra",
            "default",
            &ssh_spec(None, false),
            "uid-1",
            "img:latest",
            None,
            Some("ansible-executor"),
        )
        .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("ansible-executor"));
    }

    #[test]
    fn token_auth_exposes_repo_token_env() {
        let spec = RepositorySpec {
            url: "https://github.com/acme/infra.git".to_string(),
            auth: Some(RepositoryAuth {
                method: Some(AuthMethod::Token),
                secret_ref: Some(NameRef {
                    name: "gh-token".to_string(),
                }),
            }),
            ..RepositorySpec::default()
        };
        let job = build("infra", "default", &spec, "uid-1", "img:latest", None, None).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "REPO_TOKEN"));
    }
}
