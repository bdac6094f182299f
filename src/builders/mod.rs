//! Pure manifest builders for the workloads the operator creates.
//!
//! Each builder assembles a complete `batch/v1` manifest as JSON and
//! deserializes it into the typed `k8s-openapi` object, so every branch is
//! unit testable without an API server. Optional fields are only emitted
//! when explicitly set.

pub mod cronjob;
pub mod probe_job;
pub mod run_job;

use serde_json::{json, Value};

use crate::constants::{
    API_GROUP_VERSION, LABEL_MANAGED_BY, LABEL_OWNER_KIND, LABEL_OWNER_NAME, LABEL_OWNER_UID,
    MANAGED_BY,
};
use crate::crd::AuthMethod;

/// Pins `image` to `digest` unless it already carries one. The tag is
/// dropped when pinning.
pub(crate) fn pin_image(image: &str, digest: Option<&str>) -> String {
    match digest {
        Some(d) if !image.contains('@') => {
            let base = image.split(':').next().unwrap_or(image);
            format!("{base}@{d}")
        }
        _ => image.to_string(),
    }
}

/// Standard label set stamped on every created workload.
pub(crate) fn owner_labels(
    owner_kind: &str,
    namespace: &str,
    owner_name: &str,
    owner_uid: &str,
) -> Value {
    json!({
        LABEL_MANAGED_BY: MANAGED_BY,
        LABEL_OWNER_KIND: owner_kind,
        LABEL_OWNER_NAME: format!("{namespace}.{owner_name}"),
        LABEL_OWNER_UID: owner_uid,
    })
}

pub(crate) fn owner_reference(kind: &str, name: &str, uid: &str) -> Value {
    json!({
        "apiVersion": API_GROUP_VERSION,
        "kind": kind,
        "name": name,
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": false,
    })
}

/// Container security defaults applied when the Playbook does not override
/// them: non-root uid/gid 1000, read-only rootfs, no escalation, all
/// capabilities dropped, RuntimeDefault seccomp.
pub(crate) fn default_container_security() -> Value {
    json!({
        "runAsUser": 1000,
        "runAsGroup": 1000,
        "allowPrivilegeEscalation": false,
        "readOnlyRootFilesystem": true,
        "seccompProfile": {"type": "RuntimeDefault"},
        "capabilities": {"drop": ["ALL"]},
    })
}

pub(crate) fn default_pod_security() -> Value {
    json!({
        "runAsNonRoot": true,
        "runAsUser": 1000,
        "runAsGroup": 1000,
        "fsGroup": 1000,
        "seccompProfile": {"type": "RuntimeDefault"},
    })
}

pub(crate) fn empty_dir_volume(name: &str) -> Value {
    json!({"name": name, "emptyDir": {}})
}

pub(crate) fn secret_volume(name: &str, secret_name: &str) -> Value {
    json!({"name": name, "secret": {"secretName": secret_name}})
}

pub(crate) fn config_map_volume(name: &str, config_map_name: &str) -> Value {
    json!({"name": name, "configMap": {"name": config_map_name}})
}

pub(crate) fn mount(name: &str, path: &str) -> Value {
    json!({"name": name, "mountPath": path})
}

pub(crate) fn read_only_mount(name: &str, path: &str) -> Value {
    json!({"name": name, "mountPath": path, "readOnly": true})
}

pub(crate) fn secret_env_var(name: &str, secret_name: &str, key: &str) -> Value {
    json!({
        "name": name,
        "valueFrom": {"secretKeyRef": {"name": secret_name, "key": key}},
    })
}

/// Shell lines that prepare git authentication inside the container.
///
/// With ssh auth and strict host-key checking but no known-hosts file
/// available the script deliberately fails instead of downgrading to
/// `StrictHostKeyChecking=no`.
pub(crate) fn git_auth_setup(
    auth_method: Option<AuthMethod>,
    strict_host_key: bool,
    known_hosts_available: bool,
    repo_url: &str,
) -> Vec<String> {
    let mut lines = vec!["mkdir -p $HOME/.ssh".to_string()];
    match auth_method {
        Some(AuthMethod::Ssh) => {
            lines.push("install -m 0600 /ssh-auth/ssh-privatekey $HOME/.ssh/id_rsa".to_string());
            if strict_host_key && known_hosts_available {
                lines.push(
                    "export GIT_SSH_COMMAND=\"ssh -i $HOME/.ssh/id_rsa \
-o UserKnownHostsFile=/ssh-knownhosts/known_hosts \
-o StrictHostKeyChecking=yes\""
                        .to_string(),
                );
            } else if strict_host_key {
                lines.push(
                    "echo 'known_hosts not provided while strictHostKeyChecking=true' >&2; exit 1"
                        .to_string(),
                );
            } else {
                lines.push(
                    "export GIT_SSH_COMMAND=\"ssh -i $HOME/.ssh/id_rsa -o StrictHostKeyChecking=no\""
                        .to_string(),
                );
            }
        }
        Some(AuthMethod::Token) => {
            lines.push("GIT_HOST=github.com".to_string());
            lines.push(format!(
                "if echo \"{repo_url}\" | grep -q 'github.com'; then GIT_HOST=github.com; fi"
            ));
            lines.push("umask 077".to_string());
            lines.push(
                "printf 'machine %s login oauth2 password %s\\n' \"$GIT_HOST\" \"$REPO_TOKEN\" \
> $HOME/.netrc"
                    .to_string(),
            );
        }
        None => {}
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_image_replaces_tag_with_digest() {
        let pinned = pin_image("repo/runner:latest", Some("sha256:abc123"));
        assert_eq!(pinned, "repo/runner@sha256:abc123");
    }

    #[test]
    fn pin_image_keeps_existing_digest() {
        let image = "repo/runner@sha256:def456";
        assert_eq!(pin_image(image, Some("sha256:abc123")), image);
    }

    #[test]
    fn pin_image_no_digest_is_identity() {
        assert_eq!(pin_image("repo/runner:v2", None), "repo/runner:v2");
    }

    #[test]
    fn strict_ssh_without_known_hosts_fails_the_script() {
        let lines = git_auth_setup(Some(AuthMethod::Ssh), true, false, "git@host:x.git");
        assert!(lines.iter().any(|l| l.contains("exit 1")));
        assert!(!lines.iter().any(|l| l.contains("StrictHostKeyChecking=no")));
    }

    #[test]
    fn strict_ssh_with_known_hosts_pins_host_keys() {
        let lines = git_auth_setup(Some(AuthMethod::Ssh), true, true, "git@host:x.git");
        assert!(lines
            .iter()
            .any(|l| l.contains("UserKnownHostsFile=/ssh-knownhosts/known_hosts")));
        assert!(!lines.iter().any(|l| l.contains("exit 1")));
    }

    #[test]
    fn relaxed_ssh_disables_host_key_checking() {
        let lines = git_auth_setup(Some(AuthMethod::Ssh), false, false, "git@host:x.git");
        assert!(lines.iter().any(|l| l.contains("StrictHostKeyChecking=no")));
    }

    #[test]
    fn token_auth_writes_netrc() {
        let lines = git_auth_setup(Some(AuthMethod::Token), true, false, "https://github.com/x");
        assert!(lines.iter().any(|l| l.contains(".netrc")));
        assert!(lines.iter().any(|l| l == "umask 077"));
    }

    #[test]
    fn owner_labels_encode_namespaced_name() {
        let labels = owner_labels("Schedule", "prod", "nightly", "uid-1");
        assert_eq!(labels[LABEL_OWNER_NAME], "prod.nightly");
        assert_eq!(labels[LABEL_MANAGED_BY], MANAGED_BY);
    }
}
