//! Out-of-band repository validation.
//!
//! Playbook reconciliation verifies that the configured playbook, inventory
//! and ansible.cfg paths actually exist in the repository before a CronJob
//! or manual run ever references them. The check shallow-clones into a
//! scratch directory with tight timeouts; it uses whatever credentials the
//! operator pod itself has and is therefore only a best-effort pre-flight
//! for reachable repositories.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::{GIT_CHECKOUT_TIMEOUT_SECS, GIT_CLONE_TIMEOUT_SECS};
use crate::crd::{PlaybookSpec, RepositorySpec};

/// Result of a path validation pass. `Invalid` carries a user-facing
/// message that ends up in the Playbook's Ready condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Valid => "",
            Self::Invalid(msg) => msg,
        }
    }
}

/// Seam for repository validation so reconciler tests can stub it out.
#[async_trait]
pub trait GitValidator: Send + Sync {
    async fn validate_paths(
        &self,
        repository: &RepositorySpec,
        playbook: &PlaybookSpec,
    ) -> Validation;
}

/// Validates by shelling out to the `git` binary.
#[derive(Debug, Default)]
pub struct CommandGitValidator;

#[async_trait]
impl GitValidator for CommandGitValidator {
    async fn validate_paths(
        &self,
        repository: &RepositorySpec,
        playbook: &PlaybookSpec,
    ) -> Validation {
        if repository.url.is_empty() {
            return Validation::Invalid("Repository URL not specified".to_string());
        }
        if playbook.playbook_path.is_empty() {
            return Validation::Invalid("Playbook path not specified".to_string());
        }

        let temp_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                return Validation::Invalid(format!("Repository validation failed: {err}"));
            }
        };
        let clone_dir = temp_dir.path().join("repo");

        if let Some(invalid) = clone(&repository.url, &clone_dir).await {
            return invalid;
        }
        if let Some(revision) = &repository.revision {
            if let Some(invalid) = checkout(revision, &clone_dir).await {
                return invalid;
            }
        }

        check_paths(&clone_dir, playbook)
    }
}

async fn clone(url: &str, clone_dir: &Path) -> Option<Validation> {
    let result = timeout(
        Duration::from_secs(GIT_CLONE_TIMEOUT_SECS),
        Command::new("git")
            .args(["clone", "--depth", "1", url])
            .arg(clone_dir)
            .output(),
    )
    .await;
    match result {
        Err(_) => Some(Validation::Invalid("Repository clone timed out".to_string())),
        Ok(Err(err)) => Some(Validation::Invalid(format!(
            "Repository validation failed: {err}"
        ))),
        Ok(Ok(output)) if !output.status.success() => Some(Validation::Invalid(format!(
            "Failed to clone repository: {}",
            String::from_utf8_lossy(&output.stderr)
        ))),
        Ok(Ok(_)) => None,
    }
}

async fn checkout(revision: &str, clone_dir: &Path) -> Option<Validation> {
    let result = timeout(
        Duration::from_secs(GIT_CHECKOUT_TIMEOUT_SECS),
        Command::new("git")
            .args(["checkout", "--detach", revision])
            .current_dir(clone_dir)
            .output(),
    )
    .await;
    match result {
        Err(_) => Some(Validation::Invalid("Revision checkout timed out".to_string())),
        Ok(Err(err)) => Some(Validation::Invalid(format!(
            "Repository validation failed: {err}"
        ))),
        Ok(Ok(output)) if !output.status.success() => Some(Validation::Invalid(format!(
            "Failed to checkout revision {revision}: {}",
            String::from_utf8_lossy(&output.stderr)
        ))),
        Ok(Ok(_)) => None,
    }
}

/// Checks the configured paths against a checked-out clone. Split out so it
/// can be tested against a plain directory.
fn check_paths(clone_dir: &Path, playbook: &PlaybookSpec) -> Validation {
    if !clone_dir.join(&playbook.playbook_path).exists() {
        return Validation::Invalid(format!(
            "Playbook file not found: {}",
            playbook.playbook_path
        ));
    }

    if let Some(inventory) = &playbook.inventory_path {
        if !clone_dir.join(inventory).exists() {
            return Validation::Invalid(format!("Inventory file not found: {inventory}"));
        }
    } else {
        for inventory in playbook.inventory_paths.iter().flatten() {
            if !clone_dir.join(inventory).exists() {
                return Validation::Invalid(format!("Inventory file not found: {inventory}"));
            }
        }
    }

    if let Some(cfg) = &playbook.ansible_cfg_path {
        if !clone_dir.join(cfg).exists() {
            return Validation::Invalid(format!("Ansible config file not found: {cfg}"));
        }
    }

    Validation::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ObjectRef;

    fn playbook(path: &str) -> PlaybookSpec {
        PlaybookSpec {
            repository_ref: ObjectRef {
                name: "infra".to_string(),
                namespace: None,
            },
            playbook_path: path.to_string(),
            inventory_path: None,
            inventory_paths: None,
            ansible_cfg_path: None,
            extra_vars: None,
            execution: None,
            secrets: None,
            runtime: None,
        }
    }

    #[test]
    fn missing_playbook_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_paths(dir.path(), &playbook("site.yml"));
        assert_eq!(
            result,
            Validation::Invalid("Playbook file not found: site.yml".to_string())
        );
    }

    #[test]
    fn existing_paths_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.yml"), "---\n").unwrap();
        std::fs::create_dir(dir.path().join("inv")).unwrap();
        std::fs::write(dir.path().join("inv/hosts"), "").unwrap();

        let mut pb = playbook("site.yml");
        pb.inventory_path = Some("inv/hosts".to_string());
        assert!(check_paths(dir.path(), &pb).is_valid());
    }

    #[test]
    fn single_inventory_path_shadows_inventory_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.yml"), "---\n").unwrap();
        std::fs::write(dir.path().join("hosts"), "").unwrap();

        let mut pb = playbook("site.yml");
        pb.inventory_path = Some("hosts".to_string());
        pb.inventory_paths = Some(vec!["missing".to_string()]);
        assert!(check_paths(dir.path(), &pb).is_valid());
    }

    #[test]
    fn missing_ansible_cfg_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.yml"), "---\n").unwrap();

        let mut pb = playbook("site.yml");
        pb.ansible_cfg_path = Some("ansible.cfg".to_string());
        assert_eq!(
            check_paths(dir.path(), &pb),
            Validation::Invalid("Ansible config file not found: ansible.cfg".to_string())
        );
    }

    #[tokio::test]
    async fn empty_url_fails_fast() {
        let validator = CommandGitValidator;
        let repo = RepositorySpec::default();
        let result = validator.validate_paths(&repo, &playbook("site.yml")).await;
        assert_eq!(
            result,
            Validation::Invalid("Repository URL not specified".to_string())
        );
    }
}
