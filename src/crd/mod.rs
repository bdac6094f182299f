//! # Custom Resource Definitions
//!
//! CRD types for the Ansible operator: `Repository`, `Playbook` and
//! `Schedule` under the `ansible.cloud37.dev/v1alpha1` group.
//!
//! Every optional spec field is an explicit `Option` decoded once at
//! reconcile entry; controllers never reach into untyped maps.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod status;

pub use status::{Condition, ManualRunStatus, PlaybookStatus, RepositoryStatus, ScheduleStatus};

/// Reference to a named object in the same namespace.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NameRef {
    pub name: String,
}

/// Reference to a secret key.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Reference to another custom resource, optionally in a different
/// namespace. Cross-namespace references are resolved for readiness checks
/// but are excluded from the dependency index.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Repository Custom Resource Definition
///
/// Describes a git repository holding playbooks. The operator verifies
/// connectivity with a probe Job (`git ls-remote`) and publishes the result
/// through the `AuthValid`, `CloneReady` and `Ready` conditions.
///
/// # Example
///
/// ```yaml
/// apiVersion: ansible.cloud37.dev/v1alpha1
/// kind: Repository
/// metadata:
///   name: infra
/// spec:
///   url: git@github.com:example/infra.git
///   branch: main
///   auth:
///     method: ssh
///     secretRef:
///       name: infra-deploy-key
///   ssh:
///     knownHostsConfigMapRef:
///       name: github-known-hosts
///     strictHostKeyChecking: true
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Repository",
    group = "ansible.cloud37.dev",
    version = "v1alpha1",
    namespaced,
    status = "RepositoryStatus",
    shortname = "repo",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Clone URL (ssh or https).
    #[serde(default)]
    pub url: String,
    /// Branch checked out when no revision is pinned. Defaults to `main`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Exact revision (commit-ish) to check out with `--detach`.
    #[serde(default)]
    pub revision: Option<String>,
    /// Well-known file locations inside the repository.
    #[serde(default)]
    pub paths: Option<RepositoryPaths>,
    /// Authentication used for cloning.
    #[serde(default)]
    pub auth: Option<RepositoryAuth>,
    /// SSH host-key verification settings.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    /// Optional cache for `~/.ansible` across runs.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPaths {
    /// Ansible Galaxy requirements file installed before each run.
    /// Defaults to `requirements.yml`.
    #[serde(default)]
    pub requirements_file: Option<String>,
}

/// How the operator authenticates against the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Private key mounted from `secretRef` (key `ssh-privatekey`).
    Ssh,
    /// Token mounted from `secretRef` (key `token`), written to a netrc.
    Token,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryAuth {
    #[serde(default)]
    pub method: Option<AuthMethod>,
    /// Secret holding the credential. Required when `method` is set.
    #[serde(default)]
    pub secret_ref: Option<NameRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// ConfigMap with a `known_hosts` key used to pin host keys.
    #[serde(default)]
    pub known_hosts_config_map_ref: Option<NameRef>,
    /// When true (the default) a missing known-hosts ConfigMap is a hard
    /// failure; host-key checking is never silently disabled.
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            known_hosts_config_map_ref: None,
            strict_host_key_checking: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Only `pvc` is recognized.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub pvc_name: Option<String>,
}

/// Playbook Custom Resource Definition
///
/// Binds a playbook path inside a [`Repository`] to execution settings.
/// Manual runs are requested through the `ansible.cloud37.dev/run-now`
/// annotation whose value doubles as the idempotency key.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Playbook",
    group = "ansible.cloud37.dev",
    version = "v1alpha1",
    namespaced,
    status = "PlaybookStatus",
    shortname = "pb",
    printcolumn = r#"{"name":"Repository", "type":"string", "jsonPath":".spec.repositoryRef.name"}, {"name":"Playbook", "type":"string", "jsonPath":".spec.playbookPath"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookSpec {
    pub repository_ref: ObjectRef,
    /// Path of the playbook relative to the repository root.
    #[serde(default)]
    pub playbook_path: String,
    /// Single inventory path; takes precedence over `inventoryPaths`.
    #[serde(default)]
    pub inventory_path: Option<String>,
    #[serde(default)]
    pub inventory_paths: Option<Vec<String>>,
    /// Explicit ansible.cfg location, exported as `ANSIBLE_CONFIG`.
    #[serde(default)]
    pub ansible_cfg_path: Option<String>,
    /// Extra variables passed inline as JSON via `--extra-vars`.
    #[serde(default)]
    pub extra_vars: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub execution: Option<ExecutionOptions>,
    #[serde(default)]
    pub secrets: Option<SecretsConfig>,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
}

/// Flags forwarded to `ansible-playbook`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub skip_tags: Option<Vec<String>>,
    #[serde(default)]
    pub check_mode: bool,
    #[serde(default)]
    pub diff: bool,
    /// Rendered as that many repeated `v`s in a single `-v` flag.
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub connection_timeout: Option<u32>,
    #[serde(default)]
    pub forks: Option<u32>,
    /// Only forwarded when not `linear` (the Ansible default).
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub flush_cache: bool,
    #[serde(default)]
    pub force_handlers: bool,
    #[serde(default)]
    pub start_at_task: Option<String>,
    #[serde(default)]
    pub step: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretsConfig {
    /// Secret with a `password` key mounted as the vault password file.
    #[serde(default)]
    pub vault_password_secret_ref: Option<NameRef>,
    /// Individual secret keys exposed as environment variables.
    #[serde(default)]
    pub env: Option<Vec<SecretEnvVar>>,
    /// Whole secrets exposed via `envFrom`.
    #[serde(default)]
    pub env_from_secret_refs: Option<Vec<NameRef>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretEnvVar {
    pub env_var_name: String,
    pub secret_ref: SecretKeyRef,
}

/// Pod-level knobs for executor Jobs.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Executor image. Overrides the operator-wide default and is never
    /// digest-pinned when it already carries a digest.
    #[serde(default)]
    pub image: Option<String>,
    /// Overrides the operator-wide executor ServiceAccount.
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default)]
    pub security_context: Option<ContainerSecurity>,
    #[serde(default)]
    pub pod_security_context: Option<PodSecurity>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub image_pull_secrets: Option<Vec<NameRef>>,
}

/// Container security context subset the operator forwards.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSecurity {
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub allow_privilege_escalation: Option<bool>,
    #[serde(default)]
    pub read_only_root_filesystem: Option<bool>,
}

/// Pod security context subset the operator forwards.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurity {
    #[serde(default)]
    pub run_as_non_root: Option<bool>,
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub fs_group: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default)]
    pub limits: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub requests: Option<BTreeMap<String, String>>,
}

/// Schedule Custom Resource Definition
///
/// Materializes a [`Playbook`] as a CronJob. The `schedule` field accepts a
/// plain cron expression or one of the deterministic random macros
/// (`@hourly-random`, `@daily-random`, `@weekly-random`, `@monthly-random`,
/// `@yearly-random`), expanded per-resource into `status.computedSchedule`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Schedule",
    group = "ansible.cloud37.dev",
    version = "v1alpha1",
    namespaced,
    status = "ScheduleStatus",
    shortname = "asched",
    printcolumn = r#"{"name":"Playbook", "type":"string", "jsonPath":".spec.playbookRef.name"}, {"name":"Cron", "type":"string", "jsonPath":".status.computedSchedule"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub playbook_ref: ObjectRef,
    /// Cron expression or random macro.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub suspend: Option<bool>,
    /// `Forbid` (default), `Allow` or `Replace`.
    #[serde(default)]
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    #[serde(default)]
    pub backoff_limit: Option<i32>,
    #[serde(default)]
    pub successful_jobs_history_limit: Option<i32>,
    #[serde(default)]
    pub failed_jobs_history_limit: Option<i32>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i32>,
    #[serde(default)]
    pub starting_deadline_seconds: Option<i64>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Whether a scheduled run may start while a previous run is still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConcurrencyPolicy {
    #[default]
    Forbid,
    Allow,
    Replace,
}

impl ConcurrencyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forbid => "Forbid",
            Self::Allow => "Allow",
            Self::Replace => "Replace",
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}
