//! Shared constants: API group identifiers, label and annotation keys,
//! condition types and operator tunables.

/// API group of all custom resources managed by this operator.
pub const API_GROUP: &str = "ansible.cloud37.dev";
/// CRD version.
pub const API_VERSION: &str = "v1alpha1";
/// `group/version` string as used in `apiVersion` fields.
pub const API_GROUP_VERSION: &str = "ansible.cloud37.dev/v1alpha1";

/// Field manager for all server-side apply and merge patches.
pub const FIELD_MANAGER: &str = "ansible-operator";
/// Value of the managed-by label on every created child resource.
pub const MANAGED_BY: &str = "ansible-operator";

// Labels stamped on created Jobs and CronJobs.
pub const LABEL_MANAGED_BY: &str = "ansible.cloud37.dev/managed-by";
pub const LABEL_OWNER_KIND: &str = "ansible.cloud37.dev/owner-kind";
/// Value format: `{namespace}.{name}`.
pub const LABEL_OWNER_NAME: &str = "ansible.cloud37.dev/owner-name";
pub const LABEL_OWNER_UID: &str = "ansible.cloud37.dev/owner-uid";
pub const LABEL_RUN_ID: &str = "ansible.cloud37.dev/run-id";
pub const LABEL_PROBE_TYPE: &str = "ansible.cloud37.dev/probe-type";
pub const LABEL_RUN_TYPE: &str = "ansible.cloud37.dev/run-type";

pub const PROBE_TYPE_CONNECTIVITY: &str = "connectivity";
pub const RUN_TYPE_MANUAL: &str = "manual";

// Annotations.
pub const ANNOTATION_OWNER_UID: &str = "ansible.cloud37.dev/owner-uid";
pub const ANNOTATION_REVISION: &str = "ansible.cloud37.dev/revision";
/// Manual-run request; the value is the caller-chosen run id.
pub const ANNOTATION_RUN_NOW: &str = "ansible.cloud37.dev/run-now";
/// Stamped on dependents to force a watch event; value is a unix timestamp.
pub const ANNOTATION_TRIGGER_RECONCILE: &str = "ansible.cloud37.dev/trigger-reconcile";

pub const FINALIZER: &str = "ansible.cloud37.dev/finalizer";

// Condition types.
pub const COND_READY: &str = "Ready";
pub const COND_AUTH_VALID: &str = "AuthValid";
pub const COND_CLONE_READY: &str = "CloneReady";
pub const COND_BLOCKED_BY_CONCURRENCY: &str = "BlockedByConcurrency";

/// Executor image used when neither the Playbook nor the operator
/// configuration names one.
pub const DEFAULT_RUNNER_IMAGE: &str = "kenchrcum/ansible-runner:latest";

/// Minimum seconds between trigger annotations for the same upstream
/// resource.
pub const REQUEUE_COOLDOWN_SECS: u64 = 5;
/// Successful Schedule reconciles requeue on this interval to refresh
/// `nextRunTime`.
pub const PERIODIC_REQUEUE_SECS: u64 = 15 * 60;
/// Requeue interval after a validation failure.
pub const VALIDATION_REQUEUE_SECS: u64 = 10 * 60;

/// Timeouts for out-of-band git operations during Playbook validation.
pub const GIT_CLONE_TIMEOUT_SECS: u64 = 30;
pub const GIT_CHECKOUT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_METRICS_PORT: u16 = 8080;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 100;
