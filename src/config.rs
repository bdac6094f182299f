//! Operator configuration resolved from the environment at startup.

use crate::constants::DEFAULT_METRICS_PORT;

/// Which namespaces the operator watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    /// Watch a single namespace.
    Namespace(String),
    /// Watch all namespaces (cluster scope).
    All,
}

/// Settings read once from the environment and threaded through the
/// reconcilers via the shared context.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub watch_scope: WatchScope,
    /// ServiceAccount for executor pods when the Playbook does not name one.
    pub executor_service_account: Option<String>,
    /// Operator-wide default executor image.
    pub runner_image: String,
    /// Digest to pin `runner_image` with, when the image is not already
    /// digest-qualified.
    pub runner_image_digest: Option<String>,
    pub metrics_port: u16,
}

impl OperatorConfig {
    /// Reads `WATCH_SCOPE`, `WATCH_NAMESPACE`, `EXECUTOR_SERVICE_ACCOUNT`,
    /// `ANSIBLE_RUNNER_IMAGE`, `ANSIBLE_RUNNER_IMAGE_DIGEST` and
    /// `METRICS_PORT`.
    pub fn from_env() -> Self {
        let watch_scope = match std::env::var("WATCH_SCOPE").as_deref() {
            Ok("all") => WatchScope::All,
            _ => WatchScope::Namespace(
                std::env::var("WATCH_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            ),
        };
        let executor_service_account = std::env::var("EXECUTOR_SERVICE_ACCOUNT")
            .ok()
            .filter(|v| !v.is_empty());
        let runner_image = std::env::var("ANSIBLE_RUNNER_IMAGE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| crate::constants::DEFAULT_RUNNER_IMAGE.to_string());
        let runner_image_digest = std::env::var("ANSIBLE_RUNNER_IMAGE_DIGEST")
            .ok()
            .filter(|v| !v.is_empty());
        let metrics_port = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_METRICS_PORT);

        Self {
            watch_scope,
            executor_service_account,
            runner_image,
            runner_image_digest,
            metrics_port,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_scope: WatchScope::Namespace("default".to_string()),
            executor_service_account: None,
            runner_image: crate::constants::DEFAULT_RUNNER_IMAGE.to_string(),
            runner_image_digest: None,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}
