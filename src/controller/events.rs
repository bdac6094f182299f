//! Kubernetes Event emission.
//!
//! Events are a side channel for humans running `kubectl describe`; a
//! failed post must never fail a reconcile. Failures are surfaced as a
//! typed [`BestEffortError`] so callers log them at debug instead of
//! swallowing them silently.

use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::constants::API_GROUP_VERSION;

/// Failure of a best-effort side channel. Never propagated as a reconcile
/// error.
#[derive(Debug, thiserror::Error)]
pub enum BestEffortError {
    #[error("event post failed: {0}")]
    Event(#[source] kube::Error),
    #[error("status patch failed: {0}")]
    Status(#[source] kube::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Event severity, mapped onto the core/v1 `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Posts an Event against one of our custom resources.
pub async fn emit_event(
    client: Client,
    kind: &str,
    namespace: &str,
    name: &str,
    reason: &str,
    message: &str,
    event_type: EventType,
) -> Result<(), BestEffortError> {
    let event: Event = serde_json::from_value(json!({
        "metadata": {
            "generateName": format!("{name}-"),
            "namespace": namespace,
        },
        "involvedObject": {
            "apiVersion": API_GROUP_VERSION,
            "kind": kind,
            "name": name,
            "namespace": namespace,
        },
        "type": event_type.as_str(),
        "reason": reason,
        "message": message,
        "reportingComponent": "ansible-operator",
    }))?;

    let api: Api<Event> = Api::namespaced(client, namespace);
    api.create(&PostParams::default(), &event)
        .await
        .map_err(BestEffortError::Event)?;
    Ok(())
}

/// Runs a best-effort result, logging failures at debug.
pub fn log_best_effort(result: Result<(), BestEffortError>, what: &str) {
    if let Err(err) = result {
        debug!(%err, "{what} failed");
    }
}
