//! # Controller Module
//!
//! Reconcilers for the three custom resources plus the watch handlers that
//! fold Job/CronJob events back into resource status. Every reconciler is a
//! free function taking the shared [`Context`]; everything the reconcilers
//! need from the outside world (cluster client, configuration, dependency
//! index, git validation) is injected through it so tests can substitute
//! fakes.

pub mod backoff;
pub mod concurrency;
pub mod conditions;
pub mod events;
pub mod manual_run;
pub mod playbook;
pub mod repository;
pub mod schedule;
pub mod watchers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::OperatorConfig;
use crate::constants::FIELD_MANAGER;
use crate::dependencies::DependencyIndex;
use crate::git::GitValidator;

use backoff::BackoffState;
use events::BestEffortError;

/// Shared state handed to every reconciler invocation.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub deps: Arc<DependencyIndex>,
    pub git: Arc<dyn GitValidator>,
    /// Per-resource error backoff, keyed `{namespace}/{name}`. Tracked here
    /// so failures of one resource never slow down its neighbours.
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        deps: Arc<DependencyIndex>,
        git: Arc<dyn GitValidator>,
    ) -> Self {
        Self {
            client,
            config,
            deps,
            git,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Forgets accumulated error backoff after a clean reconcile.
    pub fn reset_backoff(&self, namespace: &str, name: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(&format!("{namespace}/{name}"));
        }
    }
}

/// Errors that fail a reconcile pass and feed the error policy. Best-effort
/// side channels (Events, status patches) use [`BestEffortError`] instead
/// and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to render manifest: {0}")]
    Render(#[from] serde_json::Error),
    #[error("resource is missing {0}")]
    MissingMetadata(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a resource stands in its finalizer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerPhase {
    /// Live resource that does not carry our finalizer yet.
    NeedsFinalizer,
    /// Live resource with the finalizer in place.
    Active,
    /// Deletion requested and our finalizer still blocks it.
    Cleanup,
    /// Deletion requested and our finalizer is already gone.
    Released,
}

/// Classifies a resource's metadata into a [`FinalizerPhase`].
pub fn finalizer_phase(
    meta: &kube::core::ObjectMeta,
    finalizer: &str,
) -> FinalizerPhase {
    let has_finalizer = meta
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer);
    match (meta.deletion_timestamp.is_some(), has_finalizer) {
        (false, false) => FinalizerPhase::NeedsFinalizer,
        (false, true) => FinalizerPhase::Active,
        (true, true) => FinalizerPhase::Cleanup,
        (true, false) => FinalizerPhase::Released,
    }
}

/// Merge-patches the status subresource. Status writes are best-effort;
/// callers log failures at debug and carry on.
pub(crate) async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    body: serde_json::Value,
) -> Result<(), BestEffortError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
        .await
        .map_err(BestEffortError::Status)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FINALIZER;
    use kube::core::ObjectMeta;

    fn meta(deleting: bool, finalizers: Option<Vec<&str>>) -> ObjectMeta {
        ObjectMeta {
            deletion_timestamp: deleting.then(|| {
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
            }),
            finalizers: finalizers.map(|f| f.into_iter().map(String::from).collect()),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn finalizer_phase_classification() {
        assert_eq!(
            finalizer_phase(&meta(false, None), FINALIZER),
            FinalizerPhase::NeedsFinalizer
        );
        assert_eq!(
            finalizer_phase(&meta(false, Some(vec![FINALIZER])), FINALIZER),
            FinalizerPhase::Active
        );
        assert_eq!(
            finalizer_phase(&meta(true, Some(vec![FINALIZER, "other"])), FINALIZER),
            FinalizerPhase::Cleanup
        );
        assert_eq!(
            finalizer_phase(&meta(true, Some(vec!["other"])), FINALIZER),
            FinalizerPhase::Released
        );
        assert_eq!(
            finalizer_phase(&meta(true, None), FINALIZER),
            FinalizerPhase::Released
        );
    }
}
