//! Cross-resource dependency tracking.
//!
//! Playbooks depend on Repositories and Schedules depend on Playbooks.
//! Kubernetes does not deliver watch events to dependents when an upstream
//! resource changes, so the operator keeps an in-memory index and nudges
//! dependents by stamping a trigger annotation, which produces a watch
//! event. Triggers are rate limited per upstream resource so a burst of
//! status updates collapses into one requeue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::WatchScope;
use crate::constants::{ANNOTATION_TRIGGER_RECONCILE, FIELD_MANAGER, REQUEUE_COOLDOWN_SECS};
use crate::crd::{ObjectRef, Playbook, Repository, Schedule};
use crate::observability::metrics;

/// Upstream resource kinds tracked by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Repository,
    Playbook,
}

impl UpstreamKind {
    fn key_prefix(self) -> &'static str {
        match self {
            Self::Repository => "repo",
            Self::Playbook => "playbook",
        }
    }
}

#[derive(Debug, Default)]
struct IndexState {
    /// `{namespace -> {repository -> [playbooks]}}`
    repo_to_playbooks: HashMap<String, HashMap<String, Vec<String>>>,
    /// `{namespace -> {playbook -> [schedules]}}`
    playbook_to_schedules: HashMap<String, HashMap<String, Vec<String>>>,
    last_requeue: HashMap<String, Instant>,
}

/// Shared dependency index. One instance lives in the reconciler context;
/// all interior mutability is behind a single mutex which is never held
/// across an await point.
#[derive(Debug)]
pub struct DependencyIndex {
    state: Mutex<IndexState>,
    cooldown: Duration,
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new(Duration::from_secs(REQUEUE_COOLDOWN_SECS))
    }
}

impl DependencyIndex {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            cooldown,
        }
    }

    /// Rebuilds the Repository -> Playbooks entry for one Repository by
    /// scanning the namespace. A failed scan clears the entry so triggers
    /// never act on stale data.
    pub async fn index_repository_dependencies(
        &self,
        client: Client,
        namespace: &str,
        repo_name: &str,
    ) {
        let api: Api<Playbook> = Api::namespaced(client, namespace);
        match api.list(&ListParams::default()).await {
            Ok(playbooks) => {
                let dependents = same_namespace_dependents(
                    playbooks
                        .items
                        .iter()
                        .map(|pb| (pb.name_any(), &pb.spec.repository_ref)),
                    repo_name,
                    namespace,
                );
                self.set_repository_dependents(namespace, repo_name, dependents);
            }
            Err(err) => {
                warn!(%namespace, repository = %repo_name, %err, "failed to index repository dependents, clearing entry");
                self.clear_repository_entry(namespace, repo_name);
            }
        }
    }

    /// Rebuilds the Playbook -> Schedules entry for one Playbook.
    pub async fn index_playbook_dependencies(
        &self,
        client: Client,
        namespace: &str,
        playbook_name: &str,
    ) {
        let api: Api<Schedule> = Api::namespaced(client, namespace);
        match api.list(&ListParams::default()).await {
            Ok(schedules) => {
                let dependents = same_namespace_dependents(
                    schedules
                        .items
                        .iter()
                        .map(|s| (s.name_any(), &s.spec.playbook_ref)),
                    playbook_name,
                    namespace,
                );
                self.set_playbook_dependents(namespace, playbook_name, dependents);
            }
            Err(err) => {
                warn!(%namespace, playbook = %playbook_name, %err, "failed to index playbook dependents, clearing entry");
                self.clear_playbook_entry(namespace, playbook_name);
            }
        }
    }

    /// Stamps the trigger annotation on every Playbook depending on
    /// `repo_name`. Individual patch failures are non-critical.
    pub async fn requeue_dependent_playbooks(
        &self,
        client: Client,
        namespace: &str,
        repo_name: &str,
    ) {
        let key = upstream_key(UpstreamKind::Repository, namespace, repo_name);
        if !self.cooled_down(&key) {
            debug!(%namespace, repository = %repo_name, "requeue suppressed by cooldown");
            return;
        }
        let dependents = self.dependent_playbooks(namespace, repo_name);
        if dependents.is_empty() {
            return;
        }

        let api: Api<Playbook> = Api::namespaced(client, namespace);
        for name in &dependents {
            if let Err(err) = stamp_trigger(&api, name).await {
                debug!(%namespace, playbook = %name, %err, "trigger patch failed");
            } else {
                metrics::inc_dependency_trigger("Playbook");
            }
        }
        self.mark_requeued(&key);
        info!(%namespace, repository = %repo_name, count = dependents.len(), "requeued dependent playbooks");
    }

    /// Stamps the trigger annotation on every Schedule depending on
    /// `playbook_name`.
    pub async fn requeue_dependent_schedules(
        &self,
        client: Client,
        namespace: &str,
        playbook_name: &str,
    ) {
        let key = upstream_key(UpstreamKind::Playbook, namespace, playbook_name);
        if !self.cooled_down(&key) {
            debug!(%namespace, playbook = %playbook_name, "requeue suppressed by cooldown");
            return;
        }
        let dependents = self.dependent_schedules(namespace, playbook_name);
        if dependents.is_empty() {
            return;
        }

        let api: Api<Schedule> = Api::namespaced(client, namespace);
        for name in &dependents {
            if let Err(err) = stamp_trigger(&api, name).await {
                debug!(%namespace, schedule = %name, %err, "trigger patch failed");
            } else {
                metrics::inc_dependency_trigger("Schedule");
            }
        }
        self.mark_requeued(&key);
        info!(%namespace, playbook = %playbook_name, count = dependents.len(), "requeued dependent schedules");
    }

    /// Drops index entries referring to a deleted resource. A deleted
    /// Playbook is removed both as an upstream and as a dependent.
    pub fn cleanup(&self, namespace: &str, kind: UpstreamKind, name: &str) {
        let mut state = self.lock();
        match kind {
            UpstreamKind::Repository => {
                if let Some(ns) = state.repo_to_playbooks.get_mut(namespace) {
                    ns.remove(name);
                }
            }
            UpstreamKind::Playbook => {
                if let Some(ns) = state.playbook_to_schedules.get_mut(namespace) {
                    ns.remove(name);
                }
                if let Some(ns) = state.repo_to_playbooks.get_mut(namespace) {
                    for dependents in ns.values_mut() {
                        dependents.retain(|d| d != name);
                    }
                }
            }
        }
    }

    /// Rebuilds every index entry in the watch scope. Used at startup so
    /// triggers work before the first reconcile of each resource. Listing
    /// failures abort the rebuild; per-entry indexing is best-effort.
    pub async fn rebuild_all(&self, client: Client, scope: &WatchScope) -> Result<(), kube::Error> {
        let repos: Vec<Repository> = match scope {
            WatchScope::All => Api::all(client.clone()).list(&ListParams::default()).await?,
            WatchScope::Namespace(ns) => {
                Api::namespaced(client.clone(), ns)
                    .list(&ListParams::default())
                    .await?
            }
        }
        .items;
        for repo in &repos {
            if let Some(ns) = repo.namespace() {
                self.index_repository_dependencies(client.clone(), &ns, &repo.name_any())
                    .await;
            }
        }

        let playbooks: Vec<Playbook> = match scope {
            WatchScope::All => Api::all(client.clone()).list(&ListParams::default()).await?,
            WatchScope::Namespace(ns) => {
                Api::namespaced(client.clone(), ns)
                    .list(&ListParams::default())
                    .await?
            }
        }
        .items;
        for pb in &playbooks {
            if let Some(ns) = pb.namespace() {
                self.index_playbook_dependencies(client.clone(), &ns, &pb.name_any())
                    .await;
            }
        }

        info!(
            repositories = repos.len(),
            playbooks = playbooks.len(),
            "dependency indices rebuilt"
        );
        Ok(())
    }

    pub fn dependent_playbooks(&self, namespace: &str, repo_name: &str) -> Vec<String> {
        self.lock()
            .repo_to_playbooks
            .get(namespace)
            .and_then(|ns| ns.get(repo_name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn dependent_schedules(&self, namespace: &str, playbook_name: &str) -> Vec<String> {
        self.lock()
            .playbook_to_schedules
            .get(namespace)
            .and_then(|ns| ns.get(playbook_name))
            .cloned()
            .unwrap_or_default()
    }

    fn set_repository_dependents(&self, namespace: &str, repo: &str, dependents: Vec<String>) {
        self.lock()
            .repo_to_playbooks
            .entry(namespace.to_string())
            .or_default()
            .insert(repo.to_string(), dependents);
    }

    fn set_playbook_dependents(&self, namespace: &str, playbook: &str, dependents: Vec<String>) {
        self.lock()
            .playbook_to_schedules
            .entry(namespace.to_string())
            .or_default()
            .insert(playbook.to_string(), dependents);
    }

    fn clear_repository_entry(&self, namespace: &str, repo: &str) {
        if let Some(ns) = self.lock().repo_to_playbooks.get_mut(namespace) {
            ns.remove(repo);
        }
    }

    fn clear_playbook_entry(&self, namespace: &str, playbook: &str) {
        if let Some(ns) = self.lock().playbook_to_schedules.get_mut(namespace) {
            ns.remove(playbook);
        }
    }

    fn cooled_down(&self, key: &str) -> bool {
        let state = self.lock();
        state
            .last_requeue
            .get(key)
            .is_none_or(|last| last.elapsed() >= self.cooldown)
    }

    fn mark_requeued(&self, key: &str) {
        self.lock()
            .last_requeue
            .insert(key.to_string(), Instant::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
        // Mutex poisoning cannot leave the index in an inconsistent state;
        // every critical section is a plain map update.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Rate-limiter key for one upstream resource.
fn upstream_key(kind: UpstreamKind, namespace: &str, name: &str) -> String {
    format!("{}:{namespace}:{name}", kind.key_prefix())
}

/// Filters `(dependent name, upstream ref)` pairs down to the dependents of
/// `upstream` within `namespace`. Cross-namespace references are excluded
/// from the index.
fn same_namespace_dependents<'a>(
    refs: impl IntoIterator<Item = (String, &'a ObjectRef)>,
    upstream: &str,
    namespace: &str,
) -> Vec<String> {
    refs.into_iter()
        .filter(|(_, r)| {
            r.name == upstream && r.namespace.as_deref().is_none_or(|ns| ns == namespace)
        })
        .map(|(name, _)| name)
        .collect()
}

async fn stamp_trigger<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_TRIGGER_RECONCILE: chrono::Utc::now().timestamp().to_string(),
            }
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependents_round_trip() {
        let index = DependencyIndex::default();
        index.set_repository_dependents("default", "infra", vec!["deploy".to_string()]);
        assert_eq!(index.dependent_playbooks("default", "infra"), ["deploy"]);
        assert!(index.dependent_playbooks("other", "infra").is_empty());
        assert!(index.dependent_playbooks("default", "missing").is_empty());
    }

    fn object_ref(name: &str, namespace: Option<&str>) -> ObjectRef {
        ObjectRef {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    #[test]
    fn cross_namespace_refs_are_excluded_from_dependents() {
        let refs = [
            ("deploy".to_string(), object_ref("infra", None)),
            ("audit".to_string(), object_ref("infra", Some("default"))),
            ("foreign".to_string(), object_ref("infra", Some("other"))),
            ("unrelated".to_string(), object_ref("tools", None)),
        ];
        let dependents = same_namespace_dependents(
            refs.iter().map(|(name, r)| (name.clone(), r)),
            "infra",
            "default",
        );
        assert_eq!(dependents, ["deploy", "audit"]);
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let index = DependencyIndex::new(Duration::from_secs(60));
        let key = upstream_key(UpstreamKind::Repository, "default", "infra");
        assert!(index.cooled_down(&key));
        index.mark_requeued(&key);
        // A second trigger for the same upstream within the window is
        // collapsed.
        assert!(!index.cooled_down(&key));
        // Other upstreams are unaffected.
        assert!(index.cooled_down(&upstream_key(UpstreamKind::Repository, "default", "other")));
        assert!(index.cooled_down(&upstream_key(UpstreamKind::Playbook, "default", "infra")));
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let index = DependencyIndex::new(Duration::ZERO);
        index.mark_requeued("k");
        assert!(index.cooled_down("k"));
    }

    #[test]
    fn cleanup_removes_repository_entry() {
        let index = DependencyIndex::default();
        index.set_repository_dependents("default", "infra", vec!["deploy".to_string()]);
        index.cleanup("default", UpstreamKind::Repository, "infra");
        assert!(index.dependent_playbooks("default", "infra").is_empty());
    }

    #[test]
    fn deleted_playbook_is_removed_as_upstream_and_dependent() {
        let index = DependencyIndex::default();
        index.set_repository_dependents(
            "default",
            "infra",
            vec!["deploy".to_string(), "audit".to_string()],
        );
        index.set_playbook_dependents("default", "deploy", vec!["nightly".to_string()]);

        index.cleanup("default", UpstreamKind::Playbook, "deploy");

        assert!(index.dependent_schedules("default", "deploy").is_empty());
        assert_eq!(index.dependent_playbooks("default", "infra"), ["audit"]);
    }

    #[test]
    fn failed_index_scan_clears_stale_entry() {
        let index = DependencyIndex::default();
        index.set_repository_dependents("default", "infra", vec!["deploy".to_string()]);
        index.clear_repository_entry("default", "infra");
        assert!(index.dependent_playbooks("default", "infra").is_empty());
    }
}
