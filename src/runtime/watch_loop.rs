//! Watch loop wiring: one controller per custom resource plus the raw
//! Job/CronJob watchers.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use tracing::{debug, warn};

use crate::config::WatchScope;
use crate::controller::{playbook, repository, schedule, watchers, Context, Error};
use crate::crd::{Playbook, Repository, Schedule};
use crate::runtime::error_policy;

/// Runs all controllers and watchers until the process is terminated.
pub async fn run_watch_loop(ctx: Arc<Context>) {
    let repositories = Controller::new(scoped_api::<Repository>(&ctx), watcher::Config::default())
        .run(repository::reconcile, repository_error_policy, ctx.clone())
        .for_each(log_reconcile_result::<Repository>);

    let playbooks = Controller::new(scoped_api::<Playbook>(&ctx), watcher::Config::default())
        .run(playbook::reconcile, playbook_error_policy, ctx.clone())
        .for_each(log_reconcile_result::<Playbook>);

    let schedules = Controller::new(scoped_api::<Schedule>(&ctx), watcher::Config::default())
        .run(schedule::reconcile, schedule_error_policy, ctx.clone())
        .for_each(log_reconcile_result::<Schedule>);

    let job_watcher = watchers::run_job_watcher(ctx.clone());
    let cronjob_watcher = watchers::run_cronjob_watcher(ctx.clone());

    tokio::join!(
        repositories,
        playbooks,
        schedules,
        job_watcher,
        cronjob_watcher
    );
}

fn scoped_api<K>(ctx: &Context) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match &ctx.config.watch_scope {
        WatchScope::All => Api::all(ctx.client.clone()),
        WatchScope::Namespace(ns) => Api::namespaced(ctx.client.clone(), ns),
    }
}

fn repository_error_policy(obj: Arc<Repository>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_policy("Repository", &obj.metadata, error, &ctx)
}

fn playbook_error_policy(obj: Arc<Playbook>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_policy("Playbook", &obj.metadata, error, &ctx)
}

fn schedule_error_policy(obj: Arc<Schedule>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_policy("Schedule", &obj.metadata, error, &ctx)
}

fn backoff_policy(
    kind: &str,
    meta: &kube::core::ObjectMeta,
    error: &Error,
    ctx: &Arc<Context>,
) -> Action {
    let namespace = meta.namespace.as_deref().unwrap_or("default");
    let name = meta.name.as_deref().unwrap_or("unknown");
    error_policy::requeue_with_backoff(kind, namespace, name, error, ctx)
}

async fn log_reconcile_result<K>(
    result: Result<(kube_runtime::reflector::ObjectRef<K>, Action), kube_runtime::controller::Error<Error, watcher::Error>>,
) where
    K: kube::Resource,
    K::DynamicType: std::fmt::Debug + std::hash::Hash + Eq + Clone,
{
    match result {
        Ok((obj, _)) => debug!(object = ?obj, "reconciled"),
        Err(err) => warn!(%err, "reconcile stream error"),
    }
}
