//! Error handling and backoff for the controller watch loops.
//!
//! Reconciliation errors requeue with per-resource Fibonacci backoff so a
//! handful of broken resources cannot monopolize the workers or slow down
//! their healthy neighbours.

use std::sync::Arc;
use std::time::Duration;

use kube_runtime::controller::Action;
use tracing::{error, info, warn};

use crate::controller::{Context, Error};

/// Default requeue when the backoff state is unavailable.
const FALLBACK_REQUEUE_SECS: u64 = 60;

/// Computes the requeue action for a failed reconcile. Backoff state is
/// keyed `{namespace}/{name}` and advances on every error; a successful
/// reconcile resets it via [`Context::reset_backoff`].
pub fn requeue_with_backoff(
    kind: &str,
    namespace: &str,
    name: &str,
    error: &Error,
    ctx: &Arc<Context>,
) -> Action {
    error!(
        controller = kind,
        resource = %format!("{namespace}/{name}"),
        %error,
        "reconciliation failed"
    );

    let key = format!("{namespace}/{name}");
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key).or_default();
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(err) => {
            warn!(%err, "failed to lock backoff states, using fallback requeue");
            (FALLBACK_REQUEUE_SECS, 0)
        }
    };

    let next_trigger = chrono::Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
    info!(
        controller = kind,
        backoff_seconds,
        error_count,
        next_retry = %next_trigger.to_rfc3339(),
        "requeueing with backoff"
    );

    crate::observability::metrics::inc_requeue("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}
