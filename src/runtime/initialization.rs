//! Operator initialization: rustls setup, tracing, metrics registration,
//! HTTP server startup, Kubernetes client creation and the initial
//! dependency-index rebuild.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use kube::Client;
use tracing::{error, info, warn};

use crate::config::OperatorConfig;
use crate::constants;
use crate::controller::Context;
use crate::dependencies::DependencyIndex;
use crate::git::CommandGitValidator;
use crate::observability;
use crate::runtime::server::{start_server, ServerState};

/// Everything the watch loop needs, produced by [`initialize`].
pub struct InitializationResult {
    pub context: Arc<Context>,
    pub server_state: Arc<ServerState>,
}

/// Initializes the operator runtime.
pub async fn initialize() -> Result<InitializationResult> {
    // rustls 0.23+ needs an explicit crypto provider before any TLS use.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ansible_operator=info".into()),
        )
        .init();

    info!("Starting Ansible Operator");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let config = OperatorConfig::from_env();
    info!(?config.watch_scope, metrics_port = config.metrics_port, "configuration loaded");

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });
    let server_state_clone = server_state.clone();
    let port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(err) = start_server(port, server_state_clone).await {
            error!(%err, "HTTP server error");
        }
    });
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let deps = Arc::new(DependencyIndex::default());
    // Prime the index so dependency triggers work before each resource has
    // been reconciled once. A failed rebuild is non-fatal; the index fills
    // in as resources are reconciled.
    if let Err(err) = deps.rebuild_all(client.clone(), &config.watch_scope).await {
        warn!(%err, "initial dependency index rebuild failed");
    }

    let context = Arc::new(Context::new(
        client,
        config,
        deps,
        Arc::new(CommandGitValidator),
    ));

    info!("Operator initialized, starting watch loops");
    Ok(InitializationResult {
        context,
        server_state,
    })
}

/// Polls until the HTTP server reports ready or the startup timeout
/// elapses.
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let startup_timeout =
        std::time::Duration::from_secs(constants::DEFAULT_SERVER_STARTUP_TIMEOUT_SECS);
    let poll_interval =
        std::time::Duration::from_millis(constants::DEFAULT_SERVER_POLL_INTERVAL_MS);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
