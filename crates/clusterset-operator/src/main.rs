//! Cluster-set RBAC operator - keeps set admin/view RoleBindings in member namespaces

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clusterset_common::kube_utils::create_client;
use clusterset_common::retry::{retry_retryable, retry_with_backoff, RetryConfig};
use clusterset_common::telemetry::{init_telemetry, TelemetryConfig};
use clusterset_operator::{Config, KubeRbacReader, MembershipWatcher, RbacReader, RbacSubjectCache};
use clusterset_rbac::{KubeRoleBindingClient, Reconciler, SubjectAccessCache};

/// Interval for readiness warnings on ManagedClusters and the give-up time
/// for the optional Hive kinds
const STORE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Startup attempts for client creation and the first access cache fill
const STARTUP_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    init_telemetry(TelemetryConfig {
        pretty_logs: config.pretty_logs,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    config.validate()?;
    info!(
        sync_period_secs = config.sync_period_secs,
        access_refresh_secs = config.access_refresh_secs,
        apply_concurrency = config.apply_concurrency,
        global_set = %config.global_set_name,
        "Starting cluster-set RBAC operator"
    );

    let startup_retry = RetryConfig::with_max_attempts(STARTUP_ATTEMPTS);
    let kubeconfig = config.kubeconfig.clone();
    let client = retry_with_backoff(&startup_retry, "create_client", || {
        create_client(kubeconfig.as_deref())
    })
    .await?;

    let cancel = CancellationToken::new();

    let (membership, mut tasks) = MembershipWatcher::start(
        client.clone(),
        config.global_set_name.clone(),
        cancel.clone(),
    );
    tokio::select! {
        ready = membership.wait_ready(STORE_READY_TIMEOUT) => ready?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received before membership was listed, stopping");
            cancel.cancel();
            return Ok(());
        }
    }

    // An empty cache would revoke every binding on the first pass, so the
    // first fill must succeed before the sync loop starts.
    let access = RbacSubjectCache::new();
    let reader: Arc<dyn RbacReader> = Arc::new(KubeRbacReader::new(client.clone()));
    retry_retryable(&startup_retry, "access_cache", || {
        access.refresh(reader.as_ref())
    })
    .await?;
    tasks.push(access.spawn_refresher(
        reader,
        config.access_refresh_period(),
        cancel.clone(),
    ));

    let cache: Arc<dyn SubjectAccessCache> = Arc::new(access);
    let reconciler = Arc::new(
        Reconciler::new(
            Arc::new(KubeRoleBindingClient::new(client)),
            cache.clone(),
            cache,
        )
        .with_concurrency(config.apply_concurrency),
    );
    tasks.push(reconciler.spawn(
        config.sync_period(),
        Arc::new(membership),
        cancel.clone(),
    ));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Cluster-set RBAC operator stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
