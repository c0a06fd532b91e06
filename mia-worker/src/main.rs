//! mia-worker - pipeline worker service
//!
//! Runs one worker pool per pipeline queue (stt, enhancer, analytics,
//! delivery), the finalize inactivity sweeper, and the connector
//! reconciliation loop. Shutdown is cooperative: on SIGINT no new jobs are
//! reserved and in-flight jobs get a drain window; anything left over is
//! re-delivered elsewhere via visibility expiry.

use anyhow::Result;
use mia_common::config::{QueueMode, Settings};
use mia_common::queue::worker::{JobHandler, Worker, WorkerConfig};
use mia_core::connector::{build_connector, lifecycle::ConnectorLifecycle, reconcile};
use mia_core::context::PipelineContext;
use mia_core::dispatcher;
use mia_core::finalize::run_finalize_sweeper;
use mia_core::readiness::enforce_startup_readiness;
use mia_core::stages::{AnalyticsHandler, DeliveryHandler, EnhancerHandler, SttHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MIA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    info!("Starting mia-worker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", settings.app_env);

    enforce_startup_readiness(&settings, "mia-worker")?;

    if settings.queue_mode == QueueMode::Inline {
        info!("QUEUE_MODE=inline: the gateway runs all stages in-process, nothing to do here");
        return Ok(());
    }

    let ctx = PipelineContext::initialize(settings).await?;
    info!("Database ready: {}", ctx.settings.database_path);

    // Jobs a previous run left reserved re-deliver via visibility expiry.
    match mia_common::queue::broker::SqliteBroker::new(ctx.db.clone())
        .expired_pending_count()
        .await
    {
        Ok(0) => {}
        Ok(inherited) => info!(inherited, "inheriting expired pending jobs from a previous run"),
        Err(e) => tracing::warn!(error = %e, "expired pending scan failed"),
    }

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // One worker pool per stage queue.
    let handlers: Vec<(&str, Arc<dyn JobHandler>)> = vec![
        (dispatcher::Q_STT, Arc::new(SttHandler { ctx: ctx.clone() })),
        (dispatcher::Q_ENHANCER, Arc::new(EnhancerHandler { ctx: ctx.clone() })),
        (dispatcher::Q_ANALYTICS, Arc::new(AnalyticsHandler { ctx: ctx.clone() })),
        (dispatcher::Q_DELIVERY, Arc::new(DeliveryHandler { ctx: ctx.clone() })),
    ];
    for (queue, handler) in handlers {
        let mut config = WorkerConfig::new(queue);
        config.concurrency = ctx.settings.worker_concurrency;
        config.visibility_timeout = Duration::from_secs(ctx.settings.visibility_timeout_sec);
        config.backoff_base = Duration::from_millis(ctx.settings.queue_retry_backoff_ms);
        let worker = Worker::new(
            config,
            ctx.broker.clone(),
            handler,
            ctx.metrics.clone(),
            cancel.clone(),
        );
        tasks.spawn(worker.run());
    }

    // Inactivity finalize sweeper.
    tasks.spawn(run_finalize_sweeper(ctx.clone(), cancel.clone()));

    // Connector reconciliation, when a provider is configured.
    if let Some(connector) = build_connector(&ctx.settings)? {
        let lifecycle = Arc::new(ConnectorLifecycle::new(ctx.clone(), connector));
        info!("Connector provider: {}", lifecycle.provider());
        tasks.spawn(reconcile::run_reconciliation_loop(lifecycle, cancel.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining workers");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    info!("worker metrics at shutdown: {}", ctx.metrics.snapshot());
    info!("mia-worker stopped");
    Ok(())
}
