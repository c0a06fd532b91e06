//! mia-gateway - API gateway service
//!
//! Serves the HTTP and WebSocket ingest surface, the meeting/artifact
//! routes and the admin surface. In inline queue mode it also runs the
//! whole pipeline in the request path plus the finalize inactivity sweeper.

use anyhow::Result;
use mia_common::config::{QueueMode, Settings};
use mia_core::connector::{build_connector, lifecycle::ConnectorLifecycle};
use mia_core::context::PipelineContext;
use mia_core::finalize::run_finalize_sweeper;
use mia_core::readiness::enforce_startup_readiness;
use mia_gateway::{build_router, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MIA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    info!("Starting mia-gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", settings.app_env);

    // Readiness gate: in prod with fail-fast this aborts with a non-zero
    // exit before the listener binds.
    enforce_startup_readiness(&settings, "mia-gateway")?;

    let bind_addr = format!("{}:{}", settings.api_host, settings.api_port);
    let ctx = PipelineContext::initialize(settings).await?;
    info!("Database ready: {}", ctx.settings.database_path);

    let lifecycle = build_connector(&ctx.settings)?
        .map(|connector| Arc::new(ConnectorLifecycle::new(ctx.clone(), connector)));
    if let Some(lifecycle) = &lifecycle {
        info!("Connector provider: {}", lifecycle.provider());
    }

    let cancel = CancellationToken::new();
    if ctx.settings.queue_mode == QueueMode::Inline {
        // No worker process in inline deployments; the gateway owns the
        // inactivity sweeper.
        info!("Queue mode: inline");
        tokio::spawn(run_finalize_sweeper(ctx.clone(), cancel.clone()));
    }

    let state = AppState::new(ctx, lifecycle);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    info!("mia-gateway stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
    cancel.cancel();
}
