//! Reconciliation loop.
//!
//! The single periodic task allowed to mutate connector sessions outside
//! explicit admin calls: reconnects stale sessions, live-pulls chunks from
//! active ones, and (when enabled) self-heals the circuit breaker. Each
//! per-session step goes through the lifecycle manager, so it competes for
//! the same op locks as admin traffic and skips busy meetings.

use crate::connector::lifecycle::ConnectorLifecycle;
use mia_common::db::sessions;
use mia_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub stale_seen: u32,
    pub reconnected: u32,
    pub sessions_pulled: u32,
    pub chunks_pulled: u32,
    pub skipped_busy: u32,
    pub breaker_reset: bool,
}

/// One reconciliation pass.
pub async fn run_reconcile_once(lifecycle: &ConnectorLifecycle) -> Result<ReconcileReport> {
    let ctx = lifecycle.context().clone();
    let settings = &ctx.settings;
    let mut report = ReconcileReport::default();

    // 1. Reconnect connected sessions that went quiet.
    let cutoff = (chrono::Utc::now()
        - chrono::Duration::seconds(settings.reconcile_stale_sec as i64))
    .to_rfc3339();
    let stale = sessions::list_stale_connected(
        &ctx.db,
        lifecycle.provider(),
        &cutoff,
        settings.reconciliation_limit as i64,
    )
    .await?;
    report.stale_seen = stale.len() as u32;

    for session in stale {
        match lifecycle.reconnect(&session.meeting_id).await {
            Ok(_) => report.reconnected += 1,
            Err(Error::Busy(_)) => report.skipped_busy += 1,
            Err(e) => {
                warn!(meeting_id = %session.meeting_id, error = %e, "stale session reconnect failed")
            }
        }
    }

    // 2. Live-pull from active sessions.
    let active = sessions::list_connected(
        &ctx.db,
        lifecycle.provider(),
        settings.live_pull_sessions_limit as i64,
    )
    .await?;
    for session in active {
        match lifecycle.live_pull(&session.meeting_id).await {
            Ok(outcome) => {
                report.sessions_pulled += 1;
                report.chunks_pulled += outcome.pulled;
            }
            Err(Error::Busy(_)) => report.skipped_busy += 1,
            Err(e) => {
                warn!(meeting_id = %session.meeting_id, error = %e, "live pull failed")
            }
        }
    }

    // 3. Breaker self-heal.
    if settings.cb_auto_reset_enabled {
        let min_age_ms = (settings.cb_auto_reset_min_age_sec * 1000) as i64;
        if lifecycle.breaker().eligible_for_auto_reset(min_age_ms).await? {
            lifecycle
                .breaker_reset("reconciliation", "auto reset after minimum open age")
                .await?;
            report.breaker_reset = true;
        }
    }

    Ok(report)
}

/// Long-running reconciliation task tied to the process lifecycle.
pub async fn run_reconciliation_loop(
    lifecycle: Arc<ConnectorLifecycle>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(
        lifecycle.context().settings.reconcile_interval_sec.max(1),
    );
    info!(
        provider = lifecycle.provider(),
        interval_sec = interval.as_secs(),
        "reconciliation loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match run_reconcile_once(&lifecycle).await {
            Ok(report) => info!(
                reconnected = report.reconnected,
                sessions_pulled = report.sessions_pulled,
                chunks_pulled = report.chunks_pulled,
                skipped_busy = report.skipped_busy,
                breaker_reset = report.breaker_reset,
                "reconciliation pass completed"
            ),
            Err(e) => warn!(error = %e, "reconciliation pass failed"),
        }
    }
    info!("reconciliation loop stopped");
}
