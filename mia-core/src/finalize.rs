//! Meeting finalization.
//!
//! Explicit finalize (HTTP endpoint or WebSocket frame) and the inactivity
//! sweeper converge here; the first caller wins and kicks the enhancer,
//! later callers are no-ops.

use crate::context::PipelineContext;
use crate::dispatcher;
use mia_common::db::meetings;
use mia_common::time::now_rfc3339;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Finalize a meeting and start the downstream pipeline. Returns false if
/// the meeting was already finalized.
pub async fn finalize_meeting(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
    source: &str,
) -> Result<bool> {
    meetings::get_meeting(&ctx.db, meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

    if !meetings::mark_finalized(&ctx.db, meeting_id).await? {
        info!(meeting_id, source, "finalize ignored, meeting already finalized");
        return Ok(false);
    }

    info!(meeting_id, source, trace_id = %trace.trace_id, "meeting finalized");
    dispatcher::enqueue_enhancer(ctx, meeting_id, &trace.child()).await?;
    Ok(true)
}

/// Periodic sweeper finalizing meetings that went quiet. Explicit finalize
/// always wins: the sweeper only sees unfinalized meetings.
pub async fn run_finalize_sweeper(ctx: std::sync::Arc<PipelineContext>, cancel: CancellationToken) {
    let inactivity = Duration::from_secs(ctx.settings.finalize_inactivity_sec.max(1));
    let interval = Duration::from_secs((ctx.settings.finalize_inactivity_sec / 4).clamp(2, 30));
    info!(
        inactivity_sec = inactivity.as_secs(),
        interval_sec = interval.as_secs(),
        "finalize sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let cutoff = (chrono::Utc::now()
            - chrono::Duration::from_std(inactivity).unwrap_or_else(|_| chrono::Duration::seconds(60)))
        .to_rfc3339();
        let candidates = match meetings::list_inactive_unfinalized(&ctx.db, &cutoff, 32).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "finalize sweeper scan failed");
                continue;
            }
        };

        for meeting_id in candidates {
            let trace = TraceContext::new_root();
            match finalize_meeting(&ctx, &meeting_id, &trace, "inactivity").await {
                Ok(true) => info!(meeting_id = %meeting_id, at = %now_rfc3339(), "inactive meeting finalized"),
                Ok(false) => {}
                Err(e) => warn!(meeting_id = %meeting_id, error = %e, "inactivity finalize failed"),
            }
        }
    }
    info!("finalize sweeper stopped");
}
