//! Analytics stage: enhanced transcript → report, scorecard, comparison.

use crate::analytics::{build_comparison, build_report, build_scorecard};
use crate::context::PipelineContext;
use crate::dispatcher;
use crate::stages::STAGE_IDEMPOTENCY_SCOPE;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::idempotency::{self, DEFAULT_TTL_MS};
use mia_common::db::meetings::{self, MeetingStatus};
use mia_common::db::segments;
use mia_common::events::MiaEvent;
use mia_common::queue::envelope::idempotency_key;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use serde_json::json;
use tracing::{debug, info};

/// Build the report artifacts. Chains to delivery when the meeting has a
/// delivery recipe, otherwise the meeting is done here.
pub async fn run_analytics(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<bool> {
    let meeting = meetings::get_meeting(&ctx.db, meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let key = idempotency_key(meeting_id, "analytics", &json!({}), meeting.rebuild_epoch);
    if !idempotency::check_and_set(&ctx.db, STAGE_IDEMPOTENCY_SCOPE, meeting_id, &key, DEFAULT_TTL_MS)
        .await?
    {
        debug!(meeting_id, "analytics re-delivery deduplicated");
        return Ok(false);
    }

    let segment_list = segments::list_segments(&ctx.db, meeting_id).await?;
    let raw = artifacts::get_artifact(&ctx.db, meeting_id, ArtifactKind::RawTranscript)
        .await?
        .unwrap_or_default();
    let enhanced = artifacts::get_artifact(&ctx.db, meeting_id, ArtifactKind::EnhancedTranscript)
        .await?
        .unwrap_or_default();

    let report = build_report(&enhanced, &segment_list);
    let scorecard = build_scorecard(&segment_list);
    let comparison = build_comparison(&raw, &enhanced);

    {
        let _guard = ctx.locks.lock(meeting_id).await;
        artifacts::upsert_artifact(&ctx.db, meeting_id, ArtifactKind::Report, &report.to_string())
            .await?;
        artifacts::upsert_artifact(
            &ctx.db,
            meeting_id,
            ArtifactKind::Scorecard,
            &scorecard.to_string(),
        )
        .await?;
        artifacts::upsert_artifact(
            &ctx.db,
            meeting_id,
            ArtifactKind::Comparison,
            &comparison.to_string(),
        )
        .await?;
    }

    info!(meeting_id, trace_id = %trace.trace_id, "report built");
    ctx.emit_event(MiaEvent::ReportReady {
        meeting_id: meeting_id.to_string(),
        summary: report["summary"].as_str().unwrap_or_default().to_string(),
        timestamp: chrono::Utc::now(),
    })
    .await;

    if meeting.delivery_recipients.is_empty() {
        let old = meetings::set_status(&ctx.db, meeting_id, MeetingStatus::Done, false).await?;
        ctx.emit_event(MiaEvent::MeetingStatusChanged {
            meeting_id: meeting_id.to_string(),
            old_status: old.as_str().to_string(),
            new_status: MeetingStatus::Done.as_str().to_string(),
            timestamp: chrono::Utc::now(),
        })
        .await;
    } else {
        dispatcher::enqueue_delivery(ctx, meeting_id, &trace.child()).await?;
    }
    Ok(true)
}
