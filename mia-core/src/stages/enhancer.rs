//! Enhancer stage: raw transcript → enhanced transcript artifact.

use crate::context::PipelineContext;
use crate::dispatcher;
use crate::providers::enhance::{quality_score, EnhanceProvider as _};
use crate::stages::stt::render_transcript;
use crate::stages::STAGE_IDEMPOTENCY_SCOPE;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::idempotency::{self, DEFAULT_TTL_MS};
use mia_common::db::meetings::{self, MeetingStatus};
use mia_common::db::segments;
use mia_common::queue::envelope::idempotency_key;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use serde_json::json;
use tracing::{debug, info};

/// Enhance every segment and write the enhanced transcript artifact.
/// Returns false when this epoch was already enhanced (duplicate delivery).
pub async fn run_enhance(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<bool> {
    let meeting = meetings::get_meeting(&ctx.db, meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let key = idempotency_key(meeting_id, "enhance", &json!({}), meeting.rebuild_epoch);
    if !idempotency::check_and_set(&ctx.db, STAGE_IDEMPOTENCY_SCOPE, meeting_id, &key, DEFAULT_TTL_MS)
        .await?
    {
        debug!(meeting_id, "enhance re-delivery deduplicated");
        return Ok(false);
    }

    meetings::set_status(&ctx.db, meeting_id, MeetingStatus::Processing, false).await?;

    let segment_list = segments::list_segments(&ctx.db, meeting_id).await?;
    let mut quality_sum = 0.0;
    for segment in &segment_list {
        let enhanced = ctx.enhancer.enhance(&segment.raw_text).await?;
        quality_sum += quality_score(&segment.raw_text, &enhanced);
        segments::set_enhanced_text(&ctx.db, meeting_id, segment.seq, &enhanced).await?;
    }

    {
        let _guard = ctx.locks.lock(meeting_id).await;
        let refreshed = segments::list_segments(&ctx.db, meeting_id).await?;
        let enhanced_transcript = render_transcript(&refreshed, |s| &s.enhanced_text);
        artifacts::upsert_artifact(
            &ctx.db,
            meeting_id,
            ArtifactKind::EnhancedTranscript,
            &enhanced_transcript,
        )
        .await?;
    }

    let mean_quality = if segment_list.is_empty() {
        1.0
    } else {
        quality_sum / segment_list.len() as f64
    };
    info!(
        meeting_id,
        trace_id = %trace.trace_id,
        segments = segment_list.len(),
        quality = mean_quality,
        "transcript enhanced"
    );

    dispatcher::enqueue_analytics(ctx, meeting_id, &trace.child()).await?;
    Ok(true)
}
