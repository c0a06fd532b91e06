//! Delivery stage: send the finished report to its recipients.

use crate::analytics::render_report_text;
use crate::context::PipelineContext;
use crate::providers::delivery::{DeliveryAttachment, DeliveryProvider as _, DeliveryRequest};
use crate::stages::STAGE_IDEMPOTENCY_SCOPE;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::idempotency::{self, DEFAULT_TTL_MS};
use mia_common::db::meetings::{self, MeetingStatus};
use mia_common::events::MiaEvent;
use mia_common::queue::envelope::idempotency_key;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use serde_json::json;
use tracing::{debug, info};

/// Send the report. Returns false on duplicate delivery of the same epoch
/// (the mail must not go out twice).
pub async fn run_delivery(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<bool> {
    let meeting = meetings::get_meeting(&ctx.db, meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let key = idempotency_key(meeting_id, "delivery", &json!({}), meeting.rebuild_epoch);
    if !idempotency::check_and_set(&ctx.db, STAGE_IDEMPOTENCY_SCOPE, meeting_id, &key, DEFAULT_TTL_MS)
        .await?
    {
        debug!(meeting_id, "delivery re-delivery deduplicated");
        return Ok(false);
    }

    let report_json = artifacts::get_artifact(&ctx.db, meeting_id, ArtifactKind::Report)
        .await?
        .ok_or_else(|| Error::NotFound(format!("report artifact missing for {}", meeting_id)))?;
    let report: serde_json::Value = serde_json::from_str(&report_json)?;

    let request = DeliveryRequest {
        meeting_id: meeting_id.to_string(),
        recipients: meeting.delivery_recipients.clone(),
        subject: format!("Meeting report: {}", meeting_id),
        body: render_report_text(&report),
        attachments: vec![DeliveryAttachment {
            filename: "report.json".to_string(),
            content: report_json.into_bytes(),
        }],
    };
    ctx.delivery.send(&request).await?;

    let old = meetings::set_status(&ctx.db, meeting_id, MeetingStatus::Done, false).await?;
    ctx.emit_event(MiaEvent::MeetingStatusChanged {
        meeting_id: meeting_id.to_string(),
        old_status: old.as_str().to_string(),
        new_status: MeetingStatus::Done.as_str().to_string(),
        timestamp: chrono::Utc::now(),
    })
    .await;

    info!(
        meeting_id,
        trace_id = %trace.trace_id,
        recipients = request.recipients.len(),
        "report delivered"
    );
    Ok(true)
}
