//! STT stage: audio chunk → transcript segment → raw transcript artifact.

use crate::context::PipelineContext;
use crate::providers::stt::{resolve_speaker, SttProvider as _};
use crate::stages::STAGE_IDEMPOTENCY_SCOPE;
use mia_common::blob::BlobStore as _;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::idempotency::{self, DEFAULT_TTL_MS};
use mia_common::db::meetings::{self, MeetingStatus};
use mia_common::db::segments::{self, TranscriptSegment};
use mia_common::events::MiaEvent;
use mia_common::queue::envelope::idempotency_key;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use serde_json::json;
use tracing::{debug, info};

/// Transcribe one chunk. Returns the transcript event when new text was
/// produced; `None` on duplicates or empty audio.
pub async fn run_stt(
    ctx: &PipelineContext,
    meeting_id: &str,
    chunk_seq: i64,
    blob_key: &str,
    trace: &TraceContext,
) -> Result<Option<MiaEvent>> {
    let meeting = meetings::get_meeting(&ctx.db, meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let key = idempotency_key(
        meeting_id,
        "stt",
        &json!({"chunk_seq": chunk_seq, "blob_key": blob_key}),
        meeting.rebuild_epoch,
    );
    if !idempotency::check_and_set(&ctx.db, STAGE_IDEMPOTENCY_SCOPE, meeting_id, &key, DEFAULT_TTL_MS)
        .await?
    {
        debug!(meeting_id, chunk_seq, "stt re-delivery deduplicated");
        return Ok(None);
    }

    let audio = ctx.blob.get(blob_key).await?;
    let result = ctx.stt.transcribe_chunk(&audio, 16000).await?;
    let raw_text = result.text.trim().to_string();

    meetings::set_status(&ctx.db, meeting_id, MeetingStatus::Processing, false).await?;

    if raw_text.is_empty() {
        debug!(meeting_id, chunk_seq, "chunk produced no text");
        return Ok(None);
    }

    let speaker = resolve_speaker(result.speaker.as_deref(), chunk_seq);
    segments::upsert_segment(
        &ctx.db,
        &TranscriptSegment {
            meeting_id: meeting_id.to_string(),
            seq: chunk_seq,
            speaker: Some(speaker.clone()),
            raw_text: raw_text.clone(),
            enhanced_text: raw_text.clone(),
            confidence: result.confidence,
        },
    )
    .await?;

    // Artifact writes are serialized per meeting; segments may complete out
    // of order, the artifact is reassembled by seq every time.
    {
        let _guard = ctx.locks.lock(meeting_id).await;
        let all = segments::list_segments(&ctx.db, meeting_id).await?;
        let raw_transcript = render_transcript(&all, |s| &s.raw_text);
        artifacts::upsert_artifact(&ctx.db, meeting_id, ArtifactKind::RawTranscript, &raw_transcript)
            .await?;
    }

    info!(
        meeting_id,
        chunk_seq,
        trace_id = %trace.trace_id,
        chars = raw_text.len(),
        "chunk transcribed"
    );

    let event = MiaEvent::TranscriptUpdate {
        meeting_id: meeting_id.to_string(),
        seq_high: chunk_seq,
        speaker: Some(speaker),
        text: raw_text,
        quality: None,
        timestamp: chrono::Utc::now(),
    };
    ctx.emit_event(event.clone()).await;
    Ok(Some(event))
}

/// Join segments into a transcript, one speaker-attributed line per
/// segment, ordered by seq.
pub fn render_transcript<'a, F>(segments: &'a [TranscriptSegment], text_of: F) -> String
where
    F: Fn(&'a TranscriptSegment) -> &'a str,
{
    segments
        .iter()
        .filter(|s| !text_of(s).trim().is_empty())
        .map(|s| {
            format!(
                "[{}] {}",
                s.speaker.as_deref().unwrap_or("unknown"),
                text_of(s).trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
