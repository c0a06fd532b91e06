//! Shared chunk ingest path.
//!
//! HTTP, WebSocket and connector live-pull all normalize through here:
//! dedup → assign `chunk_seq` (serialized per meeting) → persist payload to
//! blob storage → create the chunk record → hand the chunk to the STT stage
//! (enqueue or inline).

use crate::context::PipelineContext;
use crate::dispatcher::{self, EnqueueOutcome};
use mia_common::blob::{chunk_key, BlobStore as _};
use mia_common::db::idempotency::{self, DEFAULT_TTL_MS};
use mia_common::db::{chunks, meetings};
use mia_common::db::meetings::MeetingStatus;
use mia_common::events::MiaEvent;
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use tracing::info;
use uuid::Uuid;

const INGEST_IDEMPOTENCY_SCOPE: &str = "ingest";

/// One chunk entering the system.
pub struct ChunkIngestRequest {
    pub meeting_id: String,
    /// Client-assigned sequence (WebSocket, live-pull); `None` lets the
    /// server assign the next free one.
    pub seq: Option<i64>,
    pub media: Vec<u8>,
    /// Client-supplied dedup key; absent means no dedup across submissions.
    pub idempotency_key: Option<String>,
    pub trace: TraceContext,
}

#[derive(Debug)]
pub struct ChunkIngestOutcome {
    pub meeting_id: String,
    /// `None` only for duplicates whose original sequence is unknown.
    pub chunk_seq: Option<i64>,
    pub blob_key: Option<String>,
    pub idempotency_key: String,
    pub is_duplicate: bool,
    /// Transcript events produced immediately (inline mode only).
    pub inline_events: Vec<MiaEvent>,
}

/// Ingest one audio chunk.
pub async fn ingest_chunk(
    ctx: &PipelineContext,
    request: ChunkIngestRequest,
) -> Result<ChunkIngestOutcome> {
    let meeting = meetings::get_meeting(&ctx.db, &request.meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", request.meeting_id)))?;

    if meeting.finalized_at.is_some() {
        return Err(Error::InvalidInput(format!(
            "meeting already finalized: {}",
            request.meeting_id
        )));
    }
    if request.media.is_empty() {
        return Err(Error::InvalidInput("empty media payload".to_string()));
    }

    let idem_key = request
        .idempotency_key
        .clone()
        .unwrap_or_else(|| format!("chunk-{}", Uuid::new_v4().simple()));

    if !idempotency::check_and_set(
        &ctx.db,
        INGEST_IDEMPOTENCY_SCOPE,
        &request.meeting_id,
        &idem_key,
        DEFAULT_TTL_MS,
    )
    .await?
    {
        info!(
            meeting_id = %request.meeting_id,
            idempotency_key = %idem_key,
            "duplicate chunk ignored"
        );
        return Ok(ChunkIngestOutcome {
            meeting_id: request.meeting_id,
            chunk_seq: request.seq,
            blob_key: None,
            idempotency_key: idem_key,
            is_duplicate: true,
            inline_events: Vec::new(),
        });
    }

    // Sequence assignment and the chunk insert are serialized per meeting;
    // the record's uniqueness constraint backstops races anyway.
    let (chunk_seq, blob_key) = {
        let _guard = ctx.locks.lock(&request.meeting_id).await;
        let seq = match request.seq {
            Some(seq) if seq >= 0 => seq,
            Some(seq) => {
                return Err(Error::InvalidInput(format!("negative chunk seq: {}", seq)))
            }
            None => chunks::next_chunk_seq(&ctx.db, &request.meeting_id).await?,
        };

        let blob_key = chunk_key(&request.meeting_id, seq);
        ctx.blob.put(&blob_key, &request.media).await?;
        chunks::insert_chunk(
            &ctx.db,
            &request.meeting_id,
            seq,
            &blob_key,
            Some(&request.trace.trace_id),
        )
        .await?;
        (seq, blob_key)
    };

    if meeting.status == MeetingStatus::Created {
        meetings::set_status(&ctx.db, &request.meeting_id, MeetingStatus::Ingesting, false).await?;
    }
    meetings::touch_last_chunk(&ctx.db, &request.meeting_id).await?;

    let outcome = dispatcher::enqueue_stt(
        ctx,
        &request.meeting_id,
        chunk_seq,
        &blob_key,
        &request.trace,
    )
    .await?;
    let inline_events = match outcome {
        EnqueueOutcome::Inline { events } => events,
        EnqueueOutcome::Enqueued { .. } => Vec::new(),
    };

    info!(
        meeting_id = %request.meeting_id,
        chunk_seq,
        trace_id = %request.trace.trace_id,
        bytes = request.media.len(),
        "chunk ingested"
    );

    Ok(ChunkIngestOutcome {
        meeting_id: request.meeting_id,
        chunk_seq: Some(chunk_seq),
        blob_key: Some(blob_key),
        idempotency_key: idem_key,
        is_duplicate: false,
        inline_events,
    })
}
