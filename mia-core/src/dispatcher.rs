//! Queue dispatcher: canonical queue names and enqueue helpers for every
//! pipeline stage.
//!
//! In inline mode the helpers execute the stage in-process instead of
//! touching the broker, so callers never branch on the queue mode
//! themselves. Failures in inline mode surface directly to the caller.

use crate::context::PipelineContext;
use crate::stages;
use mia_common::config::QueueMode;
use mia_common::events::MiaEvent;
use mia_common::queue::broker::Broker as _;
use mia_common::queue::envelope::JobEnvelope;
use mia_common::trace::TraceContext;
use mia_common::Result;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const Q_STT: &str = "q:stt";
pub const Q_ENHANCER: &str = "q:enhancer";
pub const Q_ANALYTICS: &str = "q:analytics";
pub const Q_DELIVERY: &str = "q:delivery";

/// The forward pipeline, in order.
pub const PIPELINE_QUEUES: &[&str] = &[Q_STT, Q_ENHANCER, Q_ANALYTICS, Q_DELIVERY];

/// Result of dispatching a stage.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Enqueued { job_id: Uuid, queue: &'static str },
    /// Inline mode: the stage already ran; `events` carries anything the
    /// caller should relay immediately (e.g. transcript updates).
    Inline { events: Vec<MiaEvent> },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            EnqueueOutcome::Enqueued { job_id, .. } => Some(*job_id),
            EnqueueOutcome::Inline { .. } => None,
        }
    }
}

pub async fn enqueue_stt(
    ctx: &PipelineContext,
    meeting_id: &str,
    chunk_seq: i64,
    blob_key: &str,
    trace: &TraceContext,
) -> Result<EnqueueOutcome> {
    if ctx.settings.queue_mode == QueueMode::Inline {
        let event = stages::stt::run_stt(ctx, meeting_id, chunk_seq, blob_key, trace).await?;
        info!(meeting_id, chunk_seq, trace_id = %trace.trace_id, "stt ran inline");
        return Ok(EnqueueOutcome::Inline {
            events: event.into_iter().collect(),
        });
    }

    let job = JobEnvelope::new(
        Q_STT,
        meeting_id,
        "stt",
        json!({"chunk_seq": chunk_seq, "blob_key": blob_key}),
        trace,
        ctx.settings.queue_max_attempts,
    );
    let job_id = job.job_id;
    ctx.broker.enqueue(&job).await?;
    info!(meeting_id, chunk_seq, job_id = %job_id, trace_id = %trace.trace_id, "stt job enqueued");
    Ok(EnqueueOutcome::Enqueued { job_id, queue: Q_STT })
}

pub async fn enqueue_enhancer(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<EnqueueOutcome> {
    if ctx.settings.queue_mode == QueueMode::Inline {
        stages::enhancer::run_enhance(ctx, meeting_id, trace).await?;
        return Ok(EnqueueOutcome::Inline { events: Vec::new() });
    }

    let job = JobEnvelope::new(
        Q_ENHANCER,
        meeting_id,
        "enhance",
        json!({}),
        trace,
        ctx.settings.queue_max_attempts,
    );
    let job_id = job.job_id;
    ctx.broker.enqueue(&job).await?;
    info!(meeting_id, job_id = %job_id, trace_id = %trace.trace_id, "enhancer job enqueued");
    Ok(EnqueueOutcome::Enqueued { job_id, queue: Q_ENHANCER })
}

pub async fn enqueue_analytics(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<EnqueueOutcome> {
    if ctx.settings.queue_mode == QueueMode::Inline {
        stages::analytics::run_analytics(ctx, meeting_id, trace).await?;
        return Ok(EnqueueOutcome::Inline { events: Vec::new() });
    }

    let job = JobEnvelope::new(
        Q_ANALYTICS,
        meeting_id,
        "analytics",
        json!({}),
        trace,
        ctx.settings.queue_max_attempts,
    );
    let job_id = job.job_id;
    ctx.broker.enqueue(&job).await?;
    info!(meeting_id, job_id = %job_id, trace_id = %trace.trace_id, "analytics job enqueued");
    Ok(EnqueueOutcome::Enqueued { job_id, queue: Q_ANALYTICS })
}

pub async fn enqueue_delivery(
    ctx: &PipelineContext,
    meeting_id: &str,
    trace: &TraceContext,
) -> Result<EnqueueOutcome> {
    if ctx.settings.queue_mode == QueueMode::Inline {
        stages::delivery::run_delivery(ctx, meeting_id, trace).await?;
        return Ok(EnqueueOutcome::Inline { events: Vec::new() });
    }

    let job = JobEnvelope::new(
        Q_DELIVERY,
        meeting_id,
        "delivery",
        json!({}),
        trace,
        ctx.settings.queue_max_attempts,
    );
    let job_id = job.job_id;
    ctx.broker.enqueue(&job).await?;
    info!(meeting_id, job_id = %job_id, trace_id = %trace.trace_id, "delivery job enqueued");
    Ok(EnqueueOutcome::Enqueued { job_id, queue: Q_DELIVERY })
}
