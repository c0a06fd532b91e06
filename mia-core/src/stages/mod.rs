//! Pipeline stage handlers.
//!
//! Each stage exposes a `run_*` function with the actual semantics (shared
//! by queue workers and the inline composite) plus a thin `JobHandler`
//! wrapper that parses the envelope payload and classifies failures.

pub mod analytics;
pub mod delivery;
pub mod enhancer;
pub mod stt;

use crate::context::PipelineContext;
use async_trait::async_trait;
use mia_common::queue::worker::{HandlerError, JobContext, JobHandler};
use mia_common::queue::JobEnvelope;
use mia_common::Error;
use std::sync::Arc;

/// Idempotency scope shared by all stage executions.
pub(crate) const STAGE_IDEMPOTENCY_SCOPE: &str = "stage";

pub struct SttHandler {
    pub ctx: Arc<PipelineContext>,
}

#[async_trait]
impl JobHandler for SttHandler {
    fn name(&self) -> &'static str {
        "stt"
    }

    async fn handle(&self, job: &JobEnvelope, ctx: &JobContext) -> Result<(), HandlerError> {
        let chunk_seq = job
            .payload
            .get("chunk_seq")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                HandlerError::Fatal(Error::InvalidInput("stt payload missing chunk_seq".into()))
            })?;
        let blob_key = job
            .payload
            .get("blob_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerError::Fatal(Error::InvalidInput("stt payload missing blob_key".into()))
            })?;

        stt::run_stt(&self.ctx, &job.meeting_id, chunk_seq, blob_key, &ctx.trace)
            .await
            .map(|_| ())
            .map_err(HandlerError::from_error)
    }
}

pub struct EnhancerHandler {
    pub ctx: Arc<PipelineContext>,
}

#[async_trait]
impl JobHandler for EnhancerHandler {
    fn name(&self) -> &'static str {
        "enhancer"
    }

    async fn handle(&self, job: &JobEnvelope, ctx: &JobContext) -> Result<(), HandlerError> {
        enhancer::run_enhance(&self.ctx, &job.meeting_id, &ctx.trace)
            .await
            .map(|_| ())
            .map_err(HandlerError::from_error)
    }
}

pub struct AnalyticsHandler {
    pub ctx: Arc<PipelineContext>,
}

#[async_trait]
impl JobHandler for AnalyticsHandler {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn handle(&self, job: &JobEnvelope, ctx: &JobContext) -> Result<(), HandlerError> {
        analytics::run_analytics(&self.ctx, &job.meeting_id, &ctx.trace)
            .await
            .map(|_| ())
            .map_err(HandlerError::from_error)
    }
}

pub struct DeliveryHandler {
    pub ctx: Arc<PipelineContext>,
}

#[async_trait]
impl JobHandler for DeliveryHandler {
    fn name(&self) -> &'static str {
        "delivery"
    }

    async fn handle(&self, job: &JobEnvelope, ctx: &JobContext) -> Result<(), HandlerError> {
        delivery::run_delivery(&self.ctx, &job.meeting_id, &ctx.trace)
            .await
            .map(|_| ())
            .map_err(HandlerError::from_error)
    }
}
