//! Canonical job record carried through the queues.

use crate::trace::TraceContext;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Job envelope. `attempt` counts deliveries that have already failed;
/// retries share the same `job_id` and trace context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub queue: String,
    pub meeting_id: String,
    /// Pipeline step name ("stt", "enhance", "analytics", "delivery")
    pub step: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl JobEnvelope {
    pub fn new(
        queue: impl Into<String>,
        meeting_id: impl Into<String>,
        step: impl Into<String>,
        payload: serde_json::Value,
        trace: &TraceContext,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            queue: queue.into(),
            meeting_id: meeting_id.into(),
            step: step.into(),
            attempt: 0,
            max_attempts,
            payload,
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            parent_span_id: trace.parent_span_id.clone(),
            enqueued_at: chrono::Utc::now(),
        }
    }

    /// Trace context for handler execution (child span of the enqueuer).
    pub fn trace(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
        }
        .child()
    }

    /// Deterministic idempotency key: re-deliveries of the same logical work
    /// produce the same digest, a rebuild epoch produces a fresh one.
    pub fn idempotency_key(&self, epoch: i64) -> String {
        idempotency_key(&self.meeting_id, &self.step, &self.payload, epoch)
    }
}

/// Digest of `(meeting, step, payload, epoch)`.
pub fn idempotency_key(
    meeting_id: &str,
    step: &str,
    payload: &serde_json::Value,
    epoch: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meeting_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(step.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(epoch.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotency_key_is_stable_across_retries() {
        let trace = TraceContext::new_root();
        let a = JobEnvelope::new("q:stt", "m-1", "stt", json!({"chunk_seq": 0}), &trace, 3);
        let mut b = a.clone();
        b.attempt = 2;
        b.job_id = Uuid::new_v4();

        assert_eq!(a.idempotency_key(0), b.idempotency_key(0));
    }

    #[test]
    fn test_epoch_invalidates_key() {
        let trace = TraceContext::new_root();
        let job = JobEnvelope::new("q:enhancer", "m-1", "enhance", json!({}), &trace, 3);
        assert_ne!(job.idempotency_key(0), job.idempotency_key(1));
    }

    #[test]
    fn test_key_differs_by_step_and_payload() {
        let base = idempotency_key("m-1", "stt", &json!({"chunk_seq": 0}), 0);
        assert_ne!(base, idempotency_key("m-1", "enhance", &json!({"chunk_seq": 0}), 0));
        assert_ne!(base, idempotency_key("m-1", "stt", &json!({"chunk_seq": 1}), 0));
        assert_ne!(base, idempotency_key("m-2", "stt", &json!({"chunk_seq": 0}), 0));
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let trace = TraceContext::new_root();
        let job = JobEnvelope::new("q:stt", "m-1", "stt", json!({"chunk_seq": 4}), &trace, 3);
        let raw = serde_json::to_string(&job).unwrap();
        let back: JobEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.trace_id, trace.trace_id);
        assert_eq!(back.payload["chunk_seq"], 4);
    }
}
