//! Connector lifecycle manager.
//!
//! Per-meeting session state machine over a provider adapter. Every public
//! operation holds the TTL-bounded operation lock for its meeting, so
//! concurrent join/reconnect/leave/live-pull attempts fail fast with `busy`
//! instead of racing the provider. Provider calls go through the circuit
//! breaker and the retry layer; terminal provider failures kill the session.

use crate::connector::{MeetingConnector, ProviderChunk};
use crate::context::PipelineContext;
use crate::ingest::{self, ChunkIngestRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mia_common::breaker::{BreakerConfig, BreakerRecord, CircuitBreaker};
use mia_common::db::kv;
use mia_common::db::meetings;
use mia_common::db::sessions::{self, SessionRecord, SessionState};
use mia_common::events::MiaEvent;
use mia_common::retry::{retry_async, RetryPolicy};
use mia_common::time::{now_rfc3339, parse_rfc3339};
use mia_common::trace::TraceContext;
use mia_common::{Error, Result};
use serde::Serialize;
use sha2::Digest;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize)]
pub struct LivePullOutcome {
    pub pulled: u32,
    pub duplicates: u32,
    pub invalid_chunks: u32,
}

/// TTL op lock held for the duration of one lifecycle operation.
struct OpLockGuard {
    pool: SqlitePool,
    key: String,
    owner: String,
}

impl OpLockGuard {
    async fn release(self) {
        if let Err(e) = kv::release_lock(&self.pool, &self.key, &self.owner).await {
            warn!(key = %self.key, error = %e, "op lock release failed (TTL will expire it)");
        }
    }
}

pub struct ConnectorLifecycle {
    ctx: Arc<PipelineContext>,
    connector: Arc<dyn MeetingConnector>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ConnectorLifecycle {
    pub fn new(ctx: Arc<PipelineContext>, connector: Arc<dyn MeetingConnector>) -> Self {
        let breaker = CircuitBreaker::new(
            ctx.db.clone(),
            connector.provider_name().to_string(),
            BreakerConfig::from_settings(&ctx.settings),
        );
        let retry = RetryPolicy::new(
            ctx.settings.connector_retries,
            ctx.settings.connector_retry_backoff_ms,
        );
        Self {
            ctx,
            connector,
            breaker,
            retry,
        }
    }

    pub fn provider(&self) -> &str {
        self.connector.provider_name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Public operations (op-lock guarded)
    // ------------------------------------------------------------------

    pub async fn join(&self, meeting_id: &str) -> Result<SessionRecord> {
        let guard = self.acquire_op_lock(meeting_id, "join").await?;
        let result = self.join_locked(meeting_id).await;
        guard.release().await;
        result
    }

    pub async fn leave(&self, meeting_id: &str) -> Result<()> {
        let guard = self.acquire_op_lock(meeting_id, "leave").await?;
        let result = self.leave_locked(meeting_id).await;
        guard.release().await;
        result
    }

    pub async fn reconnect(&self, meeting_id: &str) -> Result<SessionRecord> {
        let guard = self.acquire_op_lock(meeting_id, "reconnect").await?;
        let result = self.reconnect_locked(meeting_id).await;
        guard.release().await;
        result
    }

    pub async fn live_pull(&self, meeting_id: &str) -> Result<LivePullOutcome> {
        let guard = self.acquire_op_lock(meeting_id, "live_pull").await?;
        let result = self.live_pull_locked(meeting_id).await;
        guard.release().await;
        result
    }

    pub async fn status(&self, meeting_id: &str) -> Result<Option<SessionRecord>> {
        sessions::get_session(&self.ctx.db, meeting_id, self.provider()).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        sessions::list_sessions(&self.ctx.db, self.provider()).await
    }

    /// Direct provider health probe. Not breaker-gated: a health check must
    /// not consume the single half-open probe.
    pub async fn health(&self) -> Result<crate::connector::ConnectorHealth> {
        self.connector.health().await
    }

    pub async fn breaker_status(&self) -> Result<BreakerRecord> {
        self.breaker.status().await
    }

    pub async fn breaker_reset(&self, source: &str, reason: &str) -> Result<()> {
        self.breaker.reset(source, reason).await?;
        self.ctx
            .emit_event(MiaEvent::BreakerStateChanged {
                provider: self.provider().to_string(),
                state: "closed".to_string(),
                reason: format!("{}: {}", source, reason),
                timestamp: chrono::Utc::now(),
            })
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn acquire_op_lock(&self, meeting_id: &str, op: &str) -> Result<OpLockGuard> {
        let key = format!("oplock:{}:{}", self.provider(), meeting_id);
        let owner = Uuid::new_v4().simple().to_string();
        let ttl_ms = (self.ctx.settings.op_lock_ttl_sec * 1000) as i64;

        if kv::try_acquire_lock(&self.ctx.db, &key, &owner, ttl_ms).await? {
            Ok(OpLockGuard {
                pool: self.ctx.db.clone(),
                key,
                owner,
            })
        } else {
            Err(Error::Busy(format!(
                "another connector operation is in progress for meeting {} ({})",
                meeting_id, op
            )))
        }
    }

    async fn join_locked(&self, meeting_id: &str) -> Result<SessionRecord> {
        meetings::get_meeting(&self.ctx.db, meeting_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", meeting_id)))?;

        let existing = sessions::get_session(&self.ctx.db, meeting_id, self.provider()).await?;

        // Idempotent join: a fresh connected session is returned without a
        // provider call.
        if let Some(session) = &existing {
            if session.state == SessionState::Connected {
                let ttl = chrono::Duration::seconds(self.ctx.settings.join_idempotent_ttl_sec as i64);
                let fresh = session
                    .joined_at
                    .as_deref()
                    .and_then(parse_rfc3339)
                    .map(|joined| chrono::Utc::now() - joined <= ttl)
                    .unwrap_or(false);
                if fresh {
                    info!(meeting_id, "join is idempotent, returning existing session");
                    return Ok(session.clone());
                }
            }
        }

        self.do_join(meeting_id, existing).await
    }

    async fn reconnect_locked(&self, meeting_id: &str) -> Result<SessionRecord> {
        let session = sessions::get_session(&self.ctx.db, meeting_id, self.provider())
            .await?
            .ok_or_else(|| Error::NotFound(format!("no session for meeting: {}", meeting_id)))?;
        info!(meeting_id, from = session.state.as_str(), "reconnecting session");
        self.do_join(meeting_id, Some(session)).await
    }

    /// Shared join path: joining state → provider call → connected/dead.
    async fn do_join(
        &self,
        meeting_id: &str,
        prior: Option<SessionRecord>,
    ) -> Result<SessionRecord> {
        let mut record = SessionRecord {
            meeting_id: meeting_id.to_string(),
            provider: self.provider().to_string(),
            state: SessionState::Joining,
            provider_ref: prior.and_then(|s| s.provider_ref),
            joined_at: None,
            last_seen: None,
            live_pull_failures: 0,
            last_error: None,
            updated_at: now_rfc3339(),
        };
        sessions::upsert_session(&self.ctx.db, &record).await?;
        self.emit_session(meeting_id, SessionState::Joining).await;

        match self.guarded_join(meeting_id).await {
            Ok(outcome) => {
                record.state = SessionState::Connected;
                record.provider_ref = Some(outcome.provider_ref);
                record.joined_at = Some(now_rfc3339());
                record.last_seen = Some(now_rfc3339());
                sessions::upsert_session(&self.ctx.db, &record).await?;
                self.emit_session(meeting_id, SessionState::Connected).await;
                info!(meeting_id, provider = self.provider(), "session connected");
                Ok(record)
            }
            Err(e) => {
                record.last_error = Some(clip(&e.to_string(), 300));
                record.state = match &e {
                    // Terminal provider verdicts kill the session; transient
                    // failures (and circuit-open) leave it joining for a
                    // later retry.
                    Error::Provider { kind, .. } if !kind.is_retryable() => SessionState::Dead,
                    _ => SessionState::Joining,
                };
                sessions::upsert_session(&self.ctx.db, &record).await?;
                self.emit_session(meeting_id, record.state).await;
                warn!(meeting_id, error = %e, state = record.state.as_str(), "join failed");
                Err(e)
            }
        }
    }

    async fn leave_locked(&self, meeting_id: &str) -> Result<()> {
        let mut session = sessions::get_session(&self.ctx.db, meeting_id, self.provider())
            .await?
            .ok_or_else(|| Error::NotFound(format!("no session for meeting: {}", meeting_id)))?;

        let needs_provider_call =
            session.state == SessionState::Connected && session.provider_ref.is_some();

        if needs_provider_call {
            session.state = SessionState::Leaving;
            sessions::upsert_session(&self.ctx.db, &session).await?;
            self.emit_session(meeting_id, SessionState::Leaving).await;

            let provider_ref = session.provider_ref.clone().unwrap_or_default();
            if let Err(e) = self.guarded_leave(meeting_id, &provider_ref).await {
                session.last_error = Some(clip(&e.to_string(), 300));
                sessions::upsert_session(&self.ctx.db, &session).await?;
                warn!(meeting_id, error = %e, "leave failed, session stays leaving");
                return Err(e);
            }
        }

        sessions::delete_session(&self.ctx.db, meeting_id, self.provider()).await?;
        self.emit_session_absent(meeting_id).await;
        info!(meeting_id, "session left");
        Ok(())
    }

    async fn live_pull_locked(&self, meeting_id: &str) -> Result<LivePullOutcome> {
        let mut session = sessions::get_session(&self.ctx.db, meeting_id, self.provider())
            .await?
            .ok_or_else(|| Error::NotFound(format!("no session for meeting: {}", meeting_id)))?;

        if session.state != SessionState::Connected {
            return Err(Error::InvalidInput(format!(
                "live pull requires a connected session (state: {})",
                session.state.as_str()
            )));
        }
        let provider_ref = session
            .provider_ref
            .clone()
            .ok_or_else(|| Error::Internal("connected session without provider_ref".into()))?;

        let batch_limit = self.ctx.settings.live_pull_batch_limit;
        match self.guarded_fetch(meeting_id, &provider_ref, batch_limit).await {
            Ok(chunks) => {
                let outcome = self.ingest_pulled_chunks(meeting_id, chunks).await;
                session.live_pull_failures = 0;
                session.last_seen = Some(now_rfc3339());
                session.last_error = None;
                sessions::upsert_session(&self.ctx.db, &session).await?;
                info!(
                    meeting_id,
                    pulled = outcome.pulled,
                    duplicates = outcome.duplicates,
                    invalid_chunks = outcome.invalid_chunks,
                    "live pull completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                session.live_pull_failures += 1;
                session.last_error = Some(clip(&e.to_string(), 300));
                sessions::upsert_session(&self.ctx.db, &session).await?;

                let threshold = self.ctx.settings.live_pull_fail_reconnect_threshold as i64;
                if session.live_pull_failures >= threshold {
                    warn!(
                        meeting_id,
                        failures = session.live_pull_failures,
                        "live pull failure threshold reached, forcing reconnect"
                    );
                    session.state = SessionState::Disconnected;
                    sessions::upsert_session(&self.ctx.db, &session).await?;
                    self.emit_session(meeting_id, SessionState::Disconnected).await;

                    // Best effort within the held op lock; if it fails the
                    // reconciliation loop retries on the next cycle.
                    if let Err(rejoin_err) = self.do_join(meeting_id, Some(session)).await {
                        warn!(meeting_id, error = %rejoin_err, "forced reconnect failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Validate and hand pulled chunks to the shared ingest path. Invalid
    /// chunks are counted, not propagated.
    async fn ingest_pulled_chunks(
        &self,
        meeting_id: &str,
        chunks: Vec<ProviderChunk>,
    ) -> LivePullOutcome {
        let mut outcome = LivePullOutcome::default();
        for chunk in chunks {
            let bytes = match BASE64.decode(chunk.media_b64.as_bytes()) {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    outcome.invalid_chunks += 1;
                    continue;
                }
                Err(e) => {
                    warn!(meeting_id, error = %e, "live pull chunk failed base64 decode");
                    outcome.invalid_chunks += 1;
                    continue;
                }
            };

            let dedup_key = match chunk.seq {
                Some(seq) => format!("live-pull-{}", seq),
                None => format!("live-pull-{}", hex::encode(sha2::Sha256::digest(&bytes))),
            };

            let request = ChunkIngestRequest {
                meeting_id: meeting_id.to_string(),
                seq: chunk.seq,
                media: bytes,
                idempotency_key: Some(dedup_key),
                trace: TraceContext::new_root(),
            };
            match ingest::ingest_chunk(&self.ctx, request).await {
                Ok(result) if result.is_duplicate => outcome.duplicates += 1,
                Ok(_) => outcome.pulled += 1,
                Err(e) => {
                    warn!(meeting_id, error = %e, "live pull chunk rejected by ingest");
                    outcome.invalid_chunks += 1;
                }
            }
        }
        outcome
    }

    // Breaker-gated provider calls. Each attempt checks the breaker and
    // reports its result, so every provider failure counts toward the
    // threshold and an opening breaker cuts a retry sequence short.

    async fn guarded_join(&self, meeting_id: &str) -> Result<crate::connector::JoinOutcome> {
        let connector = self.connector.clone();
        let breaker = self.breaker.clone();
        let meeting = meeting_id.to_string();
        retry_async(self.retry, "connector.join", move || {
            let connector = connector.clone();
            let breaker = breaker.clone();
            let meeting = meeting.clone();
            async move {
                breaker.check().await?;
                match connector.join(&meeting).await {
                    Ok(outcome) => {
                        breaker.record_success().await?;
                        Ok(outcome)
                    }
                    Err(e) => {
                        let _ = breaker.record_failure(&breaker_reason(&e)).await;
                        Err(e)
                    }
                }
            }
        })
        .await
    }

    async fn guarded_leave(&self, meeting_id: &str, provider_ref: &str) -> Result<()> {
        let connector = self.connector.clone();
        let breaker = self.breaker.clone();
        let meeting = meeting_id.to_string();
        let provider_ref = provider_ref.to_string();
        retry_async(self.retry, "connector.leave", move || {
            let connector = connector.clone();
            let breaker = breaker.clone();
            let meeting = meeting.clone();
            let provider_ref = provider_ref.clone();
            async move {
                breaker.check().await?;
                match connector.leave(&meeting, &provider_ref).await {
                    Ok(()) => {
                        breaker.record_success().await?;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = breaker.record_failure(&breaker_reason(&e)).await;
                        Err(e)
                    }
                }
            }
        })
        .await
    }

    async fn guarded_fetch(
        &self,
        meeting_id: &str,
        provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>> {
        let connector = self.connector.clone();
        let breaker = self.breaker.clone();
        let meeting = meeting_id.to_string();
        let provider_ref = provider_ref.to_string();
        retry_async(self.retry, "connector.fetch_chunks", move || {
            let connector = connector.clone();
            let breaker = breaker.clone();
            let meeting = meeting.clone();
            let provider_ref = provider_ref.clone();
            async move {
                breaker.check().await?;
                match connector.fetch_chunks(&meeting, &provider_ref, limit).await {
                    Ok(chunks) => {
                        breaker.record_success().await?;
                        Ok(chunks)
                    }
                    Err(e) => {
                        let _ = breaker.record_failure(&breaker_reason(&e)).await;
                        Err(e)
                    }
                }
            }
        })
        .await
    }

    async fn emit_session(&self, meeting_id: &str, state: SessionState) {
        self.ctx
            .emit_event(MiaEvent::ConnectorSessionChanged {
                meeting_id: meeting_id.to_string(),
                provider: self.provider().to_string(),
                state: state.as_str().to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await;
    }

    async fn emit_session_absent(&self, meeting_id: &str) {
        self.ctx
            .emit_event(MiaEvent::ConnectorSessionChanged {
                meeting_id: meeting_id.to_string(),
                provider: self.provider().to_string(),
                state: "absent".to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await;
    }
}

fn breaker_reason(e: &Error) -> String {
    match e {
        Error::Provider { kind, message } => format!("{}: {}", kind.as_str(), clip(message, 120)),
        other => clip(&other.to_string(), 120),
    }
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
