//! Broker interface and the SQLite-backed implementation.
//!
//! A job row is `available` (reservable once `visible_at_ms` passes — delays
//! implement retry backoff) or `pending` (reserved; `visible_at_ms` is the
//! visibility deadline). Reservation takes any row whose `visible_at_ms` is
//! due, so a crashed worker's pending job is re-delivered automatically.

use crate::queue::envelope::JobEnvelope;
use crate::time::now_ms;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

/// What `nack` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

/// Per-queue depth report. `error` is set instead of failing the whole
/// health endpoint when one queue misbehaves.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    pub depth: Option<i64>,
    pub pending_depth: Option<i64>,
    pub dlq_depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry surfaced when inspecting a DLQ.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    pub job_id: String,
    pub queue: String,
    pub reason: String,
    pub failed_at_ms: i64,
    pub envelope: JobEnvelope,
}

/// Named FIFO queues over a shared broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<()>;

    /// Enqueue with a delay before the job becomes reservable.
    async fn enqueue_delayed(&self, job: &JobEnvelope, delay: Duration) -> Result<()>;

    /// Reserve one job; `None` when nothing is due.
    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobEnvelope>>;

    /// Commit a finished job (removes it from the pending set).
    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()>;

    /// Report a retryable failure: requeues with a delay or dead-letters
    /// once attempts are exhausted.
    async fn nack(
        &self,
        queue: &str,
        job_id: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<NackOutcome>;

    /// Move a job straight to the DLQ (non-retryable failure).
    async fn dlq_push(&self, queue: &str, job_id: Uuid, reason: &str) -> Result<()>;

    async fn depth(&self, queue: &str) -> Result<i64>;
    async fn pending_depth(&self, queue: &str) -> Result<i64>;
    async fn dlq_depth(&self, queue: &str) -> Result<i64>;

    async fn list_dlq(&self, queue: &str, limit: i64) -> Result<Vec<DlqEntry>>;

    /// Replay up to `limit` DLQ entries back onto their queue with the
    /// attempt counter reset and trace context preserved.
    async fn replay_dlq(&self, queue: &str, limit: i64) -> Result<u64>;
}

/// SQLite-backed broker over `queue_jobs` / `queue_dlq`.
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_job_row(&self, queue: &str, job_id: Uuid) -> Result<Option<JobEnvelope>> {
        let row = sqlx::query("SELECT envelope FROM queue_jobs WHERE queue = ? AND job_id = ?")
            .bind(queue)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r.get::<String, _>("envelope")).map_err(Error::from))
            .transpose()
    }

    async fn move_to_dlq(&self, queue: &str, job: &JobEnvelope, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_dlq (job_id, queue, envelope, reason, failed_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(queue)
        .bind(serde_json::to_string(job)?)
        .bind(reason)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_jobs WHERE queue = ? AND job_id = ?")
            .bind(queue)
            .bind(job.job_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<()> {
        self.enqueue_delayed(job, Duration::ZERO).await
    }

    async fn enqueue_delayed(&self, job: &JobEnvelope, delay: Duration) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (job_id, queue, state, envelope, attempt, visible_at_ms, enqueued_at_ms)
            VALUES (?, ?, 'available', ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.queue)
        .bind(serde_json::to_string(job)?)
        .bind(job.attempt)
        .bind(now + delay.as_millis() as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        _worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobEnvelope>> {
        let now = now_ms();
        // Single-statement claim: picks the oldest due job (available, or
        // pending with an expired visibility deadline) and flips it pending.
        let row = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'pending', visible_at_ms = ?
            WHERE job_id = (
                SELECT job_id FROM queue_jobs
                WHERE queue = ? AND visible_at_ms <= ?
                ORDER BY enqueued_at_ms, job_id
                LIMIT 1
            )
            RETURNING envelope
            "#,
        )
        .bind(now + visibility_timeout.as_millis() as i64)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| serde_json::from_str(&r.get::<String, _>("envelope")).map_err(Error::from))
            .transpose()
    }

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE queue = ? AND job_id = ?")
            .bind(queue)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<NackOutcome> {
        let mut job = self
            .fetch_job_row(queue, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {}:{}", queue, job_id)))?;

        job.attempt += 1;
        if job.attempt >= job.max_attempts {
            self.move_to_dlq(queue, &job, reason).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'available', envelope = ?, attempt = ?, visible_at_ms = ?
            WHERE queue = ? AND job_id = ?
            "#,
        )
        .bind(serde_json::to_string(&job)?)
        .bind(job.attempt)
        .bind(now_ms() + delay.as_millis() as i64)
        .bind(queue)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(NackOutcome::Requeued)
    }

    async fn dlq_push(&self, queue: &str, job_id: Uuid, reason: &str) -> Result<()> {
        let job = self
            .fetch_job_row(queue, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {}:{}", queue, job_id)))?;
        self.move_to_dlq(queue, &job, reason).await
    }

    async fn depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ? AND state = 'available'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn pending_depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ? AND state = 'pending' AND visible_at_ms > ?",
        )
        .bind(queue)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn dlq_depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_dlq WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_dlq(&self, queue: &str, limit: i64) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM queue_dlq WHERE queue = ? ORDER BY failed_at_ms DESC LIMIT ?",
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(DlqEntry {
                job_id: row.get("job_id"),
                queue: row.get("queue"),
                reason: row.get("reason"),
                failed_at_ms: row.get("failed_at_ms"),
                envelope: serde_json::from_str(&row.get::<String, _>("envelope"))?,
            });
        }
        Ok(entries)
    }

    async fn replay_dlq(&self, queue: &str, limit: i64) -> Result<u64> {
        let entries = self.list_dlq(queue, limit).await?;
        let mut replayed = 0;
        for entry in entries {
            let mut job = entry.envelope;
            job.attempt = 0;

            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM queue_dlq WHERE queue = ? AND job_id = ?")
                .bind(queue)
                .bind(job.job_id.to_string())
                .execute(&mut *tx)
                .await?;
            let now = now_ms();
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO queue_jobs (job_id, queue, state, envelope, attempt, visible_at_ms, enqueued_at_ms)
                VALUES (?, ?, 'available', ?, 0, ?, ?)
                "#,
            )
            .bind(job.job_id.to_string())
            .bind(queue)
            .bind(serde_json::to_string(&job)?)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

impl SqliteBroker {
    /// Jobs left `pending` by a dead process whose visibility already
    /// lapsed. They re-deliver on their own; the count is for startup logs.
    pub async fn expired_pending_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE state = 'pending' AND visible_at_ms <= ?",
        )
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Gather per-queue health, never failing the whole report because one
/// queue errored.
pub async fn queues_health(broker: &dyn Broker, queues: &[&str]) -> Vec<QueueHealth> {
    let mut out = Vec::with_capacity(queues.len());
    for &queue in queues {
        let depth = broker.depth(queue).await;
        let pending = broker.pending_depth(queue).await;
        let dlq = broker.dlq_depth(queue).await;

        let error = [&depth, &pending, &dlq]
            .iter()
            .find_map(|r| r.as_ref().err().map(|e| e.to_string()));

        out.push(QueueHealth {
            queue: queue.to_string(),
            depth: depth.ok(),
            pending_depth: pending.ok(),
            dlq_depth: dlq.ok(),
            error,
        });
    }
    out
}
