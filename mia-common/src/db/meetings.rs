//! Meeting record operations.
//!
//! The one non-obvious contract here is monotone status: a write that would
//! move a meeting's status backward is rejected unless it is an explicit
//! rebuild (done/failed back to processing).

use crate::time::now_rfc3339;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Pipeline status of a meeting. Ordered: each variant's `rank` only moves
/// forward under normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Created,
    Ingesting,
    Processing,
    Done,
    Failed,
}

impl MeetingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MeetingStatus::Created => "created",
            MeetingStatus::Ingesting => "ingesting",
            MeetingStatus::Processing => "processing",
            MeetingStatus::Done => "done",
            MeetingStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "created" => Ok(MeetingStatus::Created),
            "ingesting" => Ok(MeetingStatus::Ingesting),
            "processing" => Ok(MeetingStatus::Processing),
            "done" => Ok(MeetingStatus::Done),
            "failed" => Ok(MeetingStatus::Failed),
            other => Err(Error::Internal(format!("unknown meeting status: {}", other))),
        }
    }

    fn rank(self) -> u8 {
        match self {
            MeetingStatus::Created => 0,
            MeetingStatus::Ingesting => 1,
            MeetingStatus::Processing => 2,
            MeetingStatus::Done => 3,
            MeetingStatus::Failed => 4,
        }
    }
}

/// Meeting ingest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingMode {
    Batch,
    Realtime,
}

impl MeetingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MeetingMode::Batch => "batch",
            MeetingMode::Realtime => "realtime",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "batch" => Ok(MeetingMode::Batch),
            "realtime" => Ok(MeetingMode::Realtime),
            other => Err(Error::InvalidInput(format!("unknown meeting mode: {}", other))),
        }
    }
}

/// Durable meeting record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub id: String,
    pub tenant: Option<String>,
    pub mode: MeetingMode,
    pub status: MeetingStatus,
    pub created_at: String,
    pub finalized_at: Option<String>,
    pub last_chunk_at: Option<String>,
    pub rebuild_epoch: i64,
    pub connector_provider: Option<String>,
    pub delivery_recipients: Vec<String>,
}

fn row_to_meeting(row: &sqlx::sqlite::SqliteRow) -> Result<MeetingRecord> {
    let recipients: String = row.get("delivery_recipients");
    let delivery_recipients = if recipients.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&recipients)?
    };
    Ok(MeetingRecord {
        id: row.get("id"),
        tenant: row.get("tenant"),
        mode: MeetingMode::parse(&row.get::<String, _>("mode"))?,
        status: MeetingStatus::parse(&row.get::<String, _>("status"))?,
        created_at: row.get("created_at"),
        finalized_at: row.get("finalized_at"),
        last_chunk_at: row.get("last_chunk_at"),
        rebuild_epoch: row.get("rebuild_epoch"),
        connector_provider: row.get("connector_provider"),
        delivery_recipients,
    })
}

/// Create a new meeting in `created` status.
pub async fn create_meeting(
    pool: &SqlitePool,
    id: &str,
    tenant: Option<&str>,
    mode: MeetingMode,
    delivery_recipients: &[String],
) -> Result<MeetingRecord> {
    let recipients = if delivery_recipients.is_empty() {
        String::new()
    } else {
        serde_json::to_string(delivery_recipients)?
    };

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO meetings (id, tenant, mode, status, created_at, delivery_recipients)
        VALUES (?, ?, ?, 'created', ?, ?)
        "#,
    )
    .bind(id)
    .bind(tenant)
    .bind(mode.as_str())
    .bind(now_rfc3339())
    .bind(recipients)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!("meeting already exists: {}", id)));
    }

    get_meeting(pool, id)
        .await?
        .ok_or_else(|| Error::Internal(format!("meeting vanished after insert: {}", id)))
}

pub async fn get_meeting(pool: &SqlitePool, id: &str) -> Result<Option<MeetingRecord>> {
    let row = sqlx::query("SELECT * FROM meetings WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_meeting).transpose()
}

/// Fetch a meeting enforcing tenant visibility. A `Some(tenant)` filter only
/// matches meetings created under that tenant.
pub async fn get_meeting_for_tenant(
    pool: &SqlitePool,
    id: &str,
    tenant: Option<&str>,
) -> Result<Option<MeetingRecord>> {
    let meeting = get_meeting(pool, id).await?;
    match (&meeting, tenant) {
        (Some(m), Some(t)) if m.tenant.as_deref() != Some(t) => {
            Err(Error::Forbidden("tenant mismatch".to_string()))
        }
        _ => Ok(meeting),
    }
}

/// Move meeting status forward. Backward moves are rejected unless
/// `allow_rebuild` and the transition is done/failed → processing.
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    new_status: MeetingStatus,
    allow_rebuild: bool,
) -> Result<MeetingStatus> {
    let meeting = get_meeting(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("meeting not found: {}", id)))?;
    let old = meeting.status;

    let forward = new_status.rank() >= old.rank();
    let rebuild_transition = allow_rebuild
        && matches!(old, MeetingStatus::Done | MeetingStatus::Failed)
        && new_status == MeetingStatus::Processing;

    if !forward && !rebuild_transition {
        return Err(Error::InvalidInput(format!(
            "status cannot move backward: {} -> {}",
            old.as_str(),
            new_status.as_str()
        )));
    }

    sqlx::query("UPDATE meetings SET status = ? WHERE id = ?")
        .bind(new_status.as_str())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(old)
}

/// Record the arrival time of the latest chunk (drives the inactivity
/// finalize sweeper).
pub async fn touch_last_chunk(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE meetings SET last_chunk_at = ? WHERE id = ?")
        .bind(now_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a meeting finalized. Returns false if it already was (explicit
/// finalize wins over the sweeper; second callers are no-ops).
pub async fn mark_finalized(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE meetings SET finalized_at = ? WHERE id = ? AND finalized_at IS NULL",
    )
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_connector_provider(pool: &SqlitePool, id: &str, provider: &str) -> Result<()> {
    sqlx::query("UPDATE meetings SET connector_provider = ? WHERE id = ?")
        .bind(provider)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Increment the rebuild epoch, invalidating prior idempotency keys.
pub async fn bump_rebuild_epoch(pool: &SqlitePool, id: &str) -> Result<i64> {
    sqlx::query("UPDATE meetings SET rebuild_epoch = rebuild_epoch + 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    let epoch: i64 = sqlx::query_scalar("SELECT rebuild_epoch FROM meetings WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(epoch)
}

/// Meetings still ingesting whose last chunk is older than `cutoff_rfc3339`
/// and which have not been finalized yet.
pub async fn list_inactive_unfinalized(
    pool: &SqlitePool,
    cutoff_rfc3339: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM meetings
        WHERE finalized_at IS NULL
          AND status IN ('ingesting', 'processing')
          AND last_chunk_at IS NOT NULL
          AND last_chunk_at < ?
        ORDER BY last_chunk_at
        LIMIT ?
        "#,
    )
    .bind(cutoff_rfc3339)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_status_is_monotone() {
        let pool = init_memory_database().await.unwrap();
        create_meeting(&pool, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();

        set_status(&pool, "m-1", MeetingStatus::Ingesting, false).await.unwrap();
        set_status(&pool, "m-1", MeetingStatus::Processing, false).await.unwrap();
        set_status(&pool, "m-1", MeetingStatus::Done, false).await.unwrap();

        // Backward without rebuild is rejected
        let err = set_status(&pool, "m-1", MeetingStatus::Ingesting, false).await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));

        // done -> processing via rebuild is fine
        set_status(&pool, "m-1", MeetingStatus::Processing, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_processing_to_failed_and_back_via_rebuild() {
        let pool = init_memory_database().await.unwrap();
        create_meeting(&pool, "m-2", None, MeetingMode::Realtime, &[]).await.unwrap();

        set_status(&pool, "m-2", MeetingStatus::Processing, false).await.unwrap();
        set_status(&pool, "m-2", MeetingStatus::Failed, false).await.unwrap();

        // failed -> processing only with rebuild
        assert!(set_status(&pool, "m-2", MeetingStatus::Processing, false).await.is_err());
        set_status(&pool, "m-2", MeetingStatus::Processing, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_meeting_rejected() {
        let pool = init_memory_database().await.unwrap();
        create_meeting(&pool, "m-3", None, MeetingMode::Batch, &[]).await.unwrap();
        let err = create_meeting(&pool, "m-3", None, MeetingMode::Batch, &[]).await;
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_finalize_first_call_wins() {
        let pool = init_memory_database().await.unwrap();
        create_meeting(&pool, "m-4", None, MeetingMode::Batch, &[]).await.unwrap();
        assert!(mark_finalized(&pool, "m-4").await.unwrap());
        assert!(!mark_finalized(&pool, "m-4").await.unwrap());
    }

    #[tokio::test]
    async fn test_tenant_filtering() {
        let pool = init_memory_database().await.unwrap();
        create_meeting(&pool, "m-5", Some("acme"), MeetingMode::Batch, &[]).await.unwrap();

        assert!(get_meeting_for_tenant(&pool, "m-5", Some("acme")).await.unwrap().is_some());
        assert!(matches!(
            get_meeting_for_tenant(&pool, "m-5", Some("other")).await,
            Err(Error::Forbidden(_))
        ));
    }
}
