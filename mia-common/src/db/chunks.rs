//! Chunk record operations.
//!
//! A chunk with a given `(meeting_id, chunk_seq)` is immutable once
//! persisted; duplicate sequence numbers are a hard conflict. Sequence
//! assignment itself is serialized by the caller (per-meeting advisory
//! lock), not here.

use crate::time::now_rfc3339;
use crate::{Error, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub meeting_id: String,
    pub chunk_seq: i64,
    pub media_ref: String,
    pub received_at: String,
    pub trace_id: Option<String>,
}

/// Next free sequence number for a meeting (gap-tolerant: max + 1).
pub async fn next_chunk_seq(pool: &SqlitePool, meeting_id: &str) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(chunk_seq), -1) + 1 FROM chunks WHERE meeting_id = ?",
    )
    .bind(meeting_id)
    .fetch_one(pool)
    .await?;
    Ok(seq)
}

/// Persist a chunk record. Duplicate `(meeting_id, chunk_seq)` is rejected.
pub async fn insert_chunk(
    pool: &SqlitePool,
    meeting_id: &str,
    chunk_seq: i64,
    media_ref: &str,
    trace_id: Option<&str>,
) -> Result<ChunkRecord> {
    let received_at = now_rfc3339();
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO chunks (meeting_id, chunk_seq, media_ref, received_at, trace_id)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(meeting_id)
    .bind(chunk_seq)
    .bind(media_ref)
    .bind(&received_at)
    .bind(trace_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "duplicate chunk_seq {} for meeting {}",
            chunk_seq, meeting_id
        )));
    }

    Ok(ChunkRecord {
        meeting_id: meeting_id.to_string(),
        chunk_seq,
        media_ref: media_ref.to_string(),
        received_at,
        trace_id: trace_id.map(|t| t.to_string()),
    })
}

pub async fn list_chunks(pool: &SqlitePool, meeting_id: &str) -> Result<Vec<ChunkRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM chunks WHERE meeting_id = ? ORDER BY chunk_seq",
    )
    .bind(meeting_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChunkRecord {
            meeting_id: row.get("meeting_id"),
            chunk_seq: row.get("chunk_seq"),
            media_ref: row.get("media_ref"),
            received_at: row.get("received_at"),
            trace_id: row.get("trace_id"),
        })
        .collect())
}

pub async fn chunk_count(pool: &SqlitePool, meeting_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE meeting_id = ?")
        .bind(meeting_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_seq_assignment_is_gap_tolerant() {
        let pool = init_memory_database().await.unwrap();
        assert_eq!(next_chunk_seq(&pool, "m-1").await.unwrap(), 0);

        insert_chunk(&pool, "m-1", 0, "ref-0", None).await.unwrap();
        insert_chunk(&pool, "m-1", 5, "ref-5", None).await.unwrap();
        assert_eq!(next_chunk_seq(&pool, "m-1").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_duplicate_seq_is_conflict() {
        let pool = init_memory_database().await.unwrap();
        insert_chunk(&pool, "m-1", 0, "ref-a", None).await.unwrap();
        let err = insert_chunk(&pool, "m-1", 0, "ref-b", None).await;
        assert!(matches!(err, Err(Error::Conflict(_))));

        // Same seq on another meeting is fine
        insert_chunk(&pool, "m-2", 0, "ref-c", None).await.unwrap();
    }
}
