//! Transcript segment storage.
//!
//! One segment per chunk; the raw transcript artifact is assembled from
//! segments ordered by `seq`, so out-of-order STT completion is harmless.

use crate::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSegment {
    pub meeting_id: String,
    pub seq: i64,
    pub speaker: Option<String>,
    pub raw_text: String,
    pub enhanced_text: String,
    pub confidence: Option<f64>,
}

/// Insert or replace a segment for `(meeting_id, seq)`. Re-delivered STT
/// jobs overwrite with identical content, which keeps the stage idempotent.
pub async fn upsert_segment(pool: &SqlitePool, segment: &TranscriptSegment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transcript_segments (meeting_id, seq, speaker, raw_text, enhanced_text, confidence)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (meeting_id, seq) DO UPDATE SET
            speaker = excluded.speaker,
            raw_text = excluded.raw_text,
            enhanced_text = excluded.enhanced_text,
            confidence = excluded.confidence
        "#,
    )
    .bind(&segment.meeting_id)
    .bind(segment.seq)
    .bind(&segment.speaker)
    .bind(&segment.raw_text)
    .bind(&segment.enhanced_text)
    .bind(segment.confidence)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_segments(pool: &SqlitePool, meeting_id: &str) -> Result<Vec<TranscriptSegment>> {
    let rows = sqlx::query(
        "SELECT * FROM transcript_segments WHERE meeting_id = ? ORDER BY seq",
    )
    .bind(meeting_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TranscriptSegment {
            meeting_id: row.get("meeting_id"),
            seq: row.get("seq"),
            speaker: row.get("speaker"),
            raw_text: row.get("raw_text"),
            enhanced_text: row.get("enhanced_text"),
            confidence: row.get("confidence"),
        })
        .collect())
}

/// Store enhanced text back onto every segment of a meeting.
pub async fn set_enhanced_text(
    pool: &SqlitePool,
    meeting_id: &str,
    seq: i64,
    enhanced_text: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE transcript_segments SET enhanced_text = ? WHERE meeting_id = ? AND seq = ?",
    )
    .bind(enhanced_text)
    .bind(meeting_id)
    .bind(seq)
    .execute(pool)
    .await?;
    Ok(())
}
