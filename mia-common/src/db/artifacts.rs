//! Artifact storage: one row per `(meeting_id, kind)`.
//!
//! Writes are last-wins; callers serialize writes per meeting with the
//! advisory lock. Rebuild clears downstream artifacts before re-running.

use crate::time::now_rfc3339;
use crate::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Artifact kinds produced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RawTranscript,
    EnhancedTranscript,
    Report,
    Scorecard,
    Comparison,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::RawTranscript => "raw_transcript",
            ArtifactKind::EnhancedTranscript => "enhanced_transcript",
            ArtifactKind::Report => "report",
            ArtifactKind::Scorecard => "scorecard",
            ArtifactKind::Comparison => "comparison",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "raw_transcript" => Ok(ArtifactKind::RawTranscript),
            "enhanced_transcript" => Ok(ArtifactKind::EnhancedTranscript),
            "report" => Ok(ArtifactKind::Report),
            "scorecard" => Ok(ArtifactKind::Scorecard),
            "comparison" => Ok(ArtifactKind::Comparison),
            other => Err(Error::InvalidInput(format!("unknown artifact kind: {}", other))),
        }
    }

    /// Artifacts invalidated by a rebuild (everything downstream of the raw
    /// transcript).
    pub fn rebuild_targets() -> &'static [ArtifactKind] {
        &[
            ArtifactKind::EnhancedTranscript,
            ArtifactKind::Report,
            ArtifactKind::Scorecard,
            ArtifactKind::Comparison,
        ]
    }
}

/// Write (or overwrite) an artifact.
pub async fn upsert_artifact(
    pool: &SqlitePool,
    meeting_id: &str,
    kind: ArtifactKind,
    content: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artifacts (meeting_id, kind, content, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (meeting_id, kind) DO UPDATE SET
            content = excluded.content,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(meeting_id)
    .bind(kind.as_str())
    .bind(content)
    .bind(now_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_artifact(
    pool: &SqlitePool,
    meeting_id: &str,
    kind: ArtifactKind,
) -> Result<Option<String>> {
    let row = sqlx::query("SELECT content FROM artifacts WHERE meeting_id = ? AND kind = ?")
        .bind(meeting_id)
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("content")))
}

/// Kinds currently present for a meeting.
pub async fn list_artifact_kinds(pool: &SqlitePool, meeting_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT kind FROM artifacts WHERE meeting_id = ? ORDER BY kind")
        .bind(meeting_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("kind")).collect())
}

/// Delete the rebuild targets for a meeting (raw transcript survives).
pub async fn clear_downstream(pool: &SqlitePool, meeting_id: &str) -> Result<u64> {
    let mut cleared = 0;
    for kind in ArtifactKind::rebuild_targets() {
        let result = sqlx::query("DELETE FROM artifacts WHERE meeting_id = ? AND kind = ?")
            .bind(meeting_id)
            .bind(kind.as_str())
            .execute(pool)
            .await?;
        cleared += result.rows_affected();
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_write_wins_and_read() {
        let pool = init_memory_database().await.unwrap();
        upsert_artifact(&pool, "m-1", ArtifactKind::Report, "{\"v\":1}").await.unwrap();
        upsert_artifact(&pool, "m-1", ArtifactKind::Report, "{\"v\":2}").await.unwrap();

        let content = get_artifact(&pool, "m-1", ArtifactKind::Report).await.unwrap();
        assert_eq!(content.as_deref(), Some("{\"v\":2}"));
    }

    #[tokio::test]
    async fn test_clear_downstream_keeps_raw_transcript() {
        let pool = init_memory_database().await.unwrap();
        upsert_artifact(&pool, "m-1", ArtifactKind::RawTranscript, "raw").await.unwrap();
        upsert_artifact(&pool, "m-1", ArtifactKind::EnhancedTranscript, "clean").await.unwrap();
        upsert_artifact(&pool, "m-1", ArtifactKind::Report, "{}").await.unwrap();

        let cleared = clear_downstream(&pool, "m-1").await.unwrap();
        assert_eq!(cleared, 2);

        assert!(get_artifact(&pool, "m-1", ArtifactKind::RawTranscript).await.unwrap().is_some());
        assert!(get_artifact(&pool, "m-1", ArtifactKind::Report).await.unwrap().is_none());
    }
}
