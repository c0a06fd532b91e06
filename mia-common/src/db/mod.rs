//! Database initialization and store modules.
//!
//! Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), safe to run
//! at every startup from both the gateway and the worker.

pub mod artifacts;
pub mod audit;
pub mod chunks;
pub mod events_feed;
pub mod idempotency;
pub mod kv;
pub mod meetings;
pub mod segments;
pub mod sessions;

use crate::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Initialize the database at `db_path`, creating the file and schema on
/// first run.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    configure_connection(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// In-memory database for tests. Pinned to a single connection so every
/// query sees the same memory database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    configure_connection(&pool).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn configure_connection(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;
    Ok(())
}

/// Create all tables and indexes (idempotent).
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_meetings_table(pool).await?;
    create_chunks_table(pool).await?;
    create_segments_table(pool).await?;
    create_artifacts_table(pool).await?;
    create_connector_sessions_table(pool).await?;
    create_audit_table(pool).await?;
    create_idempotency_table(pool).await?;
    create_queue_tables(pool).await?;
    create_kv_table(pool).await?;
    create_events_feed_table(pool).await?;
    Ok(())
}

async fn create_meetings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meetings (
            id TEXT PRIMARY KEY,
            tenant TEXT,
            mode TEXT NOT NULL DEFAULT 'batch',
            status TEXT NOT NULL DEFAULT 'created',
            created_at TEXT NOT NULL,
            finalized_at TEXT,
            last_chunk_at TEXT,
            rebuild_epoch INTEGER NOT NULL DEFAULT 0,
            connector_provider TEXT,
            delivery_recipients TEXT,
            context TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_chunks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            meeting_id TEXT NOT NULL,
            chunk_seq INTEGER NOT NULL,
            media_ref TEXT NOT NULL,
            received_at TEXT NOT NULL,
            trace_id TEXT,
            PRIMARY KEY (meeting_id, chunk_seq)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_segments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcript_segments (
            meeting_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            speaker TEXT,
            raw_text TEXT NOT NULL DEFAULT '',
            enhanced_text TEXT NOT NULL DEFAULT '',
            confidence REAL,
            PRIMARY KEY (meeting_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_artifacts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            meeting_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (meeting_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_connector_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connector_sessions (
            meeting_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            state TEXT NOT NULL,
            provider_ref TEXT,
            joined_at TEXT,
            last_seen TEXT,
            live_pull_failures INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (meeting_id, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_audit_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS security_audit_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL,
            subject TEXT NOT NULL,
            auth_type TEXT NOT NULL,
            decision TEXT NOT NULL,
            reason TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_idempotency_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            created_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_queue_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            job_id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'available',
            envelope TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            visible_at_ms INTEGER NOT NULL,
            enqueued_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_jobs_reserve
         ON queue_jobs (queue, visible_at_ms, enqueued_at_ms)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_dlq (
            job_id TEXT NOT NULL,
            queue TEXT NOT NULL,
            envelope TEXT NOT NULL,
            reason TEXT NOT NULL,
            failed_at_ms INTEGER NOT NULL,
            PRIMARY KEY (queue, job_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_kv_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_events_feed_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id TEXT NOT NULL,
            event TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_events_meeting
         ON pipeline_events (meeting_id, id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_creation_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        // Second run must not fail
        create_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 10, "expected all tables, got {}", count);
    }
}
