//! Small key-value store over `broker_kv`, shared by the circuit breaker
//! record and the TTL-bounded connector operation locks.
//!
//! The TTL makes locks crash-safe: a dead holder's lock expires instead of
//! wedging the meeting.

use crate::time::now_ms;
use crate::Result;
use sqlx::{Row, SqlitePool};

pub async fn kv_get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT value FROM broker_kv WHERE key = ? AND (expires_at_ms IS NULL OR expires_at_ms > ?)",
    )
    .bind(key)
    .bind(now_ms())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("value")))
}

pub async fn kv_put(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO broker_kv (key, value, expires_at_ms) VALUES (?, ?, NULL)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at_ms = NULL
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn kv_delete(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM broker_kv WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Try to take an exclusive TTL lock. Returns true when this `owner` now
/// holds the lock, false when someone else holds an unexpired lock.
pub async fn try_acquire_lock(
    pool: &SqlitePool,
    key: &str,
    owner: &str,
    ttl_ms: i64,
) -> Result<bool> {
    let now = now_ms();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM broker_kv WHERE key = ? AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        "INSERT OR IGNORE INTO broker_kv (key, value, expires_at_ms) VALUES (?, ?, ?)",
    )
    .bind(key)
    .bind(owner)
    .bind(now + ttl_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Release a lock if still held by `owner`. Releasing someone else's lock
/// (ours expired and was re-acquired) is a no-op.
pub async fn release_lock(pool: &SqlitePool, key: &str, owner: &str) -> Result<()> {
    sqlx::query("DELETE FROM broker_kv WHERE key = ? AND value = ?")
        .bind(key)
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let pool = init_memory_database().await.unwrap();
        assert!(try_acquire_lock(&pool, "oplock:m-1", "a", 60_000).await.unwrap());
        assert!(!try_acquire_lock(&pool, "oplock:m-1", "b", 60_000).await.unwrap());

        release_lock(&pool, "oplock:m-1", "a").await.unwrap();
        assert!(try_acquire_lock(&pool, "oplock:m-1", "b", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let pool = init_memory_database().await.unwrap();
        assert!(try_acquire_lock(&pool, "oplock:m-1", "a", -1).await.unwrap());
        // TTL in the past: next caller takes over
        assert!(try_acquire_lock(&pool, "oplock:m-1", "b", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_wrong_owner_is_noop() {
        let pool = init_memory_database().await.unwrap();
        assert!(try_acquire_lock(&pool, "oplock:m-1", "a", 60_000).await.unwrap());
        release_lock(&pool, "oplock:m-1", "b").await.unwrap();
        assert!(!try_acquire_lock(&pool, "oplock:m-1", "c", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let pool = init_memory_database().await.unwrap();
        assert!(kv_get(&pool, "cb:mock").await.unwrap().is_none());
        kv_put(&pool, "cb:mock", "{\"state\":\"closed\"}").await.unwrap();
        assert_eq!(
            kv_get(&pool, "cb:mock").await.unwrap().as_deref(),
            Some("{\"state\":\"closed\"}")
        );
        kv_delete(&pool, "cb:mock").await.unwrap();
        assert!(kv_get(&pool, "cb:mock").await.unwrap().is_none());
    }
}
