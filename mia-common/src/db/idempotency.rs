//! Idempotency key store (deduplication of events and stage side effects).
//!
//! Keys live in `idempotency_keys` with a TTL. A key is namespaced as
//! `<scope>:<meeting_id>:<key>`; re-delivery of the same key reports a
//! duplicate so handlers skip external side effects.

use crate::time::now_ms;
use crate::Result;
use sqlx::SqlitePool;

/// Default TTL for idempotency keys: 24 hours.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

fn namespaced(scope: &str, meeting_id: &str, key: &str) -> String {
    format!("idem:{}:{}:{}", scope, meeting_id, key)
}

/// Returns true if the key is NEW (caller should process), false if it was
/// already seen (duplicate).
pub async fn check_and_set(
    pool: &SqlitePool,
    scope: &str,
    meeting_id: &str,
    key: &str,
    ttl_ms: i64,
) -> Result<bool> {
    let full_key = namespaced(scope, meeting_id, key);
    let now = now_ms();

    let mut tx = pool.begin().await?;

    // Expired entries do not block a fresh claim.
    sqlx::query("DELETE FROM idempotency_keys WHERE key = ? AND expires_at_ms < ?")
        .bind(&full_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        "INSERT OR IGNORE INTO idempotency_keys (key, created_at_ms, expires_at_ms) VALUES (?, ?, ?)",
    )
    .bind(&full_key)
    .bind(now)
    .bind(now + ttl_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Drop expired keys; returns how many were removed.
pub async fn purge_expired(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at_ms < ?")
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_first_claim_wins() {
        let pool = init_memory_database().await.unwrap();
        assert!(check_and_set(&pool, "stt", "m-1", "k-1", DEFAULT_TTL_MS).await.unwrap());
        assert!(!check_and_set(&pool, "stt", "m-1", "k-1", DEFAULT_TTL_MS).await.unwrap());
        // Different scope is a different key
        assert!(check_and_set(&pool, "enhance", "m-1", "k-1", DEFAULT_TTL_MS).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reclaimed() {
        let pool = init_memory_database().await.unwrap();
        assert!(check_and_set(&pool, "stt", "m-1", "k-1", -1).await.unwrap());
        // TTL already elapsed, so the key is claimable again
        assert!(check_and_set(&pool, "stt", "m-1", "k-1", DEFAULT_TTL_MS).await.unwrap());
    }
}
