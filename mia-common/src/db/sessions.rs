//! Connector session records.
//!
//! At most one non-terminal session exists per `(meeting_id, provider)`;
//! the row IS the session, and lifecycle transitions rewrite it in place.
//! Serialization of transitions is the caller's job (TTL op lock).

use crate::time::now_rfc3339;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Joining,
    Connected,
    Disconnected,
    Leaving,
    Dead,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Joining => "joining",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Leaving => "leaving",
            SessionState::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "joining" => Ok(SessionState::Joining),
            "connected" => Ok(SessionState::Connected),
            "disconnected" => Ok(SessionState::Disconnected),
            "leaving" => Ok(SessionState::Leaving),
            "dead" => Ok(SessionState::Dead),
            other => Err(Error::Internal(format!("unknown session state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub meeting_id: String,
    pub provider: String,
    pub state: SessionState,
    pub provider_ref: Option<String>,
    pub joined_at: Option<String>,
    pub last_seen: Option<String>,
    pub live_pull_failures: i64,
    pub last_error: Option<String>,
    pub updated_at: String,
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord> {
    Ok(SessionRecord {
        meeting_id: row.get("meeting_id"),
        provider: row.get("provider"),
        state: SessionState::parse(&row.get::<String, _>("state"))?,
        provider_ref: row.get("provider_ref"),
        joined_at: row.get("joined_at"),
        last_seen: row.get("last_seen"),
        live_pull_failures: row.get("live_pull_failures"),
        last_error: row.get("last_error"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get_session(
    pool: &SqlitePool,
    meeting_id: &str,
    provider: &str,
) -> Result<Option<SessionRecord>> {
    let row = sqlx::query(
        "SELECT * FROM connector_sessions WHERE meeting_id = ? AND provider = ?",
    )
    .bind(meeting_id)
    .bind(provider)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_session).transpose()
}

/// Write the full session row (insert or replace).
pub async fn upsert_session(pool: &SqlitePool, session: &SessionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO connector_sessions
            (meeting_id, provider, state, provider_ref, joined_at, last_seen,
             live_pull_failures, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (meeting_id, provider) DO UPDATE SET
            state = excluded.state,
            provider_ref = excluded.provider_ref,
            joined_at = excluded.joined_at,
            last_seen = excluded.last_seen,
            live_pull_failures = excluded.live_pull_failures,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&session.meeting_id)
    .bind(&session.provider)
    .bind(session.state.as_str())
    .bind(&session.provider_ref)
    .bind(&session.joined_at)
    .bind(&session.last_seen)
    .bind(session.live_pull_failures)
    .bind(&session.last_error)
    .bind(now_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove the session row (session becomes absent after a clean leave).
pub async fn delete_session(pool: &SqlitePool, meeting_id: &str, provider: &str) -> Result<()> {
    sqlx::query("DELETE FROM connector_sessions WHERE meeting_id = ? AND provider = ?")
        .bind(meeting_id)
        .bind(provider)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_sessions(pool: &SqlitePool, provider: &str) -> Result<Vec<SessionRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM connector_sessions WHERE provider = ? ORDER BY updated_at DESC",
    )
    .bind(provider)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_session).collect()
}

/// Connected sessions whose `last_seen` is older than the cutoff.
pub async fn list_stale_connected(
    pool: &SqlitePool,
    provider: &str,
    cutoff_rfc3339: &str,
    limit: i64,
) -> Result<Vec<SessionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM connector_sessions
        WHERE provider = ? AND state = 'connected'
          AND (last_seen IS NULL OR last_seen < ?)
        ORDER BY last_seen
        LIMIT ?
        "#,
    )
    .bind(provider)
    .bind(cutoff_rfc3339)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_session).collect()
}

pub async fn list_connected(
    pool: &SqlitePool,
    provider: &str,
    limit: i64,
) -> Result<Vec<SessionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM connector_sessions
        WHERE provider = ? AND state = 'connected'
        ORDER BY last_seen DESC
        LIMIT ?
        "#,
    )
    .bind(provider)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_session).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    fn session(meeting: &str, state: SessionState) -> SessionRecord {
        SessionRecord {
            meeting_id: meeting.to_string(),
            provider: "mock".to_string(),
            state,
            provider_ref: Some(format!("ref-{}", meeting)),
            joined_at: Some(now_rfc3339()),
            last_seen: Some(now_rfc3339()),
            live_pull_failures: 0,
            last_error: None,
            updated_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_one_row_per_meeting_provider() {
        let pool = init_memory_database().await.unwrap();
        upsert_session(&pool, &session("m-1", SessionState::Joining)).await.unwrap();
        upsert_session(&pool, &session("m-1", SessionState::Connected)).await.unwrap();

        let all = list_sessions(&pool, "mock").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_filter_uses_last_seen() {
        let pool = init_memory_database().await.unwrap();
        let mut fresh = session("m-fresh", SessionState::Connected);
        fresh.last_seen = Some("2099-01-01T00:00:00+00:00".to_string());
        upsert_session(&pool, &fresh).await.unwrap();

        let mut stale = session("m-stale", SessionState::Connected);
        stale.last_seen = Some("2000-01-01T00:00:00+00:00".to_string());
        upsert_session(&pool, &stale).await.unwrap();

        let found = list_stale_connected(&pool, "mock", &now_rfc3339(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].meeting_id, "m-stale");
    }

    #[tokio::test]
    async fn test_delete_makes_session_absent() {
        let pool = init_memory_database().await.unwrap();
        upsert_session(&pool, &session("m-1", SessionState::Connected)).await.unwrap();
        delete_session(&pool, "m-1", "mock").await.unwrap();
        assert!(get_session(&pool, "m-1", "mock").await.unwrap().is_none());
    }
}
