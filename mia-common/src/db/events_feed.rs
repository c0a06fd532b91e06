//! Durable event feed bridging the worker and gateway processes.
//!
//! Workers append pipeline events here; the gateway's WebSocket forwarder
//! polls per meeting and relays anything newer than its cursor.

use crate::events::MiaEvent;
use crate::time::now_ms;
use crate::Result;
use sqlx::{Row, SqlitePool};

pub async fn append_event(pool: &SqlitePool, event: &MiaEvent) -> Result<()> {
    let meeting_id = match event.meeting_id() {
        Some(id) => id.to_string(),
        None => return Ok(()), // process-level events do not go to the feed
    };
    sqlx::query(
        "INSERT INTO pipeline_events (meeting_id, event, created_at_ms) VALUES (?, ?, ?)",
    )
    .bind(meeting_id)
    .bind(serde_json::to_string(event)?)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Events for a meeting with id greater than `after_id`, oldest first.
/// Returns `(feed_id, serialized_event)` pairs so callers can advance their
/// cursor.
pub async fn events_after(
    pool: &SqlitePool,
    meeting_id: &str,
    after_id: i64,
    limit: i64,
) -> Result<Vec<(i64, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT id, event FROM pipeline_events
        WHERE meeting_id = ? AND id > ?
        ORDER BY id
        LIMIT ?
        "#,
    )
    .bind(meeting_id)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| (r.get("id"), r.get("event"))).collect())
}
