//! Security audit trail: append-only allow/deny decisions.

use crate::time::now_rfc3339;
use crate::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDecision {
    Allow,
    Deny,
}

impl AuditDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditDecision::Allow => "allow",
            AuditDecision::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: String,
    pub endpoint: String,
    pub method: String,
    pub subject: String,
    pub auth_type: String,
    pub decision: String,
    pub reason: String,
}

pub async fn record_audit(
    pool: &SqlitePool,
    endpoint: &str,
    method: &str,
    subject: &str,
    auth_type: &str,
    decision: AuditDecision,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO security_audit_events (ts, endpoint, method, subject, auth_type, decision, reason)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(now_rfc3339())
    .bind(endpoint)
    .bind(method)
    .bind(subject)
    .bind(auth_type)
    .bind(decision.as_str())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent audit events, newest first.
pub async fn recent_audit(pool: &SqlitePool, limit: i64) -> Result<Vec<AuditEvent>> {
    let rows = sqlx::query(
        "SELECT * FROM security_audit_events ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| AuditEvent {
            ts: row.get("ts"),
            endpoint: row.get("endpoint"),
            method: row.get("method"),
            subject: row.get("subject"),
            auth_type: row.get("auth_type"),
            decision: row.get("decision"),
            reason: row.get("reason"),
        })
        .collect())
}

/// Count of deny decisions (used by tests and ops queries).
pub async fn deny_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM security_audit_events WHERE decision = 'deny'",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}
