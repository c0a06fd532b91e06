//! Admin surface: queue health, storage probe, readiness, audit trail,
//! connector operations, breaker control, DLQ replay.
//!
//! Everything here sits behind the service-contour middleware; writes
//! additionally require the admin-write scope for JWT identities. Connector
//! writes mutate through the same lifecycle locks as normal traffic.

use crate::auth::{AuthContext, SCOPE_ADMIN_READ, SCOPE_ADMIN_WRITE};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use mia_common::blob::BlobStore as _;
use mia_common::db::audit;
use mia_common::queue::broker::{queues_health, Broker as _};
use mia_core::connector::lifecycle::ConnectorLifecycle;
use mia_core::connector::reconcile::run_reconcile_once;
use mia_core::dispatcher::PIPELINE_QUEUES;
use mia_core::readiness::evaluate_readiness;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/queues/health", get(queues_health_handler))
        .route("/queues/:queue/dlq", get(list_dlq))
        .route("/queues/:queue/dlq/replay", post(replay_dlq))
        .route("/storage/health", get(storage_health))
        .route("/system/readiness", get(readiness))
        .route("/audit", get(audit_trail))
        .route("/connectors/:provider/health", get(connector_health))
        .route("/connectors/:provider/sessions", get(connector_sessions))
        .route("/connectors/:provider/reconcile", post(connector_reconcile))
        .route("/connectors/:provider/circuit-breaker", get(breaker_status))
        .route(
            "/connectors/:provider/circuit-breaker/reset",
            post(breaker_reset),
        )
        .route("/connectors/:provider/:meeting_id/join", post(connector_join))
        .route("/connectors/:provider/:meeting_id/leave", post(connector_leave))
        .route(
            "/connectors/:provider/:meeting_id/reconnect",
            post(connector_reconnect),
        )
        .route(
            "/connectors/:provider/:meeting_id/live-pull",
            post(connector_live_pull),
        )
        .route("/connectors/:provider/:meeting_id/status", get(connector_status))
}

fn lifecycle_for<'a>(
    state: &'a AppState,
    provider: &str,
) -> Result<&'a Arc<ConnectorLifecycle>, ApiError> {
    let lifecycle = state
        .lifecycle
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no connector configured".to_string()))?;
    if lifecycle.provider() != provider {
        return Err(ApiError::NotFound(format!(
            "unknown connector provider: {}",
            provider
        )));
    }
    Ok(lifecycle)
}

/// GET /v1/admin/queues/health
///
/// Per-queue depths; a failing queue reports its own `error` field while
/// the rest still return values.
async fn queues_health_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let report = queues_health(state.ctx.broker.as_ref(), PIPELINE_QUEUES).await;
    Ok(Json(json!({
        "queues": report,
        "workers": state.ctx.metrics.snapshot(),
    })))
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /v1/admin/queues/:queue/dlq
async fn list_dlq(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<DlqQuery>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let entries = state.ctx.broker.list_dlq(&queue, query.limit).await?;
    Ok(Json(json!({ "queue": queue, "entries": entries })))
}

/// POST /v1/admin/queues/:queue/dlq/replay
///
/// Controlled replay: attempts reset to zero, trace context preserved.
async fn replay_dlq(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<DlqQuery>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let replayed = state.ctx.broker.replay_dlq(&queue, query.limit).await?;
    Ok(Json(json!({ "queue": queue, "replayed": replayed })))
}

/// GET /v1/admin/storage/health
async fn storage_health(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    match state.ctx.blob.probe().await {
        Ok(()) => Ok(Json(json!({
            "healthy": true,
            "mode": state.settings().storage_mode.as_str(),
        }))),
        Err(e) => Ok(Json(json!({
            "healthy": false,
            "mode": state.settings().storage_mode.as_str(),
            "error": e.to_string(),
        }))),
    }
}

/// GET /v1/admin/system/readiness
async fn readiness(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let readiness_state = evaluate_readiness(state.settings());
    Ok(Json(serde_json::to_value(readiness_state).map_err(
        |e| ApiError::Internal(e.to_string()),
    )?))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

/// GET /v1/admin/audit
async fn audit_trail(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let events = audit::recent_audit(&state.ctx.db, query.limit).await?;
    Ok(Json(json!({ "events": events })))
}

/// POST /v1/admin/connectors/:provider/:meeting_id/join
async fn connector_join(
    State(state): State<AppState>,
    Path((provider, meeting_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let session = lifecycle_for(&state, &provider)?.join(&meeting_id).await?;
    Ok(Json(serde_json::to_value(session).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// POST /v1/admin/connectors/:provider/:meeting_id/leave
async fn connector_leave(
    State(state): State<AppState>,
    Path((provider, meeting_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    lifecycle_for(&state, &provider)?.leave(&meeting_id).await?;
    Ok(Json(json!({ "state": "absent" })))
}

/// POST /v1/admin/connectors/:provider/:meeting_id/reconnect
async fn connector_reconnect(
    State(state): State<AppState>,
    Path((provider, meeting_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let session = lifecycle_for(&state, &provider)?.reconnect(&meeting_id).await?;
    Ok(Json(serde_json::to_value(session).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// POST /v1/admin/connectors/:provider/:meeting_id/live-pull
async fn connector_live_pull(
    State(state): State<AppState>,
    Path((provider, meeting_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let outcome = lifecycle_for(&state, &provider)?.live_pull(&meeting_id).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// GET /v1/admin/connectors/:provider/:meeting_id/status
async fn connector_status(
    State(state): State<AppState>,
    Path((provider, meeting_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    match lifecycle_for(&state, &provider)?.status(&meeting_id).await? {
        Some(session) => Ok(Json(
            serde_json::to_value(session).map_err(|e| ApiError::Internal(e.to_string()))?,
        )),
        None => Ok(Json(json!({ "meeting_id": meeting_id, "state": "absent" }))),
    }
}

/// GET /v1/admin/connectors/:provider/health
async fn connector_health(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    match lifecycle_for(&state, &provider)?.health().await {
        Ok(health) => Ok(Json(json!({
            "healthy": health.healthy,
            "detail": health.detail,
        }))),
        Err(e) => Ok(Json(json!({
            "healthy": false,
            "detail": e.to_string(),
        }))),
    }
}

/// GET /v1/admin/connectors/:provider/sessions
async fn connector_sessions(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let sessions = lifecycle_for(&state, &provider)?.list_sessions().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// POST /v1/admin/connectors/:provider/reconcile
async fn connector_reconcile(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let report = run_reconcile_once(lifecycle_for(&state, &provider)?).await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// GET /v1/admin/connectors/:provider/circuit-breaker
async fn breaker_status(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_READ)?;
    let status = lifecycle_for(&state, &provider)?.breaker_status().await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| ApiError::Internal(e.to_string()))?))
}

#[derive(Debug, Deserialize, Default)]
struct BreakerResetRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// POST /v1/admin/connectors/:provider/circuit-breaker/reset
async fn breaker_reset(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(auth): Extension<AuthContext>,
    body: Option<Json<BreakerResetRequest>>,
) -> ApiResult<Json<Value>> {
    auth.require_scope(SCOPE_ADMIN_WRITE)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "operator requested".to_string());
    lifecycle_for(&state, &provider)?
        .breaker_reset(&auth.subject, &reason)
        .await?;
    let status = lifecycle_for(&state, &provider)?.breaker_status().await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| ApiError::Internal(e.to_string()))?))
}
