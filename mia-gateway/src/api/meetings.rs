//! Meeting routes: start, chunk ingest, finalize, status, artifacts.

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::tenancy::resolve_tenant;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::meetings::{self, MeetingMode, MeetingStatus};
use mia_common::trace::TraceContext;
use mia_core::analytics::render_report_text;
use mia_core::dispatcher::{self, EnqueueOutcome};
use mia_core::finalize::finalize_meeting;
use mia_core::ingest::{ingest_chunk, ChunkIngestRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

const MAX_CHUNK_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
pub struct StartMeetingRequest {
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub delivery_recipients: Vec<String>,
    /// Override for the connector auto-join on realtime meetings.
    #[serde(default)]
    pub auto_join_connector: Option<bool>,
}

/// POST /v1/meetings/start
pub async fn start_meeting(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<StartMeetingRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = resolve_tenant(&auth, state.settings())?;
    let meeting_id = body
        .meeting_id
        .unwrap_or_else(|| format!("mtg-{}", Uuid::new_v4().simple()));
    let mode = match body.mode.as_deref() {
        Some(raw) => MeetingMode::parse(raw)?,
        None => MeetingMode::Batch,
    };

    meetings::create_meeting(
        &state.ctx.db,
        &meeting_id,
        tenant.as_deref(),
        mode,
        &body.delivery_recipients,
    )
    .await?;

    // Realtime meetings auto-join the connector unless the caller opts out.
    let auto_join = mode == MeetingMode::Realtime
        && state.lifecycle.is_some()
        && body.auto_join_connector.unwrap_or(true);
    let mut connector_provider = None;
    let mut connector_connected = None;
    if auto_join {
        if let Some(lifecycle) = state.lifecycle.as_ref() {
            connector_provider = Some(lifecycle.provider().to_string());
            meetings::set_connector_provider(&state.ctx.db, &meeting_id, lifecycle.provider())
                .await?;
            connector_connected = Some(match lifecycle.join(&meeting_id).await {
                Ok(session) => {
                    session.state == mia_common::db::sessions::SessionState::Connected
                }
                Err(e) => {
                    tracing::warn!(meeting_id = %meeting_id, error = %e, "connector auto-join failed");
                    false
                }
            });
        }
    }

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "mode": mode.as_str(),
        "connector_auto_join": auto_join,
        "connector_provider": connector_provider,
        "connector_connected": connector_connected,
    })))
}

/// Parsed chunk submission: multipart (`media` field) or JSON
/// (`media_b64`).
struct ChunkBody {
    media: Vec<u8>,
    seq: Option<i64>,
    idempotency_key: Option<String>,
}

async fn read_chunk_body(request: Request) -> Result<ChunkBody, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?;
        let mut media = None;
        let mut seq = None;
        let mut idempotency_key = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("multipart read failed: {}", e)))?
        {
            match field.name().unwrap_or("") {
                "media" => {
                    media = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ApiError::BadRequest(format!("media read failed: {}", e)))?
                            .to_vec(),
                    );
                }
                "seq" => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("seq read failed: {}", e)))?;
                    seq = Some(
                        text.trim()
                            .parse()
                            .map_err(|_| ApiError::BadRequest(format!("invalid seq: {}", text)))?,
                    );
                }
                "idempotency_key" => {
                    idempotency_key = field.text().await.ok().filter(|t| !t.is_empty());
                }
                _ => {}
            }
        }
        return Ok(ChunkBody {
            media: media.ok_or_else(|| ApiError::BadRequest("missing 'media' field".into()))?,
            seq,
            idempotency_key,
        });
    }

    #[derive(Deserialize)]
    struct JsonChunk {
        media_b64: String,
        #[serde(default)]
        seq: Option<i64>,
        #[serde(default)]
        idempotency_key: Option<String>,
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_CHUNK_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("body read failed: {}", e)))?;
    let body: JsonChunk = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))?;
    let media = BASE64
        .decode(body.media_b64.as_bytes())
        .map_err(|_| ApiError::BadRequest("media_b64 does not decode".into()))?;

    Ok(ChunkBody {
        media,
        seq: body.seq,
        idempotency_key: body.idempotency_key,
    })
}

async fn ingest_for_request(
    state: &AppState,
    auth: &AuthContext,
    trace: &TraceContext,
    meeting_id: String,
    request: Request,
) -> ApiResult<Json<Value>> {
    let tenant = resolve_tenant(auth, state.settings())?;
    // Tenant visibility check before any side effect.
    meetings::get_meeting_for_tenant(&state.ctx.db, &meeting_id, tenant.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let body = read_chunk_body(request).await?;
    let outcome = ingest_chunk(
        &state.ctx,
        ChunkIngestRequest {
            meeting_id,
            seq: body.seq,
            media: body.media,
            idempotency_key: body.idempotency_key,
            trace: trace.clone(),
        },
    )
    .await?;

    Ok(Json(json!({
        "chunk_seq": outcome.chunk_seq,
        "is_duplicate": outcome.is_duplicate,
        "idempotency_key": outcome.idempotency_key,
    })))
}

/// POST /v1/meetings/:id/chunks (user contour)
pub async fn post_chunk(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
    request: Request,
) -> ApiResult<Json<Value>> {
    ingest_for_request(&state, &auth, &trace, meeting_id, request).await
}

/// POST /v1/internal/meetings/:id/chunks (service contour)
pub async fn post_chunk_internal(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
    request: Request,
) -> ApiResult<Json<Value>> {
    auth.require_scope(crate::auth::SCOPE_INTERNAL_INGEST)?;
    ingest_for_request(&state, &auth, &trace, meeting_id, request).await
}

/// POST /v1/meetings/:id/finalize
pub async fn finalize(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
) -> ApiResult<Json<Value>> {
    let tenant = resolve_tenant(&auth, state.settings())?;
    meetings::get_meeting_for_tenant(&state.ctx.db, &meeting_id, tenant.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let finalized = finalize_meeting(&state.ctx, &meeting_id, &trace, "explicit").await?;
    Ok(Json(json!({ "finalized": finalized })))
}

/// GET /v1/meetings/:id
pub async fn get_meeting(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    let tenant = resolve_tenant(&auth, state.settings())?;
    let meeting = meetings::get_meeting_for_tenant(&state.ctx.db, &meeting_id, tenant.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let enhanced =
        artifacts::get_artifact(&state.ctx.db, &meeting_id, ArtifactKind::EnhancedTranscript)
            .await?;
    let report = artifacts::get_artifact(&state.ctx.db, &meeting_id, ArtifactKind::Report)
        .await?
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| ApiError::Internal(format!("stored report is not JSON: {}", e)))?;
    let kinds = artifacts::list_artifact_kinds(&state.ctx.db, &meeting_id).await?;

    Ok(Json(json!({
        "meeting_id": meeting.id,
        "status": meeting.status.as_str(),
        "mode": meeting.mode.as_str(),
        "created_at": meeting.created_at,
        "finalized_at": meeting.finalized_at,
        "artifacts": kinds,
        "enhanced_transcript": enhanced,
        "report": report,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub kind: String,
    #[serde(default)]
    pub fmt: Option<String>,
}

/// GET /v1/meetings/:id/artifact?kind=&fmt=
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Query(query): Query<ArtifactQuery>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Response> {
    let tenant = resolve_tenant(&auth, state.settings())?;
    meetings::get_meeting_for_tenant(&state.ctx.db, &meeting_id, tenant.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let kind = ArtifactKind::parse(&query.kind)?;
    let content = artifacts::get_artifact(&state.ctx.db, &meeting_id, kind)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("artifact '{}' not found for {}", query.kind, meeting_id))
        })?;

    let (body, content_type) = match (kind, query.fmt.as_deref()) {
        (ArtifactKind::Report, Some("txt")) => {
            let report: Value = serde_json::from_str(&content)
                .map_err(|e| ApiError::Internal(format!("stored report is not JSON: {}", e)))?;
            (render_report_text(&report), "text/plain; charset=utf-8")
        }
        (ArtifactKind::Report | ArtifactKind::Scorecard | ArtifactKind::Comparison, _) => {
            (content, "application/json")
        }
        _ => (content, "text/plain; charset=utf-8"),
    };

    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// POST /v1/meetings/:id/artifacts/rebuild
///
/// Bumps the idempotency epoch, clears downstream artifacts and re-runs the
/// pipeline from the enhancer.
pub async fn rebuild_artifacts(
    State(state): State<AppState>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
) -> ApiResult<Response> {
    let tenant = resolve_tenant(&auth, state.settings())?;
    meetings::get_meeting_for_tenant(&state.ctx.db, &meeting_id, tenant.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;

    let epoch = meetings::bump_rebuild_epoch(&state.ctx.db, &meeting_id).await?;
    artifacts::clear_downstream(&state.ctx.db, &meeting_id).await?;
    meetings::set_status(&state.ctx.db, &meeting_id, MeetingStatus::Processing, true).await?;

    let outcome = dispatcher::enqueue_enhancer(&state.ctx, &meeting_id, &trace).await?;
    let jobs = match outcome {
        EnqueueOutcome::Enqueued { job_id, queue } => json!([{"queue": queue, "job_id": job_id}]),
        EnqueueOutcome::Inline { .. } => json!([]),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"epoch": epoch, "jobs": jobs})),
    )
        .into_response())
}
