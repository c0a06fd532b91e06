//! WebSocket contours.
//!
//! `/v1/ws` (user) and `/v1/ws/internal` (service) speak the same protocol:
//! the client streams `{"type":"chunk",...}` frames and a final
//! `{"type":"finalize"}`; the server acks each chunk and relays
//! `transcript.update` / `report` events from the pipeline event feed.

use crate::auth::{AuthContext, SCOPE_INTERNAL_INGEST};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mia_common::db::events_feed;
use mia_common::db::meetings;
use mia_common::trace::TraceContext;
use mia_core::finalize::finalize_meeting;
use mia_core::ingest::{ingest_chunk, ChunkIngestRequest};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub meeting_id: String,
}

/// Client → server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientFrame {
    Chunk {
        #[serde(default)]
        seq: Option<i64>,
        media_b64: String,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Finalize {},
}

/// GET /v1/ws (user contour)
pub async fn ws_user(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    Extension(trace): Extension<TraceContext>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    ensure_meeting(&state, &query.meeting_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, query.meeting_id, trace)))
}

/// GET /v1/ws/internal (service contour)
pub async fn ws_internal(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    auth.require_scope(SCOPE_INTERNAL_INGEST)?;
    ensure_meeting(&state, &query.meeting_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, query.meeting_id, trace)))
}

async fn ensure_meeting(state: &AppState, meeting_id: &str) -> Result<(), ApiError> {
    meetings::get_meeting(&state.ctx.db, meeting_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("meeting not found: {}", meeting_id)))?;
    Ok(())
}

fn error_frame(code: &str, reason: &str) -> String {
    json!({"type": "error", "code": code, "reason": reason}).to_string()
}

async fn handle_socket(
    state: AppState,
    mut socket: WebSocket,
    meeting_id: String,
    trace: TraceContext,
) {
    debug!(meeting_id = %meeting_id, trace_id = %trace.trace_id, "websocket session opened");

    // Cursor 0 replays the existing feed on connect, which doubles as
    // catch-up after a reconnect.
    let mut cursor = 0i64;
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(meeting_id = %meeting_id, error = %e, "websocket receive error");
                        break;
                    }
                };
                if let Some(reply) = handle_frame(&state, &meeting_id, &trace, &text).await {
                    if socket.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
            _ = poll.tick() => {
                let events = match events_feed::events_after(&state.ctx.db, &meeting_id, cursor, 64).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(meeting_id = %meeting_id, error = %e, "event feed poll failed");
                        continue;
                    }
                };
                for (feed_id, raw) in events {
                    cursor = feed_id;
                    if socket.send(Message::Text(raw)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!(meeting_id = %meeting_id, "websocket session closed");
}

/// Process one client frame; returns the immediate reply, if any.
async fn handle_frame(
    state: &AppState,
    meeting_id: &str,
    trace: &TraceContext,
    text: &str,
) -> Option<String> {
    let frame: WsClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return Some(error_frame("bad_frame", &format!("invalid frame: {}", e))),
    };

    match frame {
        WsClientFrame::Chunk {
            seq,
            media_b64,
            idempotency_key,
        } => {
            let media = match BASE64.decode(media_b64.as_bytes()) {
                Ok(bytes) => bytes,
                Err(_) => return Some(error_frame("bad_media", "media_b64 does not decode")),
            };
            let request = ChunkIngestRequest {
                meeting_id: meeting_id.to_string(),
                seq,
                media,
                idempotency_key,
                trace: trace.child(),
            };
            match ingest_chunk(&state.ctx, request).await {
                Ok(outcome) => Some(json!({"type": "ack", "seq": outcome.chunk_seq}).to_string()),
                Err(e) => Some(error_frame("ingest_failed", &e.to_string())),
            }
        }
        WsClientFrame::Finalize {} => {
            match finalize_meeting(&state.ctx, meeting_id, trace, "explicit").await {
                // The report frame follows via the event feed.
                Ok(_) => None,
                Err(e) => Some(error_frame("finalize_failed", &e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_frame_parses() {
        let frame: WsClientFrame =
            serde_json::from_str(r#"{"type":"chunk","seq":3,"media_b64":"YXVkaW8="}"#).unwrap();
        match frame {
            WsClientFrame::Chunk { seq, media_b64, .. } => {
                assert_eq!(seq, Some(3));
                assert_eq!(media_b64, "YXVkaW8=");
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_finalize_frame_parses() {
        let frame: WsClientFrame = serde_json::from_str(r#"{"type":"finalize"}"#).unwrap();
        assert!(matches!(frame, WsClientFrame::Finalize {}));
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(serde_json::from_str::<WsClientFrame>(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let raw = error_frame("bad_media", "nope");
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "bad_media");
        assert_eq!(value["reason"], "nope");
    }
}
