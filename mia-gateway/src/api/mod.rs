//! API route assembly.

pub mod admin;
pub mod meetings;
pub mod ws;

use crate::auth;
use crate::state::AppState;
use crate::trace_layer;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/v1/meetings/start", post(meetings::start_meeting))
        .route("/v1/meetings/:id", get(meetings::get_meeting))
        .route("/v1/meetings/:id/chunks", post(meetings::post_chunk))
        .route("/v1/meetings/:id/finalize", post(meetings::finalize))
        .route("/v1/meetings/:id/artifact", get(meetings::get_artifact))
        .route(
            "/v1/meetings/:id/artifacts/rebuild",
            post(meetings::rebuild_artifacts),
        )
        .route("/v1/ws", get(ws::ws_user))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::user_auth_middleware,
        ));

    let service_routes = Router::new()
        .route(
            "/v1/internal/meetings/:id/chunks",
            post(meetings::post_chunk_internal),
        )
        .route("/v1/ws/internal", get(ws::ws_internal))
        .nest("/v1/admin", admin::admin_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::service_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(user_routes)
        .merge(service_routes)
        .layer(middleware::from_fn(trace_layer::trace_middleware))
        .with_state(state)
}

/// Unauthenticated liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "service": "mia-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
