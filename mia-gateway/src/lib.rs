//! # MIA Gateway
//!
//! HTTP + WebSocket front door: meeting lifecycle routes, the chunk ingest
//! facade, the admin surface, authentication with the user/service contour
//! split, tenancy, and the security audit trail.

pub mod api;
pub mod auth;
pub mod error;
pub mod state;
pub mod tenancy;
pub mod trace_layer;

pub use api::build_router;
pub use state::AppState;
