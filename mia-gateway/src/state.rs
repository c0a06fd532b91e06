//! Application state shared across handlers.

use crate::auth::jwt::JwksCache;
use mia_core::connector::lifecycle::ConnectorLifecycle;
use mia_core::context::PipelineContext;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<PipelineContext>,
    /// Present when a connector provider is configured.
    pub lifecycle: Option<Arc<ConnectorLifecycle>>,
    pub jwks: Arc<JwksCache>,
}

impl AppState {
    pub fn new(ctx: Arc<PipelineContext>, lifecycle: Option<Arc<ConnectorLifecycle>>) -> Self {
        let jwks = Arc::new(JwksCache::new(ctx.settings.oidc_jwks_url.clone()));
        Self {
            ctx,
            lifecycle,
            jwks,
        }
    }

    pub fn settings(&self) -> &mia_common::config::Settings {
        &self.ctx.settings
    }
}
