//! Meeting connector: joins a third-party conferencing provider and pulls
//! media chunks on the server's behalf.

pub mod http;
pub mod lifecycle;
pub mod mock;
pub mod reconcile;

use async_trait::async_trait;
use mia_common::config::Settings;
use mia_common::{Error, Result};
use std::sync::Arc;

/// A media chunk as fetched from the provider.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderChunk {
    pub seq: Option<i64>,
    pub media_b64: String,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub provider_ref: String,
}

#[derive(Debug, Clone)]
pub struct ConnectorHealth {
    pub healthy: bool,
    pub detail: Option<String>,
}

/// Adapter over one conferencing provider.
#[async_trait]
pub trait MeetingConnector: Send + Sync {
    fn provider_name(&self) -> &str;
    async fn join(&self, meeting_id: &str) -> Result<JoinOutcome>;
    async fn leave(&self, meeting_id: &str, provider_ref: &str) -> Result<()>;
    async fn fetch_chunks(
        &self,
        meeting_id: &str,
        provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>>;
    async fn health(&self) -> Result<ConnectorHealth>;
}

/// Resolve the configured connector; `None` when the deployment runs
/// without one.
pub fn build_connector(settings: &Settings) -> Result<Option<Arc<dyn MeetingConnector>>> {
    match settings.connector_provider.trim().to_lowercase().as_str() {
        "none" | "" => Ok(None),
        "mock" => Ok(Some(Arc::new(mock::MockMeetingConnector::new()))),
        "http" => {
            let base = settings
                .connector_api_base
                .clone()
                .ok_or_else(|| Error::Config("CONNECTOR_API_BASE required for http connector".into()))?;
            let token = settings
                .connector_api_token
                .clone()
                .ok_or_else(|| Error::Config("CONNECTOR_API_TOKEN required for http connector".into()))?;
            Ok(Some(Arc::new(http::HttpMeetingConnector::new(
                base,
                token,
                std::time::Duration::from_secs(settings.connector_timeout_sec),
            )?)))
        }
        other => Err(Error::Config(format!("unknown connector provider: {}", other))),
    }
}
