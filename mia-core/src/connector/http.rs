//! HTTP adapter for a real conferencing provider.
//!
//! Maps transport and status-code failures onto the provider error
//! taxonomy; the lifecycle layer decides about retries and the breaker.

use super::{ConnectorHealth, JoinOutcome, MeetingConnector, ProviderChunk};
use async_trait::async_trait;
use mia_common::error::ProviderErrorKind;
use mia_common::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct JoinResponse {
    session_ref: String,
}

#[derive(Debug, Deserialize)]
struct ChunksResponse {
    #[serde(default)]
    chunks: Vec<ProviderChunk>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    #[serde(default)]
    detail: Option<String>,
}

pub struct HttpMeetingConnector {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl HttpMeetingConnector {
    pub fn new(base: String, token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::provider(ProviderErrorKind::Network, e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                classify_status(status.as_u16()),
                format!("provider returned {}: {}", status.as_u16(), truncate(&body, 200)),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::provider(ProviderErrorKind::InvalidResponse, e.to_string()))
    }
}

fn classify_status(status: u16) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::Auth,
        429 => ProviderErrorKind::RateLimited,
        400..=499 => ProviderErrorKind::BadRequest,
        _ => ProviderErrorKind::Unavailable,
    }
}

fn classify_transport(e: &reqwest::Error) -> ProviderErrorKind {
    if e.is_decode() {
        ProviderErrorKind::InvalidResponse
    } else {
        ProviderErrorKind::Network
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl MeetingConnector for HttpMeetingConnector {
    fn provider_name(&self) -> &str {
        "http"
    }

    async fn join(&self, meeting_id: &str) -> Result<JoinOutcome> {
        let url = self.url(&format!("/v1/meetings/{}/join", meeting_id));
        debug!(meeting_id, url = %url, "connector join");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::provider(classify_transport(&e), e.to_string()))?;
        let body: JoinResponse = self.parse_json(response).await?;
        Ok(JoinOutcome {
            provider_ref: body.session_ref,
        })
    }

    async fn leave(&self, meeting_id: &str, provider_ref: &str) -> Result<()> {
        let url = self.url(&format!("/v1/sessions/{}/leave", provider_ref));
        debug!(meeting_id, url = %url, "connector leave");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::provider(classify_transport(&e), e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                classify_status(status.as_u16()),
                format!("provider returned {}: {}", status.as_u16(), truncate(&body, 200)),
            ));
        }
        Ok(())
    }

    async fn fetch_chunks(
        &self,
        meeting_id: &str,
        provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>> {
        let url = self.url(&format!("/v1/sessions/{}/chunks?limit={}", provider_ref, limit));
        debug!(meeting_id, url = %url, "connector fetch chunks");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::provider(classify_transport(&e), e.to_string()))?;
        let body: ChunksResponse = self.parse_json(response).await?;
        Ok(body.chunks)
    }

    async fn health(&self) -> Result<ConnectorHealth> {
        let url = self.url("/v1/health");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::provider(classify_transport(&e), e.to_string()))?;
        let body: HealthResponse = self.parse_json(response).await?;
        Ok(ConnectorHealth {
            healthy: body.healthy,
            detail: body.detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(401), ProviderErrorKind::Auth);
        assert_eq!(classify_status(403), ProviderErrorKind::Auth);
        assert_eq!(classify_status(404), ProviderErrorKind::BadRequest);
        assert_eq!(classify_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(classify_status(500), ProviderErrorKind::Unavailable);
        assert_eq!(classify_status(503), ProviderErrorKind::Unavailable);
    }

    #[test]
    fn test_retryability_follows_classification() {
        assert!(!classify_status(401).is_retryable());
        assert!(!classify_status(400).is_retryable());
        assert!(classify_status(429).is_retryable());
        assert!(classify_status(502).is_retryable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
