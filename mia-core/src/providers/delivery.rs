//! Report delivery provider interface.

use async_trait::async_trait;
use mia_common::config::Settings;
use mia_common::{Error, Result};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone)]
pub struct DeliveryAttachment {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub meeting_id: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<DeliveryAttachment>,
}

/// Sends a finished report to its recipients (e.g. over SMTP in a real
/// deployment).
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> Result<()>;
}

pub fn build_delivery_provider(settings: &Settings) -> Result<Arc<dyn DeliveryProvider>> {
    match settings.delivery_provider.trim().to_lowercase().as_str() {
        "mock" => Ok(Arc::new(MockDeliveryProvider::new())),
        other => Err(Error::Config(format!("unknown delivery provider: {}", other))),
    }
}

/// Records every send so tests can assert on deliveries; logs for humans.
#[derive(Default)]
pub struct MockDeliveryProvider {
    sent: Mutex<Vec<DeliveryRequest>>,
}

impl MockDeliveryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<DeliveryRequest> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeliveryProvider for MockDeliveryProvider {
    async fn send(&self, request: &DeliveryRequest) -> Result<()> {
        info!(
            meeting_id = %request.meeting_id,
            recipients = request.recipients.len(),
            attachments = request.attachments.len(),
            subject = %request.subject,
            "delivery sent"
        );
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_sends() {
        let provider = MockDeliveryProvider::new();
        provider
            .send(&DeliveryRequest {
                meeting_id: "m-1".to_string(),
                recipients: vec!["hr@example.com".to_string()],
                subject: "Meeting report".to_string(),
                body: "...".to_string(),
                attachments: vec![],
            })
            .await
            .unwrap();

        let sent = provider.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["hr@example.com"]);
    }
}
