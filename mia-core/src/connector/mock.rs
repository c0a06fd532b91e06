//! Scriptable in-memory connector, used as the `mock` provider and by the
//! lifecycle/breaker test suites.

use super::{ConnectorHealth, JoinOutcome, MeetingConnector, ProviderChunk};
use async_trait::async_trait;
use mia_common::error::ProviderErrorKind;
use mia_common::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
struct MockScript {
    join_failures_remaining: u32,
    join_error_kind: ProviderErrorKind,
    fetch_failures_remaining: u32,
    chunk_batches: VecDeque<Vec<ProviderChunk>>,
    healthy: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            join_failures_remaining: 0,
            join_error_kind: ProviderErrorKind::Unavailable,
            fetch_failures_remaining: 0,
            chunk_batches: VecDeque::new(),
            healthy: true,
        }
    }
}

/// Counts every provider call so tests can assert single-flight and probe
/// behavior.
#[derive(Default)]
pub struct MockMeetingConnector {
    script: Mutex<MockScript>,
    join_calls: AtomicU32,
    leave_calls: AtomicU32,
    fetch_calls: AtomicU32,
}

impl MockMeetingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `count` joins fail with `kind`.
    pub fn fail_joins(&self, count: u32, kind: ProviderErrorKind) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.join_failures_remaining = count;
        script.join_error_kind = kind;
    }

    /// Next `count` chunk fetches fail as unavailable.
    pub fn fail_fetches(&self, count: u32) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fetch_failures_remaining = count;
    }

    /// Queue one batch of chunks for the next successful fetch.
    pub fn push_chunks(&self, batch: Vec<ProviderChunk>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chunk_batches
            .push_back(batch);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).healthy = healthy;
    }

    pub fn join_calls(&self) -> u32 {
        self.join_calls.load(Ordering::SeqCst)
    }

    pub fn leave_calls(&self) -> u32 {
        self.leave_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeetingConnector for MockMeetingConnector {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn join(&self, meeting_id: &str) -> Result<JoinOutcome> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if script.join_failures_remaining > 0 {
            script.join_failures_remaining -= 1;
            return Err(Error::provider(script.join_error_kind, "scripted join failure"));
        }
        Ok(JoinOutcome {
            provider_ref: format!("mock-{}", meeting_id),
        })
    }

    async fn leave(&self, _meeting_id: &str, _provider_ref: &str) -> Result<()> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_chunks(
        &self,
        _meeting_id: &str,
        _provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if script.fetch_failures_remaining > 0 {
            script.fetch_failures_remaining -= 1;
            return Err(Error::provider(
                ProviderErrorKind::Unavailable,
                "scripted fetch failure",
            ));
        }
        let mut batch = script.chunk_batches.pop_front().unwrap_or_default();
        batch.truncate(limit);
        Ok(batch)
    }

    async fn health(&self) -> Result<ConnectorHealth> {
        let script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ConnectorHealth {
            healthy: script.healthy,
            detail: None,
        })
    }
}
