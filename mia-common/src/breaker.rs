//! Circuit breaker keyed per provider.
//!
//! Closed / open / half-open with a fixed failure window anchored at the
//! first failure. The record is persisted in `broker_kv` so the gateway and
//! worker processes act on the same breaker. All updates are
//! read-modify-write inside one transaction.

use crate::db::kv;
use crate::time::now_ms;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Persisted breaker record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub failure_count: u32,
    pub window_start_ms: i64,
    pub opened_at_ms: i64,
    /// Set once the single half-open probe has been handed out.
    pub probe_claimed: bool,
    pub last_failure_reason: Option<String>,
    pub last_reset_at_ms: Option<i64>,
    pub last_reset_reason: Option<String>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            window_start_ms: 0,
            opened_at_ms: 0,
            probe_claimed: false,
            last_failure_reason: None,
            last_reset_at_ms: None,
            last_reset_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_ms: i64,
    pub open_ms: i64,
}

impl BreakerConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            failure_threshold: settings.cb_failure_threshold,
            window_ms: (settings.cb_window_sec * 1000) as i64,
            open_ms: (settings.cb_open_sec * 1000) as i64,
        }
    }
}

/// Shared circuit breaker for one provider.
#[derive(Clone)]
pub struct CircuitBreaker {
    pool: SqlitePool,
    provider: String,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(pool: SqlitePool, provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            pool,
            provider: provider.into(),
            config,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn key(&self) -> String {
        format!("cb:{}", self.provider)
    }

    async fn load(&self) -> Result<BreakerRecord> {
        match kv::kv_get(&self.pool, &self.key()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(BreakerRecord::default()),
        }
    }

    async fn save(&self, record: &BreakerRecord) -> Result<()> {
        kv::kv_put(&self.pool, &self.key(), &serde_json::to_string(record)?).await
    }

    /// Gate a provider call. `Ok(())` means the caller may proceed (and in
    /// half-open state, the caller IS the single probe). `CircuitOpen` is a
    /// fast failure distinguishable from provider errors.
    pub async fn check(&self) -> Result<()> {
        let mut record = self.load().await?;
        let now = now_ms();

        match record.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if now - record.opened_at_ms >= self.config.open_ms {
                    record.state = BreakerState::HalfOpen;
                    record.probe_claimed = true;
                    self.save(&record).await?;
                    info!(provider = %self.provider, "circuit breaker half-open, probe allowed");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if record.probe_claimed {
                    Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                    })
                } else {
                    record.probe_claimed = true;
                    self.save(&record).await?;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful provider call.
    pub async fn record_success(&self) -> Result<()> {
        let mut record = self.load().await?;
        if record.state != BreakerState::Closed {
            info!(provider = %self.provider, from = record.state.as_str(), "circuit breaker closing");
            record.state = BreakerState::Closed;
            record.failure_count = 0;
            record.probe_claimed = false;
            self.save(&record).await?;
        }
        Ok(())
    }

    /// Record a provider failure. Circuit-open fast failures must NOT be
    /// reported here; they never reached the provider.
    pub async fn record_failure(&self, reason: &str) -> Result<BreakerState> {
        let mut record = self.load().await?;
        let now = now_ms();
        record.last_failure_reason = Some(reason.to_string());

        match record.state {
            BreakerState::HalfOpen => {
                warn!(provider = %self.provider, reason, "probe failed, circuit breaker re-opening");
                record.state = BreakerState::Open;
                record.opened_at_ms = now;
                record.probe_claimed = false;
            }
            BreakerState::Closed => {
                if record.failure_count == 0 || now - record.window_start_ms > self.config.window_ms {
                    record.window_start_ms = now;
                    record.failure_count = 1;
                } else {
                    record.failure_count += 1;
                }
                if record.failure_count >= self.config.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        failures = record.failure_count,
                        "failure threshold reached, circuit breaker opening"
                    );
                    record.state = BreakerState::Open;
                    record.opened_at_ms = now;
                }
            }
            BreakerState::Open => {}
        }

        let state = record.state;
        self.save(&record).await?;
        Ok(state)
    }

    /// Force the breaker closed, recording who asked and why.
    pub async fn reset(&self, source: &str, reason: &str) -> Result<()> {
        let mut record = self.load().await?;
        info!(provider = %self.provider, source, reason, "circuit breaker reset");
        record.state = BreakerState::Closed;
        record.failure_count = 0;
        record.probe_claimed = false;
        record.last_reset_at_ms = Some(now_ms());
        record.last_reset_reason = Some(format!("{}: {}", source, reason));
        self.save(&record).await
    }

    /// Self-heal eligibility: open long enough, and the last failure was
    /// not an authoritative rejection (auth errors do not heal with time).
    pub async fn eligible_for_auto_reset(&self, min_age_ms: i64) -> Result<bool> {
        let record = self.load().await?;
        let auth_failure = record
            .last_failure_reason
            .as_deref()
            .map(|r| r.starts_with("auth"))
            .unwrap_or(false);
        Ok(record.state == BreakerState::Open
            && now_ms() - record.opened_at_ms >= min_age_ms
            && !auth_failure)
    }

    pub async fn status(&self) -> Result<BreakerRecord> {
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    fn config(threshold: u32, window_ms: i64, open_ms: i64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            window_ms,
            open_ms,
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold_within_window() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(3, 60_000, 60_000));

        cb.check().await.unwrap();
        assert_eq!(cb.record_failure("unavailable: 500").await.unwrap(), BreakerState::Closed);
        assert_eq!(cb.record_failure("unavailable: 500").await.unwrap(), BreakerState::Closed);
        assert_eq!(cb.record_failure("unavailable: 500").await.unwrap(), BreakerState::Open);

        // Fast failure while open
        assert!(matches!(cb.check().await, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_probe() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(1, 60_000, 20));

        cb.record_failure("unavailable: 500").await.unwrap();
        assert!(matches!(cb.check().await, Err(Error::CircuitOpen { .. })));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // First check after open_sec is the probe; second is refused.
        cb.check().await.unwrap();
        assert!(matches!(cb.check().await, Err(Error::CircuitOpen { .. })));

        // Probe success closes the breaker.
        cb.record_success().await.unwrap();
        cb.check().await.unwrap();
        assert_eq!(cb.status().await.unwrap().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_with_fresh_timer() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(1, 60_000, 20));

        cb.record_failure("unavailable: 500").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cb.check().await.unwrap(); // probe
        assert_eq!(cb.record_failure("unavailable: 500").await.unwrap(), BreakerState::Open);
        assert!(matches!(cb.check().await, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(2, 20, 60_000));

        cb.record_failure("unavailable: 500").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        // Window lapsed, this failure starts a new one
        assert_eq!(cb.record_failure("unavailable: 500").await.unwrap(), BreakerState::Closed);
        assert_eq!(cb.status().await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_manual_reset_records_source_and_reason() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(1, 60_000, 60_000));

        cb.record_failure("unavailable: 500").await.unwrap();
        cb.reset("admin", "operator requested").await.unwrap();

        let status = cb.status().await.unwrap();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.last_reset_reason.as_deref(), Some("admin: operator requested"));
        cb.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_reset_skips_auth_failures() {
        let pool = init_memory_database().await.unwrap();
        let cb = CircuitBreaker::new(pool, "mock", config(1, 60_000, 60_000));

        cb.record_failure("auth: 401").await.unwrap();
        assert!(!cb.eligible_for_auto_reset(0).await.unwrap());

        cb.reset("test", "rearm").await.unwrap();
        cb.record_failure("unavailable: 500").await.unwrap();
        assert!(cb.eligible_for_auto_reset(0).await.unwrap());
        assert!(!cb.eligible_for_auto_reset(60_000).await.unwrap());
    }
}
