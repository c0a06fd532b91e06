//! Centralized configuration for MIA services.
//!
//! Settings are read from environment variables with typed defaults. Tests
//! build `Settings` literals directly (see `Settings::default`) instead of
//! mutating the process environment.

use crate::{Error, Result};

/// Queue execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Jobs go through the broker and are executed by worker pools.
    Queue,
    /// All pipeline stages run synchronously in the request path.
    Inline,
}

/// Authentication mode for the HTTP/WebSocket surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    ApiKey,
    Jwt,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::ApiKey => "api_key",
            AuthMode::Jwt => "jwt",
        }
    }
}

/// Blob storage mode. `SharedFs` is the same local filesystem implementation
/// pointed at a shared mount; readiness treats the two differently in prod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    SharedFs,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::SharedFs => "shared_fs",
        }
    }
}

/// Runtime settings shared by the gateway and the worker.
#[derive(Debug, Clone)]
pub struct Settings {
    // Runtime
    pub app_env: String,
    pub api_host: String,
    pub api_port: u16,
    pub cors_allowed_origins: String,

    // Storage
    pub database_path: String,
    pub chunks_dir: String,
    pub storage_mode: StorageMode,

    // Auth
    pub auth_mode: AuthMode,
    pub api_keys: Vec<String>,
    pub service_api_keys: Vec<String>,
    pub allow_service_api_key_in_jwt_mode: bool,
    pub oidc_issuer_url: Option<String>,
    pub oidc_jwks_url: Option<String>,
    pub oidc_audience: Option<String>,
    pub jwt_shared_secret: Option<String>,
    pub jwt_clock_skew_sec: u64,
    pub jwt_service_claim_key: String,
    pub jwt_service_claim_values: Vec<String>,
    pub tenant_enforcement_enabled: bool,
    pub tenant_claim_key: String,
    pub audit_persist_enabled: bool,

    // Queue
    pub queue_mode: QueueMode,
    pub worker_concurrency: usize,
    pub visibility_timeout_sec: u64,
    pub queue_max_attempts: u32,
    pub queue_retry_backoff_ms: u64,
    pub finalize_inactivity_sec: u64,

    // Connector
    pub connector_provider: String,
    pub connector_api_base: Option<String>,
    pub connector_api_token: Option<String>,
    pub connector_timeout_sec: u64,
    pub connector_retries: u32,
    pub connector_retry_backoff_ms: u64,
    pub op_lock_ttl_sec: u64,
    pub join_idempotent_ttl_sec: u64,
    pub live_pull_fail_reconnect_threshold: u32,

    // Circuit breaker
    pub cb_failure_threshold: u32,
    pub cb_window_sec: u64,
    pub cb_open_sec: u64,
    pub cb_auto_reset_enabled: bool,
    pub cb_auto_reset_min_age_sec: u64,

    // Reconciliation
    pub reconcile_interval_sec: u64,
    pub reconcile_stale_sec: u64,
    pub reconciliation_limit: usize,
    pub live_pull_sessions_limit: usize,
    pub live_pull_batch_limit: usize,

    // Providers
    pub stt_provider: String,
    pub enhancer_provider: String,
    pub delivery_provider: String,

    // Readiness
    pub readiness_fail_fast: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_env: "dev".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8010,
            cors_allowed_origins: "*".to_string(),
            database_path: "./data/mia.db".to_string(),
            chunks_dir: "./data/chunks".to_string(),
            storage_mode: StorageMode::Local,
            auth_mode: AuthMode::None,
            api_keys: Vec::new(),
            service_api_keys: Vec::new(),
            allow_service_api_key_in_jwt_mode: true,
            oidc_issuer_url: None,
            oidc_jwks_url: None,
            oidc_audience: None,
            jwt_shared_secret: None,
            jwt_clock_skew_sec: 30,
            jwt_service_claim_key: "token_type".to_string(),
            jwt_service_claim_values: vec![
                "service".to_string(),
                "client_credentials".to_string(),
                "m2m".to_string(),
            ],
            tenant_enforcement_enabled: false,
            tenant_claim_key: "tenant_id".to_string(),
            audit_persist_enabled: true,
            queue_mode: QueueMode::Queue,
            worker_concurrency: 2,
            visibility_timeout_sec: 60,
            queue_max_attempts: 3,
            queue_retry_backoff_ms: 500,
            finalize_inactivity_sec: 120,
            connector_provider: "none".to_string(),
            connector_api_base: None,
            connector_api_token: None,
            connector_timeout_sec: 10,
            connector_retries: 2,
            connector_retry_backoff_ms: 300,
            op_lock_ttl_sec: 30,
            join_idempotent_ttl_sec: 60,
            live_pull_fail_reconnect_threshold: 3,
            cb_failure_threshold: 5,
            cb_window_sec: 60,
            cb_open_sec: 30,
            cb_auto_reset_enabled: false,
            cb_auto_reset_min_age_sec: 600,
            reconcile_interval_sec: 30,
            reconcile_stale_sec: 120,
            reconciliation_limit: 10,
            live_pull_sessions_limit: 10,
            live_pull_batch_limit: 16,
            stt_provider: "mock".to_string(),
            enhancer_provider: "mock".to_string(),
            delivery_provider: "mock".to_string(),
            readiness_fail_fast: true,
        }
    }
}

impl Settings {
    /// Load settings from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let d = Settings::default();
        Ok(Self {
            app_env: env_str("APP_ENV", &d.app_env),
            api_host: env_str("API_HOST", &d.api_host),
            api_port: env_parse("API_PORT", d.api_port)?,
            cors_allowed_origins: env_str("CORS_ALLOWED_ORIGINS", &d.cors_allowed_origins),
            database_path: env_str("DATABASE_PATH", &d.database_path),
            chunks_dir: env_str("CHUNKS_DIR", &d.chunks_dir),
            storage_mode: parse_storage_mode(&env_str("STORAGE_MODE", d.storage_mode.as_str()))?,
            auth_mode: parse_auth_mode(&env_str("AUTH_MODE", d.auth_mode.as_str()))?,
            api_keys: env_csv("API_KEYS"),
            service_api_keys: env_csv("SERVICE_API_KEYS"),
            allow_service_api_key_in_jwt_mode: env_parse(
                "ALLOW_SERVICE_API_KEY_IN_JWT_MODE",
                d.allow_service_api_key_in_jwt_mode,
            )?,
            oidc_issuer_url: env_opt("OIDC_ISSUER_URL"),
            oidc_jwks_url: env_opt("OIDC_JWKS_URL"),
            oidc_audience: env_opt("OIDC_AUDIENCE"),
            jwt_shared_secret: env_opt("JWT_SHARED_SECRET"),
            jwt_clock_skew_sec: env_parse("JWT_CLOCK_SKEW_SEC", d.jwt_clock_skew_sec)?,
            jwt_service_claim_key: env_str("JWT_SERVICE_CLAIM_KEY", &d.jwt_service_claim_key),
            jwt_service_claim_values: {
                let parsed = env_csv("JWT_SERVICE_CLAIM_VALUES");
                if parsed.is_empty() {
                    d.jwt_service_claim_values.clone()
                } else {
                    parsed
                }
            },
            tenant_enforcement_enabled: env_parse(
                "TENANT_ENFORCEMENT_ENABLED",
                d.tenant_enforcement_enabled,
            )?,
            tenant_claim_key: env_str("TENANT_CLAIM_KEY", &d.tenant_claim_key),
            audit_persist_enabled: env_parse("AUDIT_PERSIST_ENABLED", d.audit_persist_enabled)?,
            queue_mode: parse_queue_mode(&env_str("QUEUE_MODE", "queue"))?,
            worker_concurrency: env_parse("WORKER_CONCURRENCY", d.worker_concurrency)?,
            visibility_timeout_sec: env_parse("VISIBILITY_TIMEOUT_SEC", d.visibility_timeout_sec)?,
            queue_max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", d.queue_max_attempts)?,
            queue_retry_backoff_ms: env_parse("QUEUE_RETRY_BACKOFF_MS", d.queue_retry_backoff_ms)?,
            finalize_inactivity_sec: env_parse(
                "FINALIZE_INACTIVITY_SEC",
                d.finalize_inactivity_sec,
            )?,
            connector_provider: env_str("CONNECTOR_PROVIDER", &d.connector_provider),
            connector_api_base: env_opt("CONNECTOR_API_BASE"),
            connector_api_token: env_opt("CONNECTOR_API_TOKEN"),
            connector_timeout_sec: env_parse("CONNECTOR_TIMEOUT_SEC", d.connector_timeout_sec)?,
            connector_retries: env_parse("CONNECTOR_RETRIES", d.connector_retries)?,
            connector_retry_backoff_ms: env_parse(
                "CONNECTOR_RETRY_BACKOFF_MS",
                d.connector_retry_backoff_ms,
            )?,
            op_lock_ttl_sec: env_parse("OP_LOCK_TTL_SEC", d.op_lock_ttl_sec)?,
            join_idempotent_ttl_sec: env_parse(
                "JOIN_IDEMPOTENT_TTL_SEC",
                d.join_idempotent_ttl_sec,
            )?,
            live_pull_fail_reconnect_threshold: env_parse(
                "LIVE_PULL_FAIL_RECONNECT_THRESHOLD",
                d.live_pull_fail_reconnect_threshold,
            )?,
            cb_failure_threshold: env_parse("CB_FAILURE_THRESHOLD", d.cb_failure_threshold)?,
            cb_window_sec: env_parse("CB_WINDOW_SEC", d.cb_window_sec)?,
            cb_open_sec: env_parse("CB_OPEN_SEC", d.cb_open_sec)?,
            cb_auto_reset_enabled: env_parse("CB_AUTO_RESET_ENABLED", d.cb_auto_reset_enabled)?,
            cb_auto_reset_min_age_sec: env_parse(
                "CB_AUTO_RESET_MIN_AGE_SEC",
                d.cb_auto_reset_min_age_sec,
            )?,
            reconcile_interval_sec: env_parse("RECONCILE_INTERVAL_SEC", d.reconcile_interval_sec)?,
            reconcile_stale_sec: env_parse("RECONCILE_STALE_SEC", d.reconcile_stale_sec)?,
            reconciliation_limit: env_parse("RECONCILIATION_LIMIT", d.reconciliation_limit)?,
            live_pull_sessions_limit: env_parse(
                "LIVE_PULL_SESSIONS_LIMIT",
                d.live_pull_sessions_limit,
            )?,
            live_pull_batch_limit: env_parse("LIVE_PULL_BATCH_LIMIT", d.live_pull_batch_limit)?,
            stt_provider: env_str("STT_PROVIDER", &d.stt_provider),
            enhancer_provider: env_str("ENHANCER_PROVIDER", &d.enhancer_provider),
            delivery_provider: env_str("DELIVERY_PROVIDER", &d.delivery_provider),
            readiness_fail_fast: env_parse("READINESS_FAIL_FAST", d.readiness_fail_fast)?,
        })
    }

    pub fn is_prod(&self) -> bool {
        matches!(self.app_env.trim().to_lowercase().as_str(), "prod" | "production")
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has invalid value: {}", name, raw))),
        _ => Ok(default),
    }
}

fn parse_queue_mode(raw: &str) -> Result<QueueMode> {
    match raw.trim().to_lowercase().as_str() {
        "queue" => Ok(QueueMode::Queue),
        "inline" => Ok(QueueMode::Inline),
        other => Err(Error::Config(format!("QUEUE_MODE unknown: {}", other))),
    }
}

fn parse_auth_mode(raw: &str) -> Result<AuthMode> {
    match raw.trim().to_lowercase().as_str() {
        "none" => Ok(AuthMode::None),
        "api_key" => Ok(AuthMode::ApiKey),
        "jwt" => Ok(AuthMode::Jwt),
        other => Err(Error::Config(format!("AUTH_MODE unknown: {}", other))),
    }
}

fn parse_storage_mode(raw: &str) -> Result<StorageMode> {
    match raw.trim().to_lowercase().as_str() {
        "local" => Ok(StorageMode::Local),
        "shared_fs" => Ok(StorageMode::SharedFs),
        other => Err(Error::Config(format!("STORAGE_MODE unknown: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_dev() {
        let s = Settings::default();
        assert!(!s.is_prod());
        assert_eq!(s.auth_mode, AuthMode::None);
        assert_eq!(s.queue_mode, QueueMode::Queue);
    }

    #[test]
    fn test_prod_detection() {
        let mut s = Settings::default();
        s.app_env = "Production".to_string();
        assert!(s.is_prod());
        s.app_env = "staging".to_string();
        assert!(!s.is_prod());
    }

    #[test]
    fn test_mode_parsers() {
        assert_eq!(parse_queue_mode("inline").unwrap(), QueueMode::Inline);
        assert_eq!(parse_auth_mode("JWT").unwrap(), AuthMode::Jwt);
        assert_eq!(parse_storage_mode("shared_fs").unwrap(), StorageMode::SharedFs);
        assert!(parse_queue_mode("bogus").is_err());
    }
}
