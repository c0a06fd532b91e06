//! Startup readiness gate.
//!
//! Validates configuration before a service starts taking traffic. In
//! production with fail-fast enabled, any error-severity issue aborts the
//! process; otherwise issues are exposed on the admin readiness endpoint.

use mia_common::config::{AuthMode, Settings, StorageMode};
use mia_common::{Error, Result};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessIssue {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
}

impl ReadinessIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessState {
    pub ready: bool,
    pub issues: Vec<ReadinessIssue>,
}

/// Evaluate all configuration guardrails.
pub fn evaluate_readiness(settings: &Settings) -> ReadinessState {
    let mut issues = Vec::new();
    let is_prod = settings.is_prod();

    if settings.auth_mode == AuthMode::ApiKey && settings.api_keys.is_empty() {
        issues.push(ReadinessIssue::error(
            "auth_api_keys_empty",
            "AUTH_MODE=api_key requires a non-empty API_KEYS",
        ));
    }

    if settings.service_api_keys.is_empty() {
        issues.push(ReadinessIssue::warning(
            "service_api_keys_empty",
            "SERVICE_API_KEYS is empty; service clients cannot fall back to API keys",
        ));
    }

    let connector = settings.connector_provider.trim().to_lowercase();
    if connector == "http" {
        if settings.connector_api_base.as_deref().unwrap_or("").trim().is_empty() {
            issues.push(ReadinessIssue::error(
                "connector_api_base_empty",
                "CONNECTOR_PROVIDER=http requires CONNECTOR_API_BASE",
            ));
        }
        if settings.connector_api_token.as_deref().unwrap_or("").trim().is_empty() {
            issues.push(if is_prod {
                ReadinessIssue::error(
                    "connector_api_token_empty",
                    "CONNECTOR_PROVIDER=http requires CONNECTOR_API_TOKEN",
                )
            } else {
                ReadinessIssue::warning(
                    "connector_api_token_empty",
                    "CONNECTOR_PROVIDER=http requires CONNECTOR_API_TOKEN",
                )
            });
        }
    }

    if is_prod {
        if settings.auth_mode == AuthMode::None {
            issues.push(ReadinessIssue::error(
                "auth_none_in_prod",
                "AUTH_MODE=none is forbidden in prod",
            ));
        }

        if settings.auth_mode == AuthMode::Jwt {
            if settings.allow_service_api_key_in_jwt_mode {
                issues.push(ReadinessIssue::warning(
                    "jwt_service_key_fallback_enabled",
                    "ALLOW_SERVICE_API_KEY_IN_JWT_MODE=true is ignored in prod",
                ));
            }
            let oidc_configured = settings.oidc_issuer_url.is_some()
                || settings.oidc_jwks_url.is_some()
                || settings.jwt_shared_secret.is_some();
            if !oidc_configured {
                issues.push(ReadinessIssue::error(
                    "oidc_not_configured",
                    "AUTH_MODE=jwt requires OIDC_ISSUER_URL or OIDC_JWKS_URL",
                ));
            }
            if settings.jwt_shared_secret.is_some() {
                issues.push(ReadinessIssue::warning(
                    "jwt_shared_secret_set",
                    "JWT_SHARED_SECRET is set; prefer OIDC/JWKS in prod",
                ));
            }
        }

        if settings.storage_mode != StorageMode::SharedFs {
            issues.push(ReadinessIssue::error(
                "storage_not_shared_fs",
                "prod requires STORAGE_MODE=shared_fs",
            ));
        }

        if settings.cors_allowed_origins.contains('*') {
            issues.push(ReadinessIssue::error(
                "cors_wildcard_in_prod",
                "CORS wildcard '*' is forbidden in prod",
            ));
        }

        if connector == "mock" {
            issues.push(ReadinessIssue::warning(
                "mock_connector_in_prod",
                "prod is running the mock connector",
            ));
        }
        if connector == "http" {
            let base = settings.connector_api_base.as_deref().unwrap_or("");
            if base.trim().to_lowercase().starts_with("http://") {
                issues.push(ReadinessIssue::error(
                    "connector_api_base_not_https",
                    "CONNECTOR_API_BASE must use https:// in prod",
                ));
            }
            if settings.auth_mode != AuthMode::Jwt {
                issues.push(ReadinessIssue::error(
                    "connector_requires_jwt_auth_mode",
                    "prod with a real connector requires AUTH_MODE=jwt",
                ));
            }
        }
    }

    let ready = issues.iter().all(|i| i.severity != Severity::Error);
    ReadinessState { ready, issues }
}

/// Enforce readiness at startup. In prod with fail-fast enabled, error
/// issues abort the process (non-zero exit through the caller).
pub fn enforce_startup_readiness(settings: &Settings, service_name: &str) -> Result<ReadinessState> {
    let state = evaluate_readiness(settings);
    let errors: Vec<&ReadinessIssue> = state
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .collect();

    if errors.is_empty() {
        info!(service = service_name, app_env = %settings.app_env, "startup readiness ok");
    } else {
        let codes: Vec<&str> = errors.iter().map(|e| e.code).collect();
        error!(
            service = service_name,
            app_env = %settings.app_env,
            error_codes = ?codes,
            "startup readiness failed"
        );
        if settings.is_prod() && settings.readiness_fail_fast {
            return Err(Error::Config(format!(
                "startup readiness failed for {}: {}",
                service_name,
                codes.join(", ")
            )));
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prod_settings() -> Settings {
        let mut s = Settings::default();
        s.app_env = "prod".to_string();
        s.auth_mode = AuthMode::Jwt;
        s.oidc_issuer_url = Some("https://issuer.example.com".to_string());
        s.oidc_jwks_url = Some("https://issuer.example.com/jwks".to_string());
        s.allow_service_api_key_in_jwt_mode = false;
        s.storage_mode = StorageMode::SharedFs;
        s.cors_allowed_origins = "https://app.example.com".to_string();
        s.service_api_keys = vec!["svc-key".to_string()];
        s
    }

    #[test]
    fn test_clean_prod_config_is_ready() {
        let state = evaluate_readiness(&prod_settings());
        assert!(state.ready, "unexpected issues: {:?}", state.issues);
    }

    #[test]
    fn test_local_storage_in_prod_fails_fast() {
        let mut s = prod_settings();
        s.storage_mode = StorageMode::Local;

        let state = evaluate_readiness(&s);
        assert!(!state.ready);
        assert!(state.issues.iter().any(|i| i.code == "storage_not_shared_fs"));

        // Fail-fast: the process must exit non-zero
        assert!(enforce_startup_readiness(&s, "gateway").is_err());
    }

    #[test]
    fn test_auth_none_forbidden_in_prod() {
        let mut s = prod_settings();
        s.auth_mode = AuthMode::None;
        let state = evaluate_readiness(&s);
        assert!(state.issues.iter().any(|i| i.code == "auth_none_in_prod"));
    }

    #[test]
    fn test_http_connector_requires_base_and_https() {
        let mut s = prod_settings();
        s.connector_provider = "http".to_string();
        s.connector_api_base = Some("http://connector.internal".to_string());
        s.connector_api_token = Some("token".to_string());

        let state = evaluate_readiness(&s);
        assert!(state
            .issues
            .iter()
            .any(|i| i.code == "connector_api_base_not_https"));
    }

    #[test]
    fn test_dev_config_never_fails_fast() {
        let mut s = Settings::default();
        s.auth_mode = AuthMode::ApiKey; // with empty keys: an error issue
        let state = enforce_startup_readiness(&s, "gateway").unwrap();
        assert!(!state.ready);
    }

    #[test]
    fn test_wildcard_cors_flagged_in_prod() {
        let mut s = prod_settings();
        s.cors_allowed_origins = "*".to_string();
        let state = evaluate_readiness(&s);
        assert!(state.issues.iter().any(|i| i.code == "cors_wildcard_in_prod"));
    }
}
