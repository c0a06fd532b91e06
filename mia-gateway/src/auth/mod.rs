//! Authentication and the user/service contour split.
//!
//! Modes: `none` (local only), `api_key` (two static key sets), `jwt`
//! (OIDC with an optional service API-key fallback outside prod). Every
//! allow/deny decision is audited.

pub mod jwt;

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use mia_common::config::AuthMode;
use mia_common::db::audit::{self, AuditDecision};
use tracing::{info, warn};

pub const SCOPE_ADMIN_READ: &str = "admin:read";
pub const SCOPE_ADMIN_WRITE: &str = "admin:write";
pub const SCOPE_INTERNAL_INGEST: &str = "ingest:internal";

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// AUTH_MODE=none; every contour is open (local development).
    Anonymous,
    UserApiKey,
    ServiceApiKey,
    Jwt,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Anonymous => "anonymous",
            AuthType::UserApiKey => "user_api_key",
            AuthType::ServiceApiKey => "service_api_key",
            AuthType::Jwt => "jwt",
        }
    }
}

/// Request-scoped authentication context.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub auth_type: AuthType,
    pub is_service: bool,
    pub tenant_id: Option<String>,
    pub scopes: Vec<String>,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            auth_type: AuthType::Anonymous,
            is_service: true,
            tenant_id: None,
            scopes: Vec::new(),
        }
    }

    /// Scope check for JWT service identities; API-key service identities
    /// carry full service privileges.
    pub fn require_scope(&self, scope: &str) -> Result<(), ApiError> {
        if self.auth_type != AuthType::Jwt {
            return Ok(());
        }
        if self.scopes.iter().any(|s| s == scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("missing scope: {}", scope)))
        }
    }
}

struct AuthFailure {
    reason: String,
    auth_type: &'static str,
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn api_key_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, AuthFailure> {
    let settings = state.settings();

    match settings.auth_mode {
        AuthMode::None => Ok(AuthContext::anonymous()),

        AuthMode::ApiKey => {
            let key = api_key_of(headers).ok_or(AuthFailure {
                reason: "missing X-API-Key".to_string(),
                auth_type: "unknown",
            })?;
            if settings.service_api_keys.iter().any(|k| k == &key) {
                Ok(AuthContext {
                    subject: "service-key".to_string(),
                    auth_type: AuthType::ServiceApiKey,
                    is_service: true,
                    tenant_id: None,
                    scopes: Vec::new(),
                })
            } else if settings.api_keys.iter().any(|k| k == &key) {
                Ok(AuthContext {
                    subject: "user-key".to_string(),
                    auth_type: AuthType::UserApiKey,
                    is_service: false,
                    tenant_id: None,
                    scopes: Vec::new(),
                })
            } else {
                Err(AuthFailure {
                    reason: "invalid API key".to_string(),
                    auth_type: "api_key",
                })
            }
        }

        AuthMode::Jwt => {
            if let Some(token) = bearer_of(headers) {
                let claims = jwt::validate_token(&token, settings, &state.jwks)
                    .await
                    .map_err(|reason| AuthFailure {
                        reason,
                        auth_type: "jwt",
                    })?;
                let is_service = jwt::is_service_claims(&claims, settings);
                let tenant_id = claims
                    .get(&settings.tenant_claim_key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                Ok(AuthContext {
                    subject: jwt::subject_of(&claims),
                    auth_type: AuthType::Jwt,
                    is_service,
                    tenant_id,
                    scopes: jwt::extract_scopes(&claims),
                })
            } else if let Some(key) = api_key_of(headers) {
                // Service API-key fallback in JWT mode, disabled in prod.
                let fallback_allowed =
                    settings.allow_service_api_key_in_jwt_mode && !settings.is_prod();
                if fallback_allowed && settings.service_api_keys.iter().any(|k| k == &key) {
                    Ok(AuthContext {
                        subject: "service-key".to_string(),
                        auth_type: AuthType::ServiceApiKey,
                        is_service: true,
                        tenant_id: None,
                        scopes: Vec::new(),
                    })
                } else {
                    Err(AuthFailure {
                        reason: "API keys not accepted in JWT mode".to_string(),
                        auth_type: "api_key",
                    })
                }
            } else {
                Err(AuthFailure {
                    reason: "missing bearer token".to_string(),
                    auth_type: "unknown",
                })
            }
        }
    }
}

async fn audit_event(
    state: &AppState,
    endpoint: &str,
    method: &str,
    subject: &str,
    auth_type: &str,
    decision: AuditDecision,
    reason: &str,
) {
    match decision {
        AuditDecision::Allow => info!(
            endpoint,
            method, subject, auth_type, reason, "security_audit_allow"
        ),
        AuditDecision::Deny => warn!(
            endpoint,
            method, subject, auth_type, reason, "security_audit_deny"
        ),
    }
    if state.settings().audit_persist_enabled {
        if let Err(e) = audit::record_audit(
            &state.ctx.db,
            endpoint,
            method,
            subject,
            auth_type,
            decision,
            reason,
        )
        .await
        {
            warn!(error = %e, "audit persist failed");
        }
    }
}

/// Middleware for user-contour routes: user credentials only.
pub async fn user_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();

    let ctx = match authenticate(&state, request.headers()).await {
        Ok(ctx) => ctx,
        Err(failure) => {
            audit_event(
                &state,
                &endpoint,
                &method,
                "unknown",
                failure.auth_type,
                AuditDecision::Deny,
                &failure.reason,
            )
            .await;
            return Err(ApiError::Unauthorized(failure.reason));
        }
    };

    // Service identities do not belong on the user contour.
    if ctx.auth_type != AuthType::Anonymous && ctx.is_service {
        audit_event(
            &state,
            &endpoint,
            &method,
            &ctx.subject,
            ctx.auth_type.as_str(),
            AuditDecision::Deny,
            "service_identity_on_user_contour",
        )
        .await;
        return Err(ApiError::Forbidden(
            "service credentials are not accepted on this endpoint".to_string(),
        ));
    }

    // Tenant enforcement rejects static keys on user routes.
    if state.settings().tenant_enforcement_enabled
        && ctx.auth_type == AuthType::UserApiKey
    {
        audit_event(
            &state,
            &endpoint,
            &method,
            &ctx.subject,
            ctx.auth_type.as_str(),
            AuditDecision::Deny,
            "api_key_rejected_under_tenant_enforcement",
        )
        .await;
        return Err(ApiError::Forbidden(
            "tenant enforcement requires JWT credentials".to_string(),
        ));
    }

    audit_event(
        &state,
        &endpoint,
        &method,
        &ctx.subject,
        ctx.auth_type.as_str(),
        AuditDecision::Allow,
        "auth_ok",
    )
    .await;

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Middleware for service-contour routes (internal ingest, admin).
pub async fn service_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();

    let ctx = match authenticate(&state, request.headers()).await {
        Ok(ctx) => ctx,
        Err(failure) => {
            audit_event(
                &state,
                &endpoint,
                &method,
                "unknown",
                failure.auth_type,
                AuditDecision::Deny,
                &failure.reason,
            )
            .await;
            return Err(ApiError::Unauthorized(failure.reason));
        }
    };

    if !ctx.is_service {
        audit_event(
            &state,
            &endpoint,
            &method,
            &ctx.subject,
            ctx.auth_type.as_str(),
            AuditDecision::Deny,
            "not_service_identity",
        )
        .await;
        return Err(ApiError::Forbidden(
            "service credentials required".to_string(),
        ));
    }

    audit_event(
        &state,
        &endpoint,
        &method,
        &ctx.subject,
        ctx.auth_type.as_str(),
        AuditDecision::Allow,
        "service_auth_ok",
    )
    .await;

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
