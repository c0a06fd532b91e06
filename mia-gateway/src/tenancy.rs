//! Tenant enforcement helpers.
//!
//! When enabled, the tenant claim from a user JWT scopes every meeting
//! read and write. Service identities bypass tenancy (they act across
//! tenants by design).

use crate::auth::{AuthContext, AuthType};
use crate::error::ApiError;
use mia_common::config::Settings;

/// Tenant the request operates under, or an error when enforcement is on
/// and no tenant can be established.
pub fn resolve_tenant(auth: &AuthContext, settings: &Settings) -> Result<Option<String>, ApiError> {
    if !settings.tenant_enforcement_enabled {
        return Ok(None);
    }
    if auth.is_service || auth.auth_type == AuthType::Anonymous {
        return Ok(None);
    }
    match &auth.tenant_id {
        Some(tenant) if !tenant.is_empty() => Ok(Some(tenant.clone())),
        _ => Err(ApiError::Forbidden("tenant claim missing".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_jwt(tenant: Option<&str>) -> AuthContext {
        AuthContext {
            subject: "alice".to_string(),
            auth_type: AuthType::Jwt,
            is_service: false,
            tenant_id: tenant.map(|t| t.to_string()),
            scopes: Vec::new(),
        }
    }

    #[test]
    fn test_disabled_enforcement_is_permissive() {
        let settings = Settings::default();
        assert_eq!(resolve_tenant(&user_jwt(None), &settings).unwrap(), None);
    }

    #[test]
    fn test_enforcement_requires_claim() {
        let mut settings = Settings::default();
        settings.tenant_enforcement_enabled = true;

        assert_eq!(
            resolve_tenant(&user_jwt(Some("acme")), &settings).unwrap(),
            Some("acme".to_string())
        );
        assert!(resolve_tenant(&user_jwt(None), &settings).is_err());
    }

    #[test]
    fn test_service_identity_bypasses_tenancy() {
        let mut settings = Settings::default();
        settings.tenant_enforcement_enabled = true;
        let auth = AuthContext {
            subject: "svc".to_string(),
            auth_type: AuthType::Jwt,
            is_service: true,
            tenant_id: None,
            scopes: Vec::new(),
        };
        assert_eq!(resolve_tenant(&auth, &settings).unwrap(), None);
    }
}
