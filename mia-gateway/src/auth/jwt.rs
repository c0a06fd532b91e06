//! JWT validation: HS256 via shared secret, RS256 via a cached JWKS.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use mia_common::config::Settings;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// In-process JWKS cache. Keys are fetched lazily by `kid` and kept until
/// an unknown kid forces a refresh.
pub struct JwksCache {
    client: reqwest::Client,
    jwks_url: Option<String>,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksCache {
    pub fn new(jwks_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            jwks_url,
            keys: RwLock::new(HashMap::new()),
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, String> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        let url = self
            .jwks_url
            .as_deref()
            .ok_or_else(|| "OIDC_JWKS_URL not configured".to_string())?;
        debug!(kid, url, "fetching JWKS");
        let jwks: JwkSet = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("JWKS fetch failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("JWKS parse failed: {}", e))?;

        let mut keys = self.keys.write().await;
        for jwk in &jwks.keys {
            if let (Some(id), Ok(key)) = (jwk.common.key_id.clone(), DecodingKey::from_jwk(jwk)) {
                keys.insert(id, key);
            }
        }
        keys.get(kid)
            .cloned()
            .ok_or_else(|| format!("no JWKS key for kid '{}'", kid))
    }
}

/// Validate a bearer token and return its claims. The error string is a
/// deny reason for the audit trail, never echoed with secret material.
pub async fn validate_token(
    token: &str,
    settings: &Settings,
    jwks: &JwksCache,
) -> Result<serde_json::Value, String> {
    let header = decode_header(token).map_err(|e| format!("jwt header invalid: {}", e))?;

    let key = match (header.alg, &settings.jwt_shared_secret) {
        (Algorithm::HS256, Some(secret)) => DecodingKey::from_secret(secret.as_bytes()),
        (Algorithm::HS256, None) => return Err("HS256 token without shared secret".to_string()),
        _ => {
            let kid = header.kid.ok_or_else(|| "jwt missing kid".to_string())?;
            jwks.key_for(&kid).await.map_err(|e| {
                warn!(error = %e, "JWKS resolution failed");
                e
            })?
        }
    };

    let mut validation = Validation::new(header.alg);
    validation.leeway = settings.jwt_clock_skew_sec;
    match &settings.oidc_audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if let Some(issuer) = &settings.oidc_issuer_url {
        validation.set_issuer(&[issuer]);
    }

    decode::<serde_json::Value>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| format!("jwt invalid: {}", e))
}

/// Whether the claims identify a service principal (machine-to-machine).
pub fn is_service_claims(claims: &serde_json::Value, settings: &Settings) -> bool {
    let value = claims.get(&settings.jwt_service_claim_key);
    match value {
        Some(serde_json::Value::String(s)) => settings
            .jwt_service_claim_values
            .iter()
            .any(|allowed| allowed == s),
        Some(serde_json::Value::Array(items)) => items.iter().any(|item| {
            item.as_str()
                .map(|s| settings.jwt_service_claim_values.iter().any(|a| a == s))
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// Scopes from either a space-separated `scope` string or a `scopes` array.
pub fn extract_scopes(claims: &serde_json::Value) -> Vec<String> {
    if let Some(raw) = claims.get("scope").and_then(|v| v.as_str()) {
        return raw.split_whitespace().map(|s| s.to_string()).collect();
    }
    claims
        .get("scopes")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn subject_of(claims: &serde_json::Value) -> String {
    claims
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn settings_with_secret() -> Settings {
        let mut s = Settings::default();
        s.jwt_shared_secret = Some("test-secret".to_string());
        s
    }

    fn mint(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn test_hs256_round_trip() {
        let settings = settings_with_secret();
        let jwks = JwksCache::new(None);
        let token = mint(json!({"sub": "user-1", "exp": far_future()}));

        let claims = validate_token(&token, &settings, &jwks).await.unwrap();
        assert_eq!(subject_of(&claims), "user-1");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let settings = settings_with_secret();
        let jwks = JwksCache::new(None);
        let token = mint(json!({"sub": "user-1", "exp": 1_000_000}));

        let err = validate_token(&token, &settings, &jwks).await.unwrap_err();
        assert!(err.contains("jwt invalid"));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let settings = settings_with_secret();
        let jwks = JwksCache::new(None);
        let token = encode(
            &Header::default(),
            &json!({"sub": "user-1", "exp": far_future()}),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();

        assert!(validate_token(&token, &settings, &jwks).await.is_err());
    }

    #[test]
    fn test_service_claims_detection() {
        let settings = Settings::default();
        assert!(is_service_claims(&json!({"token_type": "service"}), &settings));
        assert!(is_service_claims(&json!({"token_type": "m2m"}), &settings));
        assert!(!is_service_claims(&json!({"token_type": "user"}), &settings));
        assert!(!is_service_claims(&json!({"sub": "alice"}), &settings));
    }

    #[test]
    fn test_scope_extraction() {
        assert_eq!(
            extract_scopes(&json!({"scope": "admin:read admin:write"})),
            vec!["admin:read", "admin:write"]
        );
        assert_eq!(
            extract_scopes(&json!({"scopes": ["ingest:internal"]})),
            vec!["ingest:internal"]
        );
        assert!(extract_scopes(&json!({})).is_empty());
    }
}
