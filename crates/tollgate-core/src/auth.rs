use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AuthConfig, JwtAlgorithm};
use crate::{ApiError, Result};

/// JWKS keys are cached for an hour to keep load off the auth server.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Claims extracted from a validated bearer token.
#[derive(Debug, Clone)]
pub struct JwtClaims {
    pub user_id: i64,
    pub is_admin: bool,
    pub exp: i64,
    pub iat: i64,
    pub nbf: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwksKey>,
}

#[derive(Debug, Deserialize)]
struct JwksKey {
    #[serde(default)]
    kid: Option<String>,
    n: String,
    e: String,
}

struct CachedJwks {
    keys: Vec<JwksKey>,
    fetched_at: Instant,
}

/// Validates bearer tokens with either a shared secret (HS256) or a JWKS
/// endpoint (RS256). `exp` and `iat` are required; `nbf` is honored when
/// present. `user_id` falls back to `sub`, and a string `is_admin` claim of
/// "true"/"1"/"yes" coerces to admin.
pub struct JwtValidator {
    algorithm: JwtAlgorithm,
    secret: Option<String>,
    jwks_url: Option<String>,
    http: reqwest::Client,
    jwks: Mutex<Option<CachedJwks>>,
}

impl JwtValidator {
    pub fn new(config: &AuthConfig) -> Self {
        if config.algorithm == JwtAlgorithm::HS256 && config.jwt_secret.is_none() {
            warn!("jwt_secret not configured for HS256 validation");
        }
        if config.algorithm == JwtAlgorithm::RS256 && config.jwks_url.is_none() {
            warn!("jwks_url not configured for RS256 validation");
        }
        Self {
            algorithm: config.algorithm.clone(),
            secret: config.jwt_secret.clone(),
            jwks_url: config.jwks_url.clone(),
            http: reqwest::Client::new(),
            jwks: Mutex::new(None),
        }
    }

    /// Validate a token and extract claims. Accepts both a bare token and the
    /// full `Bearer <token>` header value.
    pub async fn validate(&self, token: &str) -> Result<JwtClaims> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let key = match self.algorithm {
            JwtAlgorithm::HS256 => {
                let secret = self.secret.as_deref().ok_or_else(|| {
                    ApiError::Unauthorized("JWT validation not configured".to_string())
                })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            JwtAlgorithm::RS256 => self.rs256_key(token).await?,
        };

        let algorithm = match self.algorithm {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::RS256 => Algorithm::RS256,
        };
        let mut validation = Validation::new(algorithm);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "iat"]);

        let data = decode::<serde_json::Value>(token, &key, &validation)
            .map_err(map_jwt_error)?;

        extract_claims(&data.claims)
    }

    /// Force a JWKS refetch on the next validation (key rotation).
    pub fn invalidate_jwks(&self) {
        *self.jwks.lock().unwrap() = None;
    }

    /// Resolve the RS256 decoding key for this token's `kid`, refreshing the
    /// JWKS cache when stale.
    async fn rs256_key(&self, token: &str) -> Result<DecodingKey> {
        let jwks_url = self.jwks_url.as_deref().ok_or_else(|| {
            ApiError::Unauthorized("JWT validation not configured".to_string())
        })?;

        let header = decode_header(token)
            .map_err(|_| ApiError::Unauthorized("Malformed token".to_string()))?;

        let stale = {
            let cache = self.jwks.lock().unwrap();
            match cache.as_ref() {
                Some(c) => c.fetched_at.elapsed() > JWKS_CACHE_TTL,
                None => true,
            }
        };

        if stale {
            debug!(url = jwks_url, "refreshing JWKS cache");
            let doc: JwksDocument = self
                .http
                .get(jwks_url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    warn!(error = %e, "JWKS fetch failed");
                    ApiError::Unauthorized("Unable to validate token".to_string())
                })?
                .json()
                .await
                .map_err(|_| ApiError::Unauthorized("Unable to validate token".to_string()))?;
            *self.jwks.lock().unwrap() = Some(CachedJwks {
                keys: doc.keys,
                fetched_at: Instant::now(),
            });
        }

        let cache = self.jwks.lock().unwrap();
        let keys = match cache.as_ref() {
            Some(cached) => &cached.keys,
            None => return Err(ApiError::Unauthorized("Unable to validate token".to_string())),
        };
        let key = match header.kid {
            Some(ref kid) => keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None => keys.first(),
        }
        .ok_or_else(|| ApiError::Unauthorized("Unknown signing key".to_string()))?;

        DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|_| ApiError::Unauthorized("Unable to validate token".to_string()))
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> ApiError {
    use jsonwebtoken::errors::ErrorKind;
    let message = match err.kind() {
        ErrorKind::ExpiredSignature => "Token has expired",
        ErrorKind::ImmatureSignature => "Token is not yet valid",
        ErrorKind::InvalidSignature => "Invalid token signature",
        ErrorKind::MissingRequiredClaim(_) => "Token missing required claim",
        _ => "Invalid token",
    };
    warn!(error = %err, "JWT validation failed");
    ApiError::Unauthorized(message.to_string())
}

fn extract_claims(raw: &serde_json::Value) -> Result<JwtClaims> {
    let user_id = raw
        .get("user_id")
        .or_else(|| raw.get("sub"))
        .ok_or_else(|| ApiError::Unauthorized("Token missing user_id claim".to_string()))?;

    let user_id = match user_id {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::Unauthorized("Invalid user_id in token".to_string()))?;

    let is_admin = match raw.get("is_admin") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => {
            matches!(s.to_lowercase().as_str(), "true" | "1" | "yes")
        }
        _ => false,
    };

    Ok(JwtClaims {
        user_id,
        is_admin,
        exp: raw.get("exp").and_then(|v| v.as_i64()).unwrap_or(0),
        iat: raw.get("iat").and_then(|v| v.as_i64()).unwrap_or(0),
        nbf: raw.get("nbf").and_then(|v| v.as_i64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    fn validator() -> JwtValidator {
        JwtValidator::new(&AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            jwks_url: None,
            algorithm: JwtAlgorithm::HS256,
        })
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encode")
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn extracts_user_and_admin_claims() {
        let token = sign(serde_json::json!({
            "user_id": 100001,
            "is_admin": true,
            "exp": now() + 600,
            "iat": now(),
        }));
        let claims = validator().validate(&token).await.expect("valid");
        assert_eq!(claims.user_id, 100001);
        assert!(claims.is_admin);
    }

    #[tokio::test]
    async fn accepts_bearer_prefix_and_sub_fallback() {
        let token = sign(serde_json::json!({
            "sub": "42",
            "exp": now() + 600,
            "iat": now(),
        }));
        let claims = validator()
            .validate(&format!("Bearer {token}"))
            .await
            .expect("valid");
        assert_eq!(claims.user_id, 42);
        assert!(!claims.is_admin);
    }

    #[tokio::test]
    async fn string_true_coerces_admin() {
        let token = sign(serde_json::json!({
            "user_id": 1,
            "is_admin": "true",
            "exp": now() + 600,
            "iat": now(),
        }));
        let claims = validator().validate(&token).await.expect("valid");
        assert!(claims.is_admin);
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized() {
        let token = sign(serde_json::json!({
            "user_id": 1,
            "exp": now() - 600,
            "iat": now() - 1200,
        }));
        let err = validator().validate(&token).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn missing_user_id_is_unauthorized() {
        let token = sign(serde_json::json!({
            "exp": now() + 600,
            "iat": now(),
        }));
        let err = validator().validate(&token).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn wrong_signature_is_unauthorized() {
        let token = encode(
            &Header::default(),
            &serde_json::json!({"user_id": 1, "exp": now() + 600, "iat": now()}),
            &EncodingKey::from_secret(b"some-other-secret"),
        )
        .expect("encode");
        let err = validator().validate(&token).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn missing_iat_is_rejected() {
        let token = sign(serde_json::json!({
            "user_id": 1,
            "exp": now() + 600,
        }));
        assert!(validator().validate(&token).await.is_err());
    }
}
