//! Bearer-token verification against an Entra-style issuer.
//!
//! The verifier resolves signing keys from the issuer's discovery endpoint
//! (`{issuer}/discovery/keys`), caches them per issuer with a TTL, and
//! verifies RS256 signatures together with the exp/nbf/iat/aud/iss claims.
//! With validation disabled every request passes with an anonymous
//! identity, independent of token content.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Verified identity attributes. Read-only, discarded at request end.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Claims {
    pub fn anonymous() -> Self {
        Claims {
            sub: "anonymous".to_string(),
            name: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,
    /// Any verification failure, including expiry. Collapsed to one
    /// outward signal so callers cannot probe which check failed.
    #[error("invalid authorization token")]
    InvalidToken,
    /// Validation enabled but issuer/audience unset or key resolution
    /// impossible. Maps to a 500-class response, not a 401.
    #[error("token verification misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: String,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    keys: Vec<Jwk>,
    expires_at: Instant,
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    let raw = header?;
    let mut parts = raw.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") || parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// Validates bearer credentials against the configured issuer. Shared
/// read-only across concurrent requests; the key cache is the only
/// interior mutability and is safe under concurrent first access.
pub struct TokenVerifier {
    enabled: bool,
    issuer: Option<String>,
    audience: Option<String>,
    cache_ttl: Duration,
    client: reqwest::Client,
    // Keyed by issuer; keys rotate infrequently so resolution is cached
    // process-wide with an explicit invalidation path.
    jwks_cache: DashMap<String, CachedKeys>,
}

impl TokenVerifier {
    pub fn new(
        enabled: bool,
        issuer: Option<String>,
        audience: Option<String>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            enabled,
            issuer,
            audience,
            cache_ttl,
            client,
            jwks_cache: DashMap::new(),
        })
    }

    /// Drop cached signing keys, forcing re-resolution on the next verify.
    pub fn invalidate_keys(&self) {
        self.jwks_cache.clear();
    }

    /// Verify a bearer credential. `None` means no Authorization header was
    /// presented.
    pub async fn verify(&self, token: Option<&str>) -> Result<Claims, AuthError> {
        if !self.enabled {
            tracing::debug!("token validation disabled, using anonymous identity");
            return Ok(Claims::anonymous());
        }
        let token = token.ok_or(AuthError::MissingToken)?;
        let issuer = self
            .issuer
            .as_deref()
            .ok_or_else(|| AuthError::Misconfigured("ENTRA_ISSUER not configured".into()))?;
        let audience = self
            .audience
            .as_deref()
            .ok_or_else(|| AuthError::Misconfigured("ENTRA_AUDIENCE not configured".into()))?;

        let header = jsonwebtoken::decode_header(token).map_err(|err| {
            tracing::warn!(error = %err, "unparseable token header");
            AuthError::InvalidToken
        })?;
        let kid = header.kid.ok_or_else(|| {
            tracing::warn!("token missing kid header");
            AuthError::InvalidToken
        })?;

        let jwk = match self.find_key(issuer, &kid).await? {
            Some(jwk) => jwk,
            None => {
                // Key rotation may have outrun the cache; refresh once.
                self.jwks_cache.remove(issuer);
                self.find_key(issuer, &kid).await?.ok_or_else(|| {
                    tracing::warn!("no signing key matches token kid");
                    AuthError::InvalidToken
                })?
            }
        };
        let key = decoding_key(&jwk)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iat"]);
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);

        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(|err| {
            tracing::warn!(error_kind = ?err.kind(), "token verification failed");
            AuthError::InvalidToken
        })?;
        Ok(data.claims)
    }

    async fn find_key(&self, issuer: &str, kid: &str) -> Result<Option<Jwk>, AuthError> {
        self.ensure_keys(issuer).await?;
        Ok(self
            .jwks_cache
            .get(issuer)
            .and_then(|cached| cached.keys.iter().find(|k| k.kid == kid).cloned()))
    }

    async fn ensure_keys(&self, issuer: &str) -> Result<(), AuthError> {
        if let Some(cached) = self.jwks_cache.get(issuer) {
            if cached.expires_at > Instant::now() {
                return Ok(());
            }
        }
        let uri = format!("{}/discovery/keys", issuer.trim_end_matches('/'));
        let response = self.client.get(&uri).send().await.map_err(|err| {
            AuthError::Misconfigured(format!("jwks fetch error: {err}"))
        })?;
        if !response.status().is_success() {
            return Err(AuthError::Misconfigured(format!(
                "jwks fetch status: {}",
                response.status()
            )));
        }
        let set: JwkSet = response
            .json()
            .await
            .map_err(|err| AuthError::Misconfigured(format!("jwks decode error: {err}")))?;
        self.jwks_cache.insert(
            issuer.to_string(),
            CachedKeys {
                keys: set.keys,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Ok(())
    }
}

fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    if jwk.kty != "RSA" {
        tracing::warn!(kty = %jwk.kty, "unsupported jwk key type");
        return Err(AuthError::InvalidToken);
    }
    let n = jwk.n.as_ref().ok_or(AuthError::InvalidToken)?;
    let e = jwk.e.as_ref().ok_or(AuthError::InvalidToken)?;
    DecodingKey::from_rsa_components(n, e).map_err(|err| {
        tracing::warn!(error = %err, "failed to build rsa key from jwk");
        AuthError::InvalidToken
    })
}
