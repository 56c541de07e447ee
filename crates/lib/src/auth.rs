//! Inbound request authentication: validate the channel's bearer JWT.
//!
//! Signing keys come from a [`KeySource`]: the OpenID metadata of the messaging backend by
//! default, or a shared HMAC secret when `auth.signingSecret` is configured.

use crate::activity::Activity;
use crate::config::AuthConfig;
use crate::credentials::Credential;
use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Clock skew tolerated on `exp`/`nbf`.
const CLOCK_LEEWAY_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not a bearer token")]
    NotBearer,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("no signing key for kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("token serviceurl claim {claim:?} does not match activity serviceUrl {activity:?}")]
    ServiceUrlMismatch {
        claim: String,
        activity: Option<String>,
    },
    #[error("fetching signing keys failed: {0}")]
    KeyFetch(String),
}

/// Claims read from channel tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelClaims {
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Service URL the channel bound the token to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serviceurl: Option<String>,
}

/// Verifies the Authorization header of an inbound activity.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate(&self, header: Option<&str>, activity: &Activity)
        -> Result<(), AuthError>;
}

/// Provides the key (and algorithm) that signed a token.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn decoding_key(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), AuthError>;
}

/// Shared-secret (HS256) keys, selected by `auth.signingSecret`.
pub struct StaticKeySource {
    secret: Vec<u8>,
}

impl StaticKeySource {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn decoding_key(&self, _kid: Option<&str>) -> Result<(DecodingKey, Algorithm), AuthError> {
        Ok((DecodingKey::from_secret(&self.secret), Algorithm::HS256))
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdMetadata {
    jwks_uri: String,
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Keys published through an OpenID metadata document (`jwks_uri`).
///
/// The key set is kept in memory and re-read after `refresh`, or when a token names an
/// unknown `kid` (key rollover) and the last read is older than `unknown_kid_cooldown`.
/// Re-reads happen under the write lock, so concurrent misses share one fetch.
pub struct OpenIdKeySource {
    metadata_url: String,
    refresh: Duration,
    unknown_kid_cooldown: Duration,
    client: reqwest::Client,
    cache: RwLock<Option<CachedKeys>>,
}

impl OpenIdKeySource {
    pub fn new(auth: &AuthConfig, client: reqwest::Client) -> Self {
        Self {
            metadata_url: auth.openid_metadata_url.trim().to_string(),
            refresh: Duration::from_secs(auth.key_refresh_secs),
            unknown_kid_cooldown: Duration::from_secs(auth.unknown_kid_cooldown_secs),
            client,
            cache: RwLock::new(None),
        }
    }

    /// Answer from the cache, or `None` when the keys must be re-read.
    fn from_cache(
        &self,
        cached: Option<&CachedKeys>,
        kid: Option<&str>,
    ) -> Option<Result<(DecodingKey, Algorithm), AuthError>> {
        let cached = cached?;
        let age = cached.fetched_at.elapsed();
        if age >= self.refresh {
            return None;
        }
        match Self::lookup(&cached.keys, kid) {
            Some(found) => Some(Ok(found)),
            None if age < self.unknown_kid_cooldown => {
                Some(Err(AuthError::UnknownKey(kid.map(str::to_string))))
            }
            None => None,
        }
    }

    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        let metadata: OpenIdMetadata = self.get_json(&self.metadata_url).await?;
        let keys: JwkSet = self.get_json(&metadata.jwks_uri).await?;
        log::info!(
            "loaded {} signing key(s) from {}",
            keys.keys.len(),
            metadata.jwks_uri
        );
        Ok(keys)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, AuthError> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::KeyFetch(format!("{} {}: {}", url, status, body)));
        }
        res.json()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))
    }

    fn lookup(keys: &JwkSet, kid: Option<&str>) -> Option<(DecodingKey, Algorithm)> {
        let jwk = match kid {
            Some(kid) => keys.find(kid)?,
            None => keys.keys.first()?,
        };
        let key = DecodingKey::from_jwk(jwk).ok()?;
        let alg = jwk
            .common
            .key_algorithm
            .as_ref()
            .and_then(signing_algorithm)
            .unwrap_or(Algorithm::RS256);
        Some((key, alg))
    }
}

fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

#[async_trait]
impl KeySource for OpenIdKeySource {
    async fn decoding_key(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), AuthError> {
        let cached = self.from_cache(self.cache.read().await.as_ref(), kid);
        if let Some(answer) = cached {
            return answer;
        }
        let mut cache = self.cache.write().await;
        // Another request may have refreshed the keys while this one waited for the lock.
        if let Some(answer) = self.from_cache(cache.as_ref(), kid) {
            return answer;
        }
        let keys = self.fetch_keys().await?;
        let found = Self::lookup(&keys, kid);
        *cache = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        found.ok_or_else(|| AuthError::UnknownKey(kid.map(str::to_string)))
    }
}

/// JWT validation against the resolved credential (audience = app id).
pub struct JwtAuthenticator {
    credential: Arc<Credential>,
    issuer: String,
    keys: Arc<dyn KeySource>,
}

impl JwtAuthenticator {
    pub fn new(credential: Arc<Credential>, issuer: impl Into<String>, keys: Arc<dyn KeySource>) -> Self {
        Self {
            credential,
            issuer: issuer.into(),
            keys,
        }
    }

    fn bearer(header: Option<&str>) -> Result<&str, AuthError> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(AuthError::MissingHeader)?;
        let (scheme, token) = header.split_once(' ').ok_or(AuthError::NotBearer)?;
        if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
            return Err(AuthError::NotBearer);
        }
        Ok(token.trim())
    }
}

#[async_trait]
impl RequestAuthenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        header: Option<&str>,
        activity: &Activity,
    ) -> Result<(), AuthError> {
        let Some(app_id) = self.credential.app_id() else {
            return Ok(());
        };
        let token = Self::bearer(header)?;
        let kid = decode_header(token)?.kid;
        let (key, alg) = self.keys.decoding_key(kid.as_deref()).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = CLOCK_LEEWAY_SECS;
        validation.validate_nbf = true;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[app_id]);
        let data = decode::<ChannelClaims>(token, &key, &validation)?;

        if let Some(claim) = data.claims.serviceurl {
            let matches = activity
                .service_url
                .as_deref()
                .is_some_and(|url| url.trim_end_matches('/') == claim.trim_end_matches('/'));
            if !matches {
                return Err(AuthError::ServiceUrlMismatch {
                    claim,
                    activity: activity.service_url.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Authenticator for the resolved credential. Anonymous mode accepts every request.
pub fn authenticator_for(
    credential: Arc<Credential>,
    auth: &AuthConfig,
    client: reqwest::Client,
) -> Arc<dyn RequestAuthenticator> {
    let keys: Arc<dyn KeySource> = match auth.signing_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => {
            log::info!("validating inbound tokens with the configured shared secret");
            Arc::new(StaticKeySource::new(secret.as_bytes()))
        }
        None => Arc::new(OpenIdKeySource::new(auth, client)),
    };
    Arc::new(JwtAuthenticator::new(credential, auth.issuer.clone(), keys))
}
