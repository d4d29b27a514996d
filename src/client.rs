// src/client.rs

use crate::config::ensure_scheme;
use crate::error::NilaFederationError;
use crate::keys::SigningKey;
use crate::model::{JsonWebKeySet, OidcDiscoveryDocument};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// The key set returned by one successful JWKS fetch.
#[derive(Debug)]
pub struct FetchedKeySet {
    pub keys: Vec<SigningKey>,
    /// `Cache-Control: max-age` of the response, if any.
    pub max_age: Option<Duration>,
}

/// An HTTP client for OIDC discovery and JWKS retrieval.
#[derive(Clone)]
pub struct JwksClient {
    // The client is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    require_https: bool,
}

impl JwksClient {
    /// Creates a new `JwksClient` whose requests are bounded by `fetch_timeout`.
    pub fn new(fetch_timeout: Duration, require_https: bool) -> Result<Self, NilaFederationError> {
        let http_client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .connect_timeout(fetch_timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner { http_client, require_https }),
        })
    }

    pub fn require_https(&self) -> bool {
        self.inner.require_https
    }

    /// Resolves the JWKS URI of an issuer through its discovery document.
    ///
    /// The document's own `issuer` must name the same issuer, otherwise the
    /// discovery is refused.
    #[instrument(skip(self), err)]
    pub async fn discover_jwks_uri(&self, issuer: &str) -> Result<Url, NilaFederationError> {
        let discovery_url = discovery_url(issuer)?;
        ensure_scheme(&discovery_url, self.inner.require_https)?;

        debug!("Performing OIDC discovery at: {}", discovery_url);
        let discovery_fail = |reason: String| NilaFederationError::Discovery {
            issuer: issuer.to_string(),
            reason,
        };
        let response = self
            .inner
            .http_client
            .get(discovery_url.clone())
            .send()
            .await
            .map_err(|e| discovery_fail(e.to_string()))?;
        if !response.status().is_success() {
            return Err(discovery_fail(format!("HTTP {} from {}", response.status().as_u16(), discovery_url)));
        }
        let discovery_doc: OidcDiscoveryDocument = response.json().await.map_err(|e| discovery_fail(e.to_string()))?;

        if normalize_issuer(&discovery_doc.issuer) != normalize_issuer(issuer) {
            return Err(discovery_fail(format!("document names issuer '{}'", discovery_doc.issuer)));
        }

        let jwks_uri = Url::parse(&discovery_doc.jwks_uri).map_err(|e| discovery_fail(format!("invalid jwks_uri: {}", e)))?;
        ensure_scheme(&jwks_uri, self.inner.require_https)?;
        debug!("Discovered JWKS URI: {}", jwks_uri);
        Ok(jwks_uri)
    }

    /// Fetches and converts the provider's published signing keys.
    ///
    /// Keys that cannot be used (symmetric, encryption, unsupported curves)
    /// are skipped with a warning instead of failing the whole set.
    #[instrument(skip(self), err)]
    pub async fn fetch_key_set(&self, provider_id: &str, jwks_uri: &Url) -> Result<FetchedKeySet, NilaFederationError> {
        let response = self.inner.http_client.get(jwks_uri.clone()).send().await?;
        if !response.status().is_success() {
            return Err(NilaFederationError::HttpStatus {
                url: jwks_uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        let max_age = parse_cache_control(response.headers());
        let jwks: JsonWebKeySet = response.json().await?;

        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match SigningKey::from_jwk(provider_id, jwk) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(provider = provider_id, kid = ?jwk.kid, "Skipping unusable JWK: {}", e),
            }
        }

        debug!("Fetched {} usable keys (max-age: {:?})", keys.len(), max_age);
        Ok(FetchedKeySet { keys, max_age })
    }
}

/// Strips one trailing `/` so `https://issuer/` and `https://issuer` compare equal.
pub fn normalize_issuer(issuer: &str) -> &str {
    issuer.strip_suffix('/').unwrap_or(issuer)
}

/// `{issuer}/.well-known/openid-configuration`, keeping any issuer path.
pub fn discovery_url(issuer: &str) -> Result<Url, NilaFederationError> {
    let raw = format!("{}/.well-known/openid-configuration", normalize_issuer(issuer));
    Url::parse(&raw).map_err(|e| NilaFederationError::InvalidUrl(e.to_string()))
}

/// Parses the `Cache-Control` header to determine the TTL.
fn parse_cache_control(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}
