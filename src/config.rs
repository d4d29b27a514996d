// src/config.rs

use crate::error::NilaFederationError;
use crate::rules::{ClaimRule, RobotAccount};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Upper bound accepted for the clock skew tolerance.
pub const MAX_LEEWAY: Duration = Duration::from_secs(300);

/// Upper bound accepted for `max_staleness`; also caps any TTL a JWKS
/// response asks for.
pub const MAX_STALENESS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Upper bound accepted for `rotation_grace`.
pub const MAX_ROTATION_GRACE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How signing keys are cached, refreshed and retired.
#[derive(Debug, Clone)]
pub struct KeyCachePolicy {
    /// How long a fetched key set is considered fresh when the JWKS response
    /// carries no `Cache-Control: max-age`. Defaults to one hour.
    pub ttl: Duration,
    /// How long a key set may be served after its last successful fetch.
    /// Past this bound the provider is degraded and all its tokens are
    /// rejected. Defaults to 24 hours.
    pub max_staleness: Duration,
    /// How long a key dropped from the published set still verifies tokens.
    /// Defaults to 10 minutes.
    pub rotation_grace: Duration,
    /// Minimum spacing between refreshes triggered by cache misses.
    /// Defaults to 10 seconds.
    pub min_refresh_interval: Duration,
    /// Whether to run a per-provider background refresh loop.
    pub background_refresh: bool,
}

impl Default for KeyCachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_staleness: Duration::from_secs(24 * 60 * 60),
            rotation_grace: Duration::from_secs(10 * 60),
            min_refresh_interval: Duration::from_secs(10),
            background_refresh: true,
        }
    }
}

/// The main configuration for the federated identity verifier.
///
/// It should be constructed using the `VerifierConfigBuilder`.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// The audience this registry expects in `aud`, unless a provider
    /// overrides it.
    pub default_audience: String,
    /// The tolerance for clock skew when validating `exp` and `nbf`.
    /// Defaults to 60 seconds.
    pub leeway: Duration,
    /// Timeout applied to every discovery and JWKS request.
    pub fetch_timeout: Duration,
    /// Reject issuer and JWKS URLs that are not `https`.
    pub require_https: bool,
    pub key_cache: KeyCachePolicy,
}

/// A builder for creating a `VerifierConfig` instance.
#[derive(Default)]
pub struct VerifierConfigBuilder {
    default_audience: Option<String>,
    leeway: Option<Duration>,
    fetch_timeout: Option<Duration>,
    require_https: Option<bool>,
    key_cache: KeyCachePolicy,
}

impl VerifierConfigBuilder {
    /// Creates a new `VerifierConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expected audience, e.g. the registry host name. Required.
    pub fn default_audience(mut self, audience: impl Into<String>) -> Self {
        self.default_audience = Some(audience.into());
        self
    }

    /// Sets the clock skew tolerance. Defaults to 60 seconds.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.leeway = Some(leeway);
        self
    }

    /// Sets the timeout for discovery and JWKS requests. Defaults to 10 seconds.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Allows plain `http` issuer and JWKS URLs. Only meant for tests and
    /// local development.
    pub fn allow_insecure_http(mut self) -> Self {
        self.require_https = Some(false);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache.ttl = ttl;
        self
    }

    pub fn max_staleness(mut self, max_staleness: Duration) -> Self {
        self.key_cache.max_staleness = max_staleness;
        self
    }

    pub fn rotation_grace(mut self, grace: Duration) -> Self {
        self.key_cache.rotation_grace = grace;
        self
    }

    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.key_cache.min_refresh_interval = interval;
        self
    }

    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.key_cache.background_refresh = enabled;
        self
    }

    /// Consumes the builder and returns a `VerifierConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if `default_audience` is missing or empty, if the
    /// leeway exceeds [`MAX_LEEWAY`], if `max_staleness` or `rotation_grace`
    /// exceed [`MAX_STALENESS`] or [`MAX_ROTATION_GRACE`], or if
    /// `max_staleness` is shorter than the cache TTL.
    pub fn build(self) -> Result<VerifierConfig, NilaFederationError> {
        let default_audience = self
            .default_audience
            .filter(|aud| !aud.trim().is_empty())
            .ok_or_else(|| NilaFederationError::MissingConfiguration("default_audience".to_string()))?;

        let leeway = self.leeway.unwrap_or(Duration::from_secs(60));
        if leeway > MAX_LEEWAY {
            return Err(NilaFederationError::InvalidConfiguration(format!(
                "leeway of {:?} exceeds the maximum of {:?}",
                leeway, MAX_LEEWAY
            )));
        }
        if self.key_cache.max_staleness > MAX_STALENESS {
            return Err(NilaFederationError::InvalidConfiguration(format!(
                "max_staleness of {:?} exceeds the maximum of {:?}",
                self.key_cache.max_staleness, MAX_STALENESS
            )));
        }
        if self.key_cache.rotation_grace > MAX_ROTATION_GRACE {
            return Err(NilaFederationError::InvalidConfiguration(format!(
                "rotation_grace of {:?} exceeds the maximum of {:?}",
                self.key_cache.rotation_grace, MAX_ROTATION_GRACE
            )));
        }
        if self.key_cache.max_staleness < self.key_cache.ttl {
            return Err(NilaFederationError::InvalidConfiguration(
                "max_staleness must be at least as long as the cache ttl".to_string(),
            ));
        }

        Ok(VerifierConfig {
            default_audience,
            leeway,
            fetch_timeout: self.fetch_timeout.unwrap_or(Duration::from_secs(10)),
            require_https: self.require_https.unwrap_or(true),
            key_cache: self.key_cache,
        })
    }
}

/// Administrator configuration of one trusted identity provider.
///
/// The shape matches what an admin surface would store, so it can be loaded
/// from JSON or YAML:
///
/// ```yaml
/// id: github
/// issuer: https://token.actions.githubusercontent.com
/// audience: registry.example.com
/// robot_accounts:
///   - name: ci-pusher
///     permissions:
///       - repository: myorg/app
///         actions: [pull, push]
/// rules:
///   - id: main
///     robot_account: ci-pusher
///     claims:
///       repository: myorg/app
///       ref: { one_of: [refs/heads/main, refs/heads/release] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// The issuer URL exactly as it appears in the tokens' `iss` claim.
    pub issuer: String,
    /// Explicit JWKS endpoint. If `None`, it is discovered from the issuer's
    /// `.well-known/openid-configuration` document at registration.
    #[serde(default)]
    pub jwks_uri: Option<Url>,
    /// Overrides the verifier's default audience for this provider.
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub robot_accounts: Vec<RobotAccount>,
    /// Evaluated in order; the first rule whose conditions all hold wins.
    #[serde(default)]
    pub rules: Vec<ClaimRule>,
}

impl ProviderConfig {
    /// Parses the issuer as a URL, enforcing `https` when requested.
    pub fn issuer_url(&self, require_https: bool) -> Result<Url, NilaFederationError> {
        let url = Url::parse(&self.issuer).map_err(|e| NilaFederationError::InvalidUrl(format!("{}: {}", self.issuer, e)))?;
        ensure_scheme(&url, require_https)?;
        Ok(url)
    }
}

/// Rejects non-`https` URLs when `require_https` is set.
pub(crate) fn ensure_scheme(url: &Url, require_https: bool) -> Result<(), NilaFederationError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if !require_https => Ok(()),
        _ => Err(NilaFederationError::InsecureUrl(url.to_string())),
    }
}

/// A builder for creating a `ProviderConfig` in code.
#[derive(Default)]
pub struct ProviderConfigBuilder {
    id: Option<String>,
    issuer: Option<String>,
    jwks_uri: Option<Url>,
    audience: Option<String>,
    robot_accounts: Vec<RobotAccount>,
    rules: Vec<ClaimRule>,
}

impl ProviderConfigBuilder {
    /// Creates a new `ProviderConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider id. This is a required field.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the issuer URL. This is a required field.
    pub fn issuer(mut self, issuer: &str) -> Result<Self, NilaFederationError> {
        Url::parse(issuer).map_err(|e| NilaFederationError::InvalidUrl(e.to_string()))?;
        self.issuer = Some(issuer.to_string());
        Ok(self)
    }

    /// Sets an explicit JWKS URI, bypassing OIDC discovery. This is optional.
    pub fn jwks_uri(mut self, url: &str) -> Result<Self, NilaFederationError> {
        let parsed_url = Url::parse(url).map_err(|e| NilaFederationError::InvalidUrl(e.to_string()))?;
        self.jwks_uri = Some(parsed_url);
        Ok(self)
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn robot_account(mut self, account: RobotAccount) -> Self {
        self.robot_accounts.push(account);
        self
    }

    /// Appends a claim rule. Rules keep the order they are added in.
    pub fn rule(mut self, rule: ClaimRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Consumes the builder and returns a `ProviderConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` or `issuer` is missing.
    pub fn build(self) -> Result<ProviderConfig, NilaFederationError> {
        let id = self.id.ok_or(NilaFederationError::MissingConfiguration("id".to_string()))?;
        let issuer = self.issuer.ok_or(NilaFederationError::MissingConfiguration("issuer".to_string()))?;

        Ok(ProviderConfig {
            id,
            issuer,
            jwks_uri: self.jwks_uri,
            audience: self.audience,
            robot_accounts: self.robot_accounts,
            rules: self.rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_builder_applies_defaults() {
        let config = VerifierConfigBuilder::new()
            .default_audience("registry.example.com")
            .build()
            .unwrap();
        assert_eq!(config.leeway, Duration::from_secs(60));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert!(config.require_https);
        assert_eq!(config.key_cache.rotation_grace, Duration::from_secs(600));
    }

    #[test]
    fn verifier_builder_requires_audience() {
        let result = VerifierConfigBuilder::new().default_audience("  ").build();
        assert!(matches!(result, Err(NilaFederationError::MissingConfiguration(field)) if field == "default_audience"));
    }

    #[test]
    fn verifier_builder_rejects_large_leeway_and_short_staleness() {
        let leeway = VerifierConfigBuilder::new()
            .default_audience("reg")
            .leeway(Duration::from_secs(3600))
            .build();
        assert!(matches!(leeway, Err(NilaFederationError::InvalidConfiguration(_))));

        let staleness = VerifierConfigBuilder::new()
            .default_audience("reg")
            .cache_ttl(Duration::from_secs(120))
            .max_staleness(Duration::from_secs(60))
            .build();
        assert!(matches!(staleness, Err(NilaFederationError::InvalidConfiguration(_))));
    }

    #[test]
    fn verifier_builder_bounds_cache_durations() {
        let unbounded = VerifierConfigBuilder::new()
            .default_audience("reg")
            .max_staleness(Duration::MAX)
            .build();
        assert!(matches!(unbounded, Err(NilaFederationError::InvalidConfiguration(_))));

        let grace = VerifierConfigBuilder::new()
            .default_audience("reg")
            .rotation_grace(Duration::MAX)
            .build();
        assert!(matches!(grace, Err(NilaFederationError::InvalidConfiguration(_))));

        let at_limit = VerifierConfigBuilder::new()
            .default_audience("reg")
            .max_staleness(MAX_STALENESS)
            .rotation_grace(MAX_ROTATION_GRACE)
            .build();
        assert!(at_limit.is_ok());
    }

    #[test]
    fn provider_issuer_must_be_https_when_required() {
        let config = ProviderConfigBuilder::new()
            .id("local")
            .issuer("http://localhost:8080")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(config.issuer_url(true), Err(NilaFederationError::InsecureUrl(_))));
        assert!(config.issuer_url(false).is_ok());
    }

    #[test]
    fn provider_config_loads_from_yaml() {
        let yaml = r#"
id: gitlab
issuer: https://gitlab.example.com
robot_accounts:
  - name: deployer
    permissions:
      - repository: platform/api
        actions: [pull, push]
rules:
  - id: protected
    robot_account: deployer
    claims:
      project_path: platform/api
      ref_protected: "true"
"#;
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.id, "gitlab");
        assert!(config.jwks_uri.is_none());
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].claims.len(), 2);
    }
}
