// src/verifier.rs

use crate::cache::{JwksCache, KeySetStatus};
use crate::client::JwksClient;
use crate::config::{ProviderConfig, VerifierConfig};
use crate::error::{NilaFederationError, Rejection};
use crate::registry::{IdentityProvider, IssuerRegistry};
use crate::rules::{self, ClaimRule, FederatedRobotAccount};
use crate::token;
use crate::validator::Validator;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The outcome of one `authenticate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Authorized { robot_account: Arc<FederatedRobotAccount> },
    Rejected { reason: Rejection },
}

impl VerificationResult {
    pub fn is_authorized(&self) -> bool {
        matches!(self, VerificationResult::Authorized { .. })
    }

    pub fn robot_account(&self) -> Option<&FederatedRobotAccount> {
        match self {
            VerificationResult::Authorized { robot_account } => Some(robot_account),
            VerificationResult::Rejected { .. } => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            VerificationResult::Rejected { reason } => Some(reason),
            VerificationResult::Authorized { .. } => None,
        }
    }
}

/// The entry point for the registry's authentication middleware.
///
/// Owns the issuer registry and the key cache and composes parsing,
/// signature/claim validation and rule matching into a single decision.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FederatedVerifier {
    inner: Arc<Inner>,
}

struct Inner {
    config: VerifierConfig,
    registry: Arc<IssuerRegistry>,
    keys: Arc<JwksCache>,
    validator: Validator,
}

impl FederatedVerifier {
    /// Creates a verifier with no providers registered.
    pub fn new(config: VerifierConfig) -> Result<Self, NilaFederationError> {
        let client = JwksClient::new(config.fetch_timeout, config.require_https)?;
        let registry = Arc::new(IssuerRegistry::new(client.clone()));
        let keys = Arc::new(JwksCache::new(client, config.key_cache.clone()));
        let validator = Validator::new(Arc::clone(&registry), Arc::clone(&keys), config.leeway);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                keys,
                validator,
            }),
        })
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &IssuerRegistry {
        &self.inner.registry
    }

    /// Authenticates a bearer token.
    ///
    /// Parses, validates and matches strictly in that order and stops at the
    /// first failure. Nothing is retried. The rejection reason is logged for
    /// operators; callers should answer clients with
    /// [`Rejection::client_message`].
    #[instrument(skip_all)]
    pub async fn authenticate(&self, raw_token: &str) -> VerificationResult {
        match self.try_authenticate(raw_token).await {
            Ok(robot_account) => {
                info!(
                    provider = %robot_account.provider_id,
                    rule = %robot_account.rule_id,
                    robot_account = %robot_account.name,
                    "Federated token authorized"
                );
                VerificationResult::Authorized { robot_account }
            }
            Err(reason) => {
                warn!(code = reason.code(), "Federated token rejected: {}", reason);
                VerificationResult::Rejected { reason }
            }
        }
    }

    async fn try_authenticate(&self, raw_token: &str) -> Result<Arc<FederatedRobotAccount>, Rejection> {
        let parsed = token::parse(raw_token)?;
        let verified = self
            .inner
            .validator
            .validate(&parsed, &self.inner.config.default_audience)
            .await?;
        rules::match_claims(&verified.provider, &verified.claims)
    }

    /// Registers a provider and performs its first key fetch.
    ///
    /// Discovery failure fails the registration. A failed first key fetch is
    /// only logged; the provider stays unavailable until a refresh succeeds.
    #[instrument(skip(self, config), fields(provider = %config.id), err)]
    pub async fn register_provider(&self, config: ProviderConfig) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        let provider = self.inner.registry.register(config).await?;
        self.inner.keys.track(&provider);
        if let Err(e) = self.inner.keys.refresh(&provider).await {
            warn!("Initial JWKS fetch failed, provider unavailable until refresh succeeds: {}", e);
        }
        Ok(provider)
    }

    /// Replaces a provider's configuration. Keys are re-fetched when its JWKS
    /// URI changed.
    #[instrument(skip(self, config), fields(provider = %config.id), err)]
    pub async fn update_provider(&self, config: ProviderConfig) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        let provider = self.inner.registry.update(config).await?;
        if self.inner.keys.track(&provider) {
            if let Err(e) = self.inner.keys.refresh(&provider).await {
                warn!("JWKS fetch after update failed: {}", e);
            }
        }
        Ok(provider)
    }

    pub fn replace_rules(&self, provider_id: &str, rules: Vec<ClaimRule>) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        self.inner.registry.replace_rules(provider_id, rules)
    }

    /// Removes a provider and drops its cached keys.
    pub fn remove_provider(&self, provider_id: &str) -> bool {
        let removed = self.inner.registry.remove(provider_id).is_some();
        self.inner.keys.untrack(provider_id);
        removed
    }

    /// Fetches a provider's keys now, sharing any fetch already in flight.
    pub async fn refresh_keys(&self, provider_id: &str) -> Result<usize, NilaFederationError> {
        let provider = self
            .inner
            .registry
            .get(provider_id)
            .ok_or_else(|| NilaFederationError::UnknownProvider(provider_id.to_string()))?;
        self.inner.keys.refresh(&provider).await
    }

    pub fn key_status(&self, provider_id: &str) -> Option<KeySetStatus> {
        self.inner.keys.status(provider_id)
    }
}
