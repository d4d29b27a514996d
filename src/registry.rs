// src/registry.rs

use crate::client::{discovery_url, normalize_issuer, JwksClient};
use crate::config::{ensure_scheme, ProviderConfig};
use crate::error::NilaFederationError;
use crate::rules::{ClaimRule, CompiledRule, FederatedRobotAccount};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, instrument};
use url::Url;

/// A registered trust relationship with one external identity provider.
///
/// Snapshots are immutable: an administrative edit builds a new
/// `IdentityProvider` and swaps it into the registry, so a verification
/// already holding the old one finishes against the old configuration.
#[derive(Debug)]
pub struct IdentityProvider {
    pub id: String,
    /// The issuer as configured; tokens select this provider through `iss`.
    pub issuer: String,
    pub discovery_url: Url,
    /// Explicit or discovered at registration.
    pub jwks_uri: Url,
    pub audience: Option<String>,
    /// In evaluation order.
    pub rules: Vec<CompiledRule>,
    config: ProviderConfig,
}

impl IdentityProvider {
    /// The configuration this snapshot was built from.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The audience to demand, falling back to the verifier-wide default.
    pub fn expected_audience<'a>(&'a self, default_audience: &'a str) -> &'a str {
        self.audience.as_deref().unwrap_or(default_audience)
    }

    fn build(config: ProviderConfig, discovery_url: Url, jwks_uri: Url) -> Result<Self, NilaFederationError> {
        let rules = compile_rules(&config)?;
        Ok(Self {
            id: config.id.clone(),
            issuer: config.issuer.clone(),
            discovery_url,
            jwks_uri,
            audience: config.audience.clone(),
            rules,
            config,
        })
    }
}

fn compile_rules(config: &ProviderConfig) -> Result<Vec<CompiledRule>, NilaFederationError> {
    let mut seen = HashSet::new();
    config
        .rules
        .iter()
        .map(|rule| {
            if !seen.insert(rule.id.as_str()) {
                return Err(NilaFederationError::InvalidConfiguration(format!(
                    "provider '{}' declares rule '{}' twice",
                    config.id, rule.id
                )));
            }
            if rule.claims.is_empty() {
                return Err(NilaFederationError::InvalidConfiguration(format!(
                    "rule '{}' has no claim conditions",
                    rule.id
                )));
            }
            let robot = config
                .robot_accounts
                .iter()
                .find(|account| account.name == rule.robot_account)
                .ok_or_else(|| NilaFederationError::UnknownRobotAccount {
                    rule: rule.id.clone(),
                    robot_account: rule.robot_account.clone(),
                })?;
            Ok(CompiledRule {
                rule: rule.clone(),
                account: Arc::new(FederatedRobotAccount {
                    name: robot.name.clone(),
                    permissions: robot.permissions.clone(),
                    provider_id: config.id.clone(),
                    rule_id: rule.id.clone(),
                }),
            })
        })
        .collect()
}

/// Fails if a provider other than `replacing` already uses `id` or `issuer`.
fn check_unique(
    providers: &HashMap<String, Arc<IdentityProvider>>,
    id: &str,
    issuer: &str,
    replacing: Option<&str>,
) -> Result<(), NilaFederationError> {
    let others = providers.values().filter(|p| Some(p.id.as_str()) != replacing);
    for existing in others {
        if existing.id == id {
            return Err(NilaFederationError::DuplicateProvider(id.to_string()));
        }
        if normalize_issuer(&existing.issuer) == normalize_issuer(issuer) {
            return Err(NilaFederationError::DuplicateProvider(issuer.to_string()));
        }
    }
    Ok(())
}

/// Holds every configured provider, keyed by normalised issuer.
pub struct IssuerRegistry {
    client: JwksClient,
    providers: RwLock<HashMap<String, Arc<IdentityProvider>>>,
}

impl IssuerRegistry {
    pub fn new(client: JwksClient) -> Self {
        Self {
            client,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Finds the provider for an issuer. Issuers compare after dropping one
    /// trailing `/`.
    pub fn lookup(&self, issuer: &str) -> Option<Arc<IdentityProvider>> {
        self.read().get(normalize_issuer(issuer)).cloned()
    }

    /// Finds a provider by its id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<IdentityProvider>> {
        self.read().values().find(|p| p.id == provider_id).cloned()
    }

    pub fn providers(&self) -> Vec<Arc<IdentityProvider>> {
        let mut providers: Vec<_> = self.read().values().cloned().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// Registers a new provider, running OpenID discovery when no JWKS URI is
    /// configured. Discovery failure fails the registration.
    #[instrument(skip(self, config), fields(provider = %config.id, issuer = %config.issuer), err)]
    pub async fn register(&self, config: ProviderConfig) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        self.ensure_unique(&config, None)?;
        let provider = Arc::new(self.resolve(config, None).await?);

        let mut providers = self.write();
        // Re-check under the lock; discovery ran without it.
        check_unique(&providers, &provider.id, &provider.issuer, None)?;
        providers.insert(normalize_issuer(&provider.issuer).to_string(), Arc::clone(&provider));
        info!(jwks_uri = %provider.jwks_uri, rules = provider.rules.len(), "Identity provider registered");
        Ok(provider)
    }

    /// Replaces the configuration of an existing provider (matched by id).
    ///
    /// Discovery runs again only when the issuer changed and no explicit JWKS
    /// URI is given.
    #[instrument(skip(self, config), fields(provider = %config.id), err)]
    pub async fn update(&self, config: ProviderConfig) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        let previous = self
            .get(&config.id)
            .ok_or_else(|| NilaFederationError::UnknownProvider(config.id.clone()))?;
        self.ensure_unique(&config, Some(&previous.id))?;
        let provider = Arc::new(self.resolve(config, Some(&previous)).await?);

        let mut providers = self.write();
        // Discovery ran without the lock: the provider may have been removed,
        // or its new issuer claimed, in the meantime.
        if !providers.values().any(|p| p.id == provider.id) {
            return Err(NilaFederationError::UnknownProvider(provider.id.clone()));
        }
        check_unique(&providers, &provider.id, &provider.issuer, Some(&provider.id))?;
        providers.retain(|_, p| p.id != provider.id);
        providers.insert(normalize_issuer(&provider.issuer).to_string(), Arc::clone(&provider));
        info!(jwks_uri = %provider.jwks_uri, "Identity provider updated");
        Ok(provider)
    }

    /// Swaps the claim rules of a provider, keeping everything else.
    pub fn replace_rules(&self, provider_id: &str, rules: Vec<ClaimRule>) -> Result<Arc<IdentityProvider>, NilaFederationError> {
        let mut providers = self.write();
        let (key, current) = providers
            .iter()
            .find(|(_, p)| p.id == provider_id)
            .map(|(key, p)| (key.clone(), Arc::clone(p)))
            .ok_or_else(|| NilaFederationError::UnknownProvider(provider_id.to_string()))?;

        let mut config = current.config.clone();
        config.rules = rules;
        let provider = Arc::new(IdentityProvider::build(
            config,
            current.discovery_url.clone(),
            current.jwks_uri.clone(),
        )?);
        providers.insert(key, Arc::clone(&provider));
        info!(provider = provider_id, rules = provider.rules.len(), "Claim rules replaced");
        Ok(provider)
    }

    pub fn remove(&self, provider_id: &str) -> Option<Arc<IdentityProvider>> {
        let mut providers = self.write();
        let key = providers.iter().find(|(_, p)| p.id == provider_id).map(|(key, _)| key.clone())?;
        let removed = providers.remove(&key);
        info!(provider = provider_id, "Identity provider removed");
        removed
    }

    fn ensure_unique(&self, config: &ProviderConfig, replacing: Option<&str>) -> Result<(), NilaFederationError> {
        check_unique(&self.read(), &config.id, &config.issuer, replacing)
    }

    async fn resolve(
        &self,
        config: ProviderConfig,
        previous: Option<&IdentityProvider>,
    ) -> Result<IdentityProvider, NilaFederationError> {
        config.issuer_url(self.client.require_https())?;
        // Validate rules before any network work.
        compile_rules(&config)?;
        let discovery_url = discovery_url(&config.issuer)?;

        let jwks_uri = match (&config.jwks_uri, previous) {
            (Some(uri), _) => {
                ensure_scheme(uri, self.client.require_https())?;
                uri.clone()
            }
            (None, Some(prev)) if prev.config.jwks_uri.is_none() && prev.issuer == config.issuer => prev.jwks_uri.clone(),
            (None, _) => self.client.discover_jwks_uri(&config.issuer).await?,
        };
        IdentityProvider::build(config, discovery_url, jwks_uri)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<IdentityProvider>>> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<IdentityProvider>>> {
        self.providers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfigBuilder;
    use crate::rules::{ClaimPredicate, RobotAccount};
    use std::time::Duration;

    fn registry() -> IssuerRegistry {
        IssuerRegistry::new(JwksClient::new(Duration::from_secs(1), true).unwrap())
    }

    fn github(id: &str) -> ProviderConfig {
        ProviderConfigBuilder::new()
            .id(id)
            .issuer("https://token.actions.githubusercontent.com")
            .unwrap()
            .jwks_uri("https://token.actions.githubusercontent.com/.well-known/jwks")
            .unwrap()
            .robot_account(RobotAccount::new("R1"))
            .rule(ClaimRule::new("repo", "R1").require("repository", ClaimPredicate::equals("myorg/myrepo")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn explicit_jwks_uri_skips_discovery() {
        let registry = registry();
        let provider = registry.register(github("github")).await.unwrap();
        assert_eq!(provider.jwks_uri.as_str(), "https://token.actions.githubusercontent.com/.well-known/jwks");
        assert_eq!(provider.rules[0].account.rule_id, "repo");

        let found = registry.lookup("https://token.actions.githubusercontent.com/").unwrap();
        assert_eq!(found.id, "github");
        assert!(registry.lookup("https://gitlab.com").is_none());
    }

    #[tokio::test]
    async fn issuer_and_id_are_unique() {
        let registry = registry();
        registry.register(github("github")).await.unwrap();
        let duplicate = registry.register(github("github-2")).await;
        assert!(matches!(duplicate, Err(NilaFederationError::DuplicateProvider(_))));
    }

    #[tokio::test]
    async fn rules_must_reference_declared_accounts() {
        let config = ProviderConfigBuilder::new()
            .id("github")
            .issuer("https://token.actions.githubusercontent.com")
            .unwrap()
            .jwks_uri("https://token.actions.githubusercontent.com/.well-known/jwks")
            .unwrap()
            .rule(ClaimRule::new("repo", "ghost").require("repository", ClaimPredicate::equals("a/b")))
            .build()
            .unwrap();
        let result = registry().register(config).await;
        assert!(matches!(result, Err(NilaFederationError::UnknownRobotAccount { .. })));
    }

    #[tokio::test]
    async fn replace_rules_swaps_snapshot() {
        let registry = registry();
        let before = registry.register(github("github")).await.unwrap();
        let after = registry
            .replace_rules(
                "github",
                vec![ClaimRule::new("owner", "R1").require("repository_owner", ClaimPredicate::equals("myorg"))],
            )
            .unwrap();
        assert_eq!(before.rules[0].rule.id, "repo");
        assert_eq!(after.rules[0].rule.id, "owner");
        assert_eq!(registry.lookup(&after.issuer).unwrap().rules[0].rule.id, "owner");

        assert!(registry.remove("github").is_some());
        assert!(registry.lookup(&after.issuer).is_none());
        assert!(matches!(
            registry.replace_rules("github", Vec::new()),
            Err(NilaFederationError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn update_rechecks_issuer_after_discovery() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "issuer": server.uri(),
                        "jwks_uri": format!("{}/keys", server.uri()),
                    }))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let registry = IssuerRegistry::new(JwksClient::new(Duration::from_secs(2), false).unwrap());
        registry.register(github("github")).await.unwrap();

        // Move "github" to the mock issuer (discovery is slow) while "local"
        // claims that issuer with an explicit JWKS URI.
        let mut moved = github("github");
        moved.issuer = server.uri();
        moved.jwks_uri = None;
        let mut local = github("local");
        local.issuer = server.uri();
        local.jwks_uri = Some(format!("{}/keys", server.uri()).parse().unwrap());

        let (updated, registered) = tokio::join!(registry.update(moved), registry.register(local));
        assert!(registered.is_ok());
        assert!(matches!(updated, Err(NilaFederationError::DuplicateProvider(_))));
        assert_eq!(registry.lookup(&server.uri()).unwrap().id, "local");
        assert_eq!(registry.get("github").unwrap().issuer, "https://token.actions.githubusercontent.com");
    }

    #[tokio::test]
    async fn insecure_issuer_is_refused() {
        let config = ProviderConfigBuilder::new()
            .id("local")
            .issuer("http://localhost:9000")
            .unwrap()
            .jwks_uri("http://localhost:9000/jwks")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(registry().register(config).await, Err(NilaFederationError::InsecureUrl(_))));
    }
}
