// src/cache.rs

use crate::client::JwksClient;
use crate::config::{KeyCachePolicy, MAX_ROTATION_GRACE, MAX_STALENESS};
use crate::error::{NilaFederationError, Rejection};
use crate::keys::SigningKey;
use crate::registry::IdentityProvider;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

const BASE_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300); // 5 minutes
const MIN_LOOP_INTERVAL: Duration = Duration::from_secs(1);

/// A point-in-time view of one provider's cached key set, for operators.
#[derive(Debug, Clone)]
pub struct KeySetStatus {
    pub provider_id: String,
    pub jwks_uri: Url,
    pub live_keys: usize,
    /// Time since the last successful fetch.
    pub age: Option<Duration>,
    /// Past `max_staleness` (or never fetched): every token is rejected.
    pub degraded: bool,
    pub consecutive_failures: u32,
}

/// Caches the signing keys of every registered provider.
///
/// Verification reads never wait for the network: a miss or an expired TTL
/// schedules a background refresh and the read answers from what is cached.
/// Refreshes of one provider are coalesced to a single in-flight fetch.
pub struct JwksCache {
    client: JwksClient,
    policy: KeyCachePolicy,
    entries: RwLock<HashMap<String, Arc<ProviderKeys>>>,
}

struct ProviderKeys {
    provider_id: String,
    jwks_uri: Url,
    state: RwLock<KeySetState>,
    // Keys dropped from the published set or replaced under the same kid,
    // kept for the rotation grace window.
    retired: Cache<String, Arc<SigningKey>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct KeySetState {
    live: HashMap<String, Arc<SigningKey>>,
    fetched_at: Option<Instant>,
    fresh_until: Option<Instant>,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl KeySetState {
    fn is_degraded(&self, policy: &KeyCachePolicy, now: Instant) -> bool {
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) > policy.max_staleness,
            None => true,
        }
    }
}

impl ProviderKeys {
    fn new(provider: &IdentityProvider, policy: &KeyCachePolicy) -> Self {
        Self {
            provider_id: provider.id.clone(),
            jwks_uri: provider.jwks_uri.clone(),
            state: RwLock::new(KeySetState::default()),
            retired: Cache::builder()
                .time_to_live(policy.rotation_grace.min(MAX_ROTATION_GRACE))
                .build(),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_task: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, KeySetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, KeySetState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches the published key set and swaps it in. Keys that disappeared,
    /// or whose kid now names different key material, move to the retired
    /// cache before the swap so a concurrent lookup always finds one of them.
    ///
    /// If a fetch is already running, waits for it and reports the resulting
    /// key count instead of fetching again.
    #[instrument(skip(self, client, policy), fields(provider = %self.provider_id), err)]
    async fn refresh(&self, client: &JwksClient, policy: &KeyCachePolicy) -> Result<usize, NilaFederationError> {
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("JWKS refresh already in flight, waiting for it");
                let _in_flight = self.refresh_lock.lock().await;
                return Ok(self.read().live.len());
            }
        };
        self.write().last_attempt = Some(Instant::now());

        let fetched = match client.fetch_key_set(&self.provider_id, &self.jwks_uri).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let failures = {
                    let mut state = self.write();
                    state.consecutive_failures += 1;
                    state.consecutive_failures
                };
                warn!(failures, "JWKS refresh failed, keeping cached keys: {}", e);
                return Err(e);
            }
        };

        let live: HashMap<String, Arc<SigningKey>> =
            fetched.keys.into_iter().map(|key| (key.kid.clone(), Arc::new(key))).collect();
        let count = live.len();

        // The live set only changes under `refresh_lock`, which we hold.
        let retiring: Vec<Arc<SigningKey>> = self
            .read()
            .live
            .values()
            .filter(|old| live.get(&old.kid).map_or(true, |new| new.thumbprint != old.thumbprint))
            .cloned()
            .collect();
        for key in retiring {
            info!(kid = %key.kid, grace = ?policy.rotation_grace, "Signing key rotated out, retiring");
            self.retired.insert(key.kid.clone(), key).await;
        }
        let now = Instant::now();
        let ttl = fetched
            .max_age
            .unwrap_or(policy.ttl)
            .min(policy.max_staleness)
            .min(MAX_STALENESS);
        let current: Vec<Arc<SigningKey>> = live.values().cloned().collect();
        {
            let mut state = self.write();
            state.live = live;
            state.fetched_at = Some(now);
            // An unrepresentable deadline counts as already stale.
            state.fresh_until = Some(now.checked_add(ttl).unwrap_or(now));
            state.consecutive_failures = 0;
        }

        // A key that came back is live again, not retired.
        for key in current {
            if self.retired.get(&key.kid).await.is_some_and(|old| old.thumbprint == key.thumbprint) {
                self.retired.invalidate(&key.kid).await;
            }
        }

        info!("Successfully fetched {} keys. Caching with TTL: {:?}", count, ttl);
        Ok(count)
    }

    /// The keys a token naming `kid` may be verified with: the live key
    /// first, then a retired key with different material under the same kid.
    async fn candidates(&self, kid: &str, live: Option<Arc<SigningKey>>) -> Vec<Arc<SigningKey>> {
        let retired = self.retired.get(kid).await;
        match (live, retired) {
            (Some(live), Some(retired)) if live.thumbprint != retired.thumbprint => vec![live, retired],
            (Some(live), _) => vec![live],
            (None, Some(retired)) => vec![retired],
            (None, None) => Vec::new(),
        }
    }

    fn status(&self, policy: &KeyCachePolicy) -> KeySetStatus {
        let now = Instant::now();
        let state = self.read();
        KeySetStatus {
            provider_id: self.provider_id.clone(),
            jwks_uri: self.jwks_uri.clone(),
            live_keys: state.live.len(),
            age: state.fetched_at.map(|at| now.saturating_duration_since(at)),
            degraded: state.is_degraded(policy, now),
            consecutive_failures: state.consecutive_failures,
        }
    }
}

impl Drop for ProviderKeys {
    fn drop(&mut self) {
        let task = self.refresh_task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

impl JwksCache {
    pub fn new(client: JwksClient, policy: KeyCachePolicy) -> Self {
        Self {
            client,
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &KeyCachePolicy {
        &self.policy
    }

    /// Starts caching keys for a provider. Returns `false` if the provider is
    /// already tracked with the same JWKS URI.
    ///
    /// Nothing is fetched until the first [`refresh`](Self::refresh), which
    /// also starts the background refresh loop when enabled.
    pub fn track(&self, provider: &IdentityProvider) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(&provider.id).is_some_and(|entry| entry.jwks_uri == provider.jwks_uri) {
            return false;
        }
        // Replacing an entry drops it, which stops its refresh loop.
        entries.insert(provider.id.clone(), Arc::new(ProviderKeys::new(provider, &self.policy)));
        true
    }

    /// Stops caching keys for a provider and ends its refresh loop.
    pub fn untrack(&self, provider_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id)
            .is_some()
    }

    /// Fetches the provider's key set now. Concurrent calls share one fetch.
    ///
    /// The first call for a provider starts its background refresh loop, so
    /// the loop schedules from a real fetch outcome.
    pub async fn refresh(&self, provider: &IdentityProvider) -> Result<usize, NilaFederationError> {
        let entry = self
            .entry(provider)
            .ok_or_else(|| NilaFederationError::UnknownProvider(provider.id.clone()))?;
        let result = entry.refresh(&self.client, &self.policy).await;
        if self.policy.background_refresh {
            self.ensure_refresh_loop(&entry);
        }
        result
    }

    /// The provider's live signing keys, without touching the network.
    pub fn get_keys(&self, provider: &IdentityProvider) -> Result<Vec<Arc<SigningKey>>, Rejection> {
        let entry = self
            .entry(provider)
            .ok_or_else(|| Rejection::ProviderUnavailable(provider.id.clone()))?;
        let now = Instant::now();
        let (keys, degraded, stale) = {
            let state = entry.read();
            (
                state.live.values().cloned().collect::<Vec<_>>(),
                state.is_degraded(&self.policy, now),
                state.fresh_until.map_or(true, |until| now >= until),
            )
        };
        if degraded || stale {
            self.trigger_refresh(&entry);
        }
        if degraded {
            return Err(Rejection::ProviderUnavailable(provider.id.clone()));
        }
        Ok(keys)
    }

    /// Looks up the keys a token may be verified with.
    ///
    /// Answers from the live set, then from keys still inside the rotation
    /// grace window; a kid republished with new material yields both. A miss
    /// schedules a refresh and fails fast with `KeyNotFound`. Without a
    /// `kid`, the live set is used only if it holds exactly one key.
    #[instrument(skip(self, provider), fields(provider = %provider.id))]
    pub async fn keys_for(&self, provider: &IdentityProvider, kid: Option<&str>) -> Result<Vec<Arc<SigningKey>>, Rejection> {
        let entry = self
            .entry(provider)
            .ok_or_else(|| Rejection::ProviderUnavailable(provider.id.clone()))?;

        let now = Instant::now();
        let (live, degraded, stale) = {
            let state = entry.read();
            let live = match kid {
                Some(kid) => state.live.get(kid).cloned(),
                None if state.live.len() == 1 => state.live.values().next().cloned(),
                None => None,
            };
            (
                live,
                state.is_degraded(&self.policy, now),
                state.fresh_until.map_or(true, |until| now >= until),
            )
        };

        if degraded {
            warn!("Key set is past its staleness bound, provider degraded");
            self.trigger_refresh(&entry);
            return Err(Rejection::ProviderUnavailable(provider.id.clone()));
        }
        if stale {
            debug!("Key set TTL elapsed, refreshing in background");
            self.trigger_refresh(&entry);
        }

        let candidates = match (kid, live) {
            (Some(kid), live) => entry.candidates(kid, live).await,
            (None, Some(live)) => vec![live],
            (None, None) => Vec::new(),
        };
        if !candidates.is_empty() {
            debug!("JWK cache hit for kid: {:?} ({} candidates)", kid, candidates.len());
            return Ok(candidates);
        }

        debug!("JWK cache miss for kid: {:?}", kid);
        self.trigger_refresh(&entry);
        Err(Rejection::KeyNotFound {
            provider: provider.id.clone(),
            kid: kid.unwrap_or("<none>").to_string(),
        })
    }

    pub fn status(&self, provider_id: &str) -> Option<KeySetStatus> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(provider_id).map(|entry| entry.status(&self.policy))
    }

    fn entry(&self, provider: &IdentityProvider) -> Option<Arc<ProviderKeys>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&provider.id)
            .filter(|entry| entry.jwks_uri == provider.jwks_uri)
            .cloned()
    }

    /// Schedules a best-effort background refresh, at most one per
    /// `min_refresh_interval`.
    fn trigger_refresh(&self, entry: &Arc<ProviderKeys>) {
        {
            let mut state = entry.write();
            if state
                .last_attempt
                .is_some_and(|last| last.elapsed() < self.policy.min_refresh_interval)
            {
                return;
            }
            // Stamped here so concurrent readers do not all spawn a fetch.
            state.last_attempt = Some(Instant::now());
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(provider = %entry.provider_id, "No Tokio runtime available, skipping JWKS refresh");
            return;
        };
        let entry = Arc::clone(entry);
        let client = self.client.clone();
        let policy = self.policy.clone();
        runtime.spawn(async move {
            // Failures are logged by `refresh` and leave the cache intact.
            let _ = entry.refresh(&client, &policy).await;
        });
    }

    fn ensure_refresh_loop(&self, entry: &Arc<ProviderKeys>) {
        let mut task = entry.refresh_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(provider = %entry.provider_id, "No Tokio runtime available, background JWKS refresh disabled");
            return;
        };
        *task = Some(runtime.spawn(key_refresh_loop(
            Arc::downgrade(entry),
            self.client.clone(),
            self.policy.clone(),
        )));
    }
}

/// Refreshes proactively at 80% of the key set's TTL; after a failure,
/// retries with exponential backoff. Ends once the provider is untracked.
async fn key_refresh_loop(entry: Weak<ProviderKeys>, client: JwksClient, policy: KeyCachePolicy) {
    let mut retry_delay = BASE_RETRY_DELAY;

    loop {
        let sleep_for = {
            let Some(entry) = entry.upgrade() else { return };
            let state = entry.read();
            match (state.consecutive_failures, state.fetched_at, state.fresh_until) {
                (0, Some(at), Some(until)) => {
                    retry_delay = BASE_RETRY_DELAY;
                    until.saturating_duration_since(at).mul_f64(0.8)
                }
                _ => {
                    let delay = retry_delay;
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    delay
                }
            }
        }
        .max(MIN_LOOP_INTERVAL);

        debug!("JWKS background refresh scheduled in {:?}", sleep_for);
        tokio::time::sleep(sleep_for).await;

        let Some(entry) = entry.upgrade() else { return };
        if let Err(e) = entry.refresh(&client, &policy).await {
            error!(provider = %entry.provider_id, "Failed to refresh JWKS in background: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_fetched_key_set_is_degraded() {
        let policy = KeyCachePolicy::default();
        assert!(KeySetState::default().is_degraded(&policy, Instant::now()));
    }

    #[test]
    fn staleness_bound_is_exclusive() {
        let policy = KeyCachePolicy {
            max_staleness: Duration::from_secs(60),
            ..KeyCachePolicy::default()
        };
        let fetched = Instant::now();
        let state = KeySetState {
            fetched_at: Some(fetched),
            ..KeySetState::default()
        };
        assert!(!state.is_degraded(&policy, fetched + Duration::from_secs(60)));
        assert!(state.is_degraded(&policy, fetched + Duration::from_secs(61)));
    }
}
