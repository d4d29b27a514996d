// src/validator.rs

use crate::cache::JwksCache;
use crate::error::Rejection;
use crate::keys::{is_symmetric, SigningKey};
use crate::registry::{IdentityProvider, IssuerRegistry};
use crate::token::{ParsedToken, TokenClaims};
use jsonwebtoken::Algorithm;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// A token whose signature and standard claims have been checked.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub provider: Arc<IdentityProvider>,
    pub claims: TokenClaims,
    /// The `kid` of the key that verified the signature.
    pub key_id: String,
}

/// Checks a parsed token's signature against its issuer's keys, then its
/// lifetime and audience.
///
/// This struct is created once and shared; it holds handles to the issuer
/// registry and the key cache.
#[derive(Clone)]
pub struct Validator {
    registry: Arc<IssuerRegistry>,
    keys: Arc<JwksCache>,
    leeway: Duration,
}

impl Validator {
    pub fn new(registry: Arc<IssuerRegistry>, keys: Arc<JwksCache>, leeway: Duration) -> Self {
        Self { registry, keys, leeway }
    }

    /// Validates a parsed token.
    ///
    /// 1. The unverified `iss` selects the provider, nothing more.
    /// 2. The header's `kid` selects the keys within that provider: the live
    ///    key, plus a retired one if the kid was recently given new material.
    /// 3. The signature is verified with each key's own algorithm; one must
    ///    verify.
    /// 4. Only then are `exp`, `nbf` and `aud` read.
    ///
    /// `default_audience` applies unless the provider configures its own.
    #[instrument(skip(self, token, default_audience), fields(iss = token.claims.issuer(), kid = token.header.kid.as_deref()))]
    pub async fn validate(&self, token: &ParsedToken, default_audience: &str) -> Result<VerifiedToken, Rejection> {
        // 1. Pick the provider by the claimed issuer.
        let issuer = token
            .claims
            .issuer()
            .ok_or_else(|| Rejection::MalformedToken("missing 'iss' claim".to_string()))?;
        let provider = self
            .registry
            .lookup(issuer)
            .ok_or_else(|| Rejection::UnknownIssuer(issuer.to_string()))?;

        // 2. Fetch the keys the header names.
        let candidates = self.keys.keys_for(&provider, token.header.kid.as_deref()).await?;

        // 3. Verify the signature before trusting anything else.
        let key = candidates
            .iter()
            .find(|key| verify_signature(token, key).is_ok())
            .ok_or(Rejection::InvalidSignature)?;
        debug!(provider = %provider.id, kid = %key.kid, "Token signature verified");

        // 4. Lifetime and audience.
        check_claims(&token.claims, provider.expected_audience(default_audience), self.leeway, unix_now())?;

        Ok(VerifiedToken {
            key_id: key.kid.clone(),
            claims: token.claims.clone(),
            provider,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// The header algorithm must be exactly the key's algorithm; a token can
/// never choose how it is verified.
fn verify_signature(token: &ParsedToken, key: &SigningKey) -> Result<(), Rejection> {
    let alg = Algorithm::from_str(&token.header.alg).map_err(|_| Rejection::InvalidSignature)?;
    if alg != key.algorithm || is_symmetric(alg) {
        debug!("Token alg {:?} does not match key alg {:?}", alg, key.algorithm);
        return Err(Rejection::InvalidSignature);
    }
    match jsonwebtoken::crypto::verify(token.signature(), token.signing_input().as_bytes(), key.decoding_key(), alg) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(Rejection::InvalidSignature),
    }
}

/// Checks `exp`, `nbf` and `aud` at `now` (seconds since the epoch).
///
/// A token is live while `now < exp + leeway` and `now + leeway >= nbf`.
pub(crate) fn check_claims(claims: &TokenClaims, expected_audience: &str, leeway: Duration, now: u64) -> Result<(), Rejection> {
    let leeway = leeway.as_secs();

    let exp = claims
        .expires_at()
        .ok_or_else(|| Rejection::MalformedToken("missing 'exp' claim".to_string()))?;
    if exp.saturating_add(leeway) <= now {
        return Err(Rejection::Expired);
    }

    if let Some(nbf) = claims.not_before() {
        if nbf > now.saturating_add(leeway) {
            return Err(Rejection::NotYetValid);
        }
    }

    if !claims.audiences().contains(&expected_audience) {
        return Err(Rejection::AudienceMismatch {
            expected: expected_audience.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token;
    use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde_json::json;

    const NOW: u64 = 1_750_000_000;
    const SKEW: Duration = Duration::from_secs(60);

    fn claims(payload: serde_json::Value) -> TokenClaims {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        token::parse(&format!("{}.{}.c2ln", header, body)).unwrap().claims
    }

    #[test]
    fn expiry_boundary_respects_skew() {
        let expired = claims(json!({"aud": "reg.example", "exp": NOW - 60 - 1}));
        assert_eq!(check_claims(&expired, "reg.example", SKEW, NOW), Err(Rejection::Expired));

        let live = claims(json!({"aud": "reg.example", "exp": NOW + 60 + 1}));
        assert_eq!(check_claims(&live, "reg.example", SKEW, NOW), Ok(()));

        let within_skew = claims(json!({"aud": "reg.example", "exp": NOW - 30}));
        assert_eq!(check_claims(&within_skew, "reg.example", SKEW, NOW), Ok(()));
    }

    #[test]
    fn not_before_respects_skew() {
        let early = claims(json!({"aud": "reg.example", "exp": NOW + 600, "nbf": NOW + 61}));
        assert_eq!(check_claims(&early, "reg.example", SKEW, NOW), Err(Rejection::NotYetValid));

        let close = claims(json!({"aud": "reg.example", "exp": NOW + 600, "nbf": NOW + 60}));
        assert_eq!(check_claims(&close, "reg.example", SKEW, NOW), Ok(()));
    }

    #[test]
    fn audience_must_be_present() {
        let other = claims(json!({"aud": "other-registry.example", "exp": NOW + 600}));
        assert!(matches!(
            check_claims(&other, "macfly4200.8gears.ch", SKEW, NOW),
            Err(Rejection::AudienceMismatch { .. })
        ));

        let multi = claims(json!({"aud": ["sts.amazonaws.com", "macfly4200.8gears.ch"], "exp": NOW + 600}));
        assert_eq!(check_claims(&multi, "macfly4200.8gears.ch", SKEW, NOW), Ok(()));

        let missing = claims(json!({"exp": NOW + 600}));
        assert!(matches!(check_claims(&missing, "reg", SKEW, NOW), Err(Rejection::AudienceMismatch { .. })));
    }

    #[test]
    fn exp_is_required() {
        let no_exp = claims(json!({"aud": "reg"}));
        assert!(matches!(check_claims(&no_exp, "reg", SKEW, NOW), Err(Rejection::MalformedToken(_))));
    }
}
