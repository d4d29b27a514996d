// src/keys.rs

use crate::error::NilaFederationError;
use crate::model::JsonWebKey;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, DecodingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A public key published by an identity provider, ready for signature checks.
///
/// Keys are immutable once fetched. A refresh builds new `SigningKey`s and the
/// old ones are retired, never edited.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    /// The one algorithm this key verifies. Always asymmetric.
    pub algorithm: Algorithm,
    pub provider_id: String,
    /// RFC 7638 thumbprint of the public key material.
    pub thumbprint: String,
    decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("provider_id", &self.provider_id)
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

/// `true` for the HMAC family, which must never verify federated tokens.
pub fn is_symmetric(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

impl SigningKey {
    /// Converts a published JWK into a verification key.
    ///
    /// The key's algorithm comes from its `alg` member, or is inferred from
    /// `kty`/`crv` when absent. Symmetric (`oct`) keys, encryption keys and
    /// keys whose `alg` contradicts their type are refused.
    pub fn from_jwk(provider_id: &str, jwk: &JsonWebKey) -> Result<Self, NilaFederationError> {
        if let Some(purpose) = jwk.use_purpose.as_deref() {
            if purpose != "sig" {
                return Err(NilaFederationError::InvalidKeyFormat(format!("key use '{}' is not 'sig'", purpose)));
            }
        }
        let declared = jwk
            .alg
            .as_deref()
            .map(|alg| Algorithm::from_str(alg).map_err(|_| NilaFederationError::InvalidKeyFormat(format!("unsupported alg '{}'", alg))))
            .transpose()?;

        let (algorithm, decoding_key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = required(&jwk.n, "RSA key missing 'n' component")?;
                let e = required(&jwk.e, "RSA key missing 'e' component")?;
                let alg = declared.unwrap_or(Algorithm::RS256);
                if !matches!(
                    alg,
                    Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512
                ) {
                    return Err(NilaFederationError::InvalidKeyFormat(format!("alg {:?} is not valid for an RSA key", alg)));
                }
                (alg, DecodingKey::from_rsa_components(n, e)?)
            }
            "EC" => {
                let x = required(&jwk.x, "EC key missing 'x' coordinate")?;
                let y = required(&jwk.y, "EC key missing 'y' coordinate")?;
                let curve_alg = match jwk.crv.as_deref() {
                    Some("P-256") => Algorithm::ES256,
                    Some("P-384") => Algorithm::ES384,
                    other => {
                        return Err(NilaFederationError::InvalidKeyFormat(format!("unsupported EC curve {:?}", other)));
                    }
                };
                if declared.is_some_and(|alg| alg != curve_alg) {
                    return Err(NilaFederationError::InvalidKeyFormat(format!(
                        "alg {:?} does not match curve {:?}",
                        declared, jwk.crv
                    )));
                }
                (curve_alg, DecodingKey::from_ec_components(x, y)?)
            }
            "OKP" => {
                if jwk.crv.as_deref() != Some("Ed25519") {
                    return Err(NilaFederationError::InvalidKeyFormat(format!("unsupported OKP curve {:?}", jwk.crv)));
                }
                if declared.is_some_and(|alg| alg != Algorithm::EdDSA) {
                    return Err(NilaFederationError::InvalidKeyFormat("OKP keys only verify EdDSA".to_string()));
                }
                let x = required(&jwk.x, "OKP key missing 'x' component")?;
                (Algorithm::EdDSA, DecodingKey::from_ed_components(x)?)
            }
            "oct" => {
                return Err(NilaFederationError::InvalidKeyFormat("symmetric keys are not accepted".to_string()));
            }
            other => {
                return Err(NilaFederationError::InvalidKeyFormat(format!("unsupported key type '{}'", other)));
            }
        };

        let thumbprint = thumbprint(jwk)?;
        let kid = jwk.kid.clone().unwrap_or_else(|| thumbprint.clone());

        Ok(Self {
            kid,
            algorithm,
            provider_id: provider_id.to_string(),
            thumbprint,
            decoding_key,
        })
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

fn required<'a>(member: &'a Option<String>, message: &str) -> Result<&'a str, NilaFederationError> {
    member.as_deref().ok_or_else(|| NilaFederationError::InvalidKeyFormat(message.to_string()))
}

/// Computes the RFC 7638 JWK thumbprint. It identifies key material across
/// refreshes and stands in as the `kid` for keys published without one.
fn thumbprint(jwk: &JsonWebKey) -> Result<String, NilaFederationError> {
    // Required members only, lexicographic order, no whitespace.
    let canonical = match jwk.kty.as_str() {
        "RSA" => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            required(&jwk.e, "RSA key missing 'e' component")?,
            required(&jwk.n, "RSA key missing 'n' component")?
        ),
        "EC" => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            required(&jwk.crv, "EC key missing 'crv'")?,
            required(&jwk.x, "EC key missing 'x' coordinate")?,
            required(&jwk.y, "EC key missing 'y' coordinate")?
        ),
        "OKP" => format!(
            r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#,
            required(&jwk.crv, "OKP key missing 'crv'")?,
            required(&jwk.x, "OKP key missing 'x' component")?
        ),
        other => {
            return Err(NilaFederationError::InvalidKeyFormat(format!("cannot thumbprint key type '{}'", other)));
        }
    };
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}
