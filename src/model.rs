// src/model.rs

use serde::Deserialize;

/// Represents the data structure of an OIDC provider's discovery document.
/// Found at the `.well-known/openid-configuration` endpoint.
#[derive(Debug, Deserialize)]
pub struct OidcDiscoveryDocument {
    pub issuer: String,
    pub jwks_uri: String,
}

/// Represents a single JSON Web Key (JWK) as defined in RFC 7517.
///
/// Only the public members needed to verify signatures are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWebKey {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(rename = "use", default)]
    pub use_purpose: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    // RSA
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    // EC and OKP
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

/// Represents a JSON Web Key Set (JWKS), which is a collection of JWKs.
#[derive(Debug, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}
