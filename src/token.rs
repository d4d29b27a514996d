// src/token.rs

use crate::error::Rejection;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tokens larger than this are refused before any decoding.
pub const MAX_TOKEN_BYTES: usize = 16 * 1024;

/// The JOSE header of a token, as sent. Nothing in it is trusted.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub typ: Option<String>,
}

/// A JSON claim value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<ClaimValue>),
    Object(BTreeMap<String, ClaimValue>),
}

impl ClaimValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ClaimValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        ClaimValue::String(value.to_string())
    }
}

/// The claim set of a token. Parsed, not verified.
///
/// Registered claims (`iss`, `sub`, `aud`, `exp`, `nbf`, `iat`) are type
/// checked at parse time; every other claim is kept as-is for rule matching.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    claims: BTreeMap<String, ClaimValue>,
}

impl TokenClaims {
    fn from_map(claims: BTreeMap<String, ClaimValue>) -> Result<Self, Rejection> {
        for name in ["iss", "sub"] {
            match claims.get(name) {
                None | Some(ClaimValue::String(_)) => {}
                Some(_) => return Err(malformed(format!("'{}' must be a string", name))),
            }
        }
        match claims.get("aud") {
            None | Some(ClaimValue::String(_)) => {}
            Some(ClaimValue::Array(items)) if items.iter().all(|v| v.as_str().is_some()) => {}
            Some(_) => return Err(malformed("'aud' must be a string or an array of strings")),
        }
        let parsed = Self { claims };
        for name in ["exp", "nbf", "iat"] {
            parsed.numeric_date(name)?;
        }
        Ok(parsed)
    }

    /// Reads a NumericDate claim as whole seconds since the epoch.
    fn numeric_date(&self, name: &str) -> Result<Option<u64>, Rejection> {
        match self.claims.get(name) {
            None => Ok(None),
            Some(ClaimValue::Number(n)) => match n.as_u64() {
                Some(secs) => Ok(Some(secs)),
                None => match n.as_f64() {
                    Some(secs) if secs >= 0.0 && secs.is_finite() => Ok(Some(secs.floor() as u64)),
                    _ => Err(malformed(format!("'{}' must be a non-negative NumericDate", name))),
                },
            },
            Some(_) => Err(malformed(format!("'{}' must be a NumericDate", name))),
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        self.get("iss").and_then(ClaimValue::as_str)
    }

    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(ClaimValue::as_str)
    }

    /// The `aud` claim as a list, whether it was sent single- or multi-valued.
    pub fn audiences(&self) -> Vec<&str> {
        match self.get("aud") {
            Some(ClaimValue::String(aud)) => vec![aud.as_str()],
            Some(ClaimValue::Array(items)) => items.iter().filter_map(ClaimValue::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.numeric_date("exp").ok().flatten()
    }

    pub fn not_before(&self) -> Option<u64> {
        self.numeric_date("nbf").ok().flatten()
    }

    pub fn issued_at(&self) -> Option<u64> {
        self.numeric_date("iat").ok().flatten()
    }

    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.claims.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClaimValue)> {
        self.claims.iter()
    }
}

/// A token split into its parts, ready for signature verification.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub header: TokenHeader,
    pub claims: TokenClaims,
    signing_input: String,
    signature: String,
}

impl ParsedToken {
    /// The `header.payload` bytes the signature covers.
    pub fn signing_input(&self) -> &str {
        &self.signing_input
    }

    /// The base64url signature segment.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

fn malformed(reason: impl Into<String>) -> Rejection {
    Rejection::MalformedToken(reason.into())
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, Rejection> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| malformed(format!("{} is not base64url: {}", name, e)))
}

/// Splits and decodes a compact JWS without validating anything it says.
pub fn parse(raw_token: &str) -> Result<ParsedToken, Rejection> {
    if raw_token.is_empty() {
        return Err(malformed("empty token"));
    }
    if raw_token.len() > MAX_TOKEN_BYTES {
        return Err(malformed(format!("token exceeds {} bytes", MAX_TOKEN_BYTES)));
    }

    let segments: Vec<&str> = raw_token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = segments[..] else {
        return Err(malformed(format!("expected 3 segments, found {}", segments.len())));
    };
    if signature_b64.is_empty() {
        return Err(malformed("signature segment is empty"));
    }

    let header_bytes = decode_segment(header_b64, "header")?;
    let payload_bytes = decode_segment(payload_b64, "payload")?;
    decode_segment(signature_b64, "signature")?;

    let header: TokenHeader =
        serde_json::from_slice(&header_bytes).map_err(|e| malformed(format!("header is not a JSON object: {}", e)))?;
    let claim_map: BTreeMap<String, ClaimValue> =
        serde_json::from_slice(&payload_bytes).map_err(|e| malformed(format!("payload is not a JSON object: {}", e)))?;

    Ok(ParsedToken {
        header,
        claims: TokenClaims::from_map(claim_map)?,
        signing_input: format!("{}.{}", header_b64, payload_b64),
        signature: signature_b64.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segment(value: &serde_json::Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    fn token(header: serde_json::Value, payload: serde_json::Value) -> String {
        format!("{}.{}.c2ln", segment(&header), segment(&payload))
    }

    #[test]
    fn parses_header_and_claims() {
        let raw = token(
            json!({"alg": "RS256", "kid": "k1", "typ": "JWT"}),
            json!({
                "iss": "https://token.actions.githubusercontent.com",
                "sub": "repo:myorg/myrepo:ref:refs/heads/main",
                "aud": ["reg.example", "other"],
                "exp": 1_900_000_000u64,
                "nbf": 1_800_000_000.5,
                "repository": "myorg/myrepo",
                "run_attempt": 1
            }),
        );
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.header.alg, "RS256");
        assert_eq!(parsed.header.kid.as_deref(), Some("k1"));
        assert_eq!(parsed.claims.issuer(), Some("https://token.actions.githubusercontent.com"));
        assert_eq!(parsed.claims.audiences(), vec!["reg.example", "other"]);
        assert_eq!(parsed.claims.expires_at(), Some(1_900_000_000));
        assert_eq!(parsed.claims.not_before(), Some(1_800_000_000));
        assert_eq!(parsed.claims.get("repository"), Some(&ClaimValue::from("myorg/myrepo")));
        assert_eq!(parsed.signature(), "c2ln");
        assert!(raw.starts_with(parsed.signing_input()));
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(parse("a.b"), Err(Rejection::MalformedToken(_))));
        assert!(matches!(parse("a.b.c.d"), Err(Rejection::MalformedToken(_))));
        assert!(matches!(parse(""), Err(Rejection::MalformedToken(_))));
    }

    #[test]
    fn rejects_empty_signature() {
        let raw = token(json!({"alg": "RS256"}), json!({"iss": "x"}));
        let unsigned = raw.rsplit_once('.').map(|(head, _)| format!("{}.", head)).unwrap();
        assert!(matches!(parse(&unsigned), Err(Rejection::MalformedToken(reason)) if reason.contains("empty")));
    }

    #[test]
    fn rejects_non_json_segments() {
        let not_json = URL_SAFE_NO_PAD.encode(b"not json");
        let payload = segment(&json!({"iss": "x"}));
        assert!(matches!(parse(&format!("{}.{}.c2ln", not_json, payload)), Err(Rejection::MalformedToken(_))));

        let header = segment(&json!({"alg": "RS256"}));
        let array = segment(&json!(["iss"]));
        assert!(matches!(parse(&format!("{}.{}.c2ln", header, array)), Err(Rejection::MalformedToken(_))));
        assert!(matches!(parse(&format!("{}.{}.c2ln", header, "%%%")), Err(Rejection::MalformedToken(_))));
    }

    #[test]
    fn rejects_mistyped_registered_claims() {
        let header = json!({"alg": "RS256"});
        assert!(parse(&token(header.clone(), json!({"exp": "tomorrow"}))).is_err());
        assert!(parse(&token(header.clone(), json!({"exp": -5}))).is_err());
        assert!(parse(&token(header.clone(), json!({"iss": 42}))).is_err());
        assert!(parse(&token(header, json!({"aud": [1, 2]}))).is_err());
    }

    #[test]
    fn rejects_oversized_tokens() {
        let raw = "a".repeat(MAX_TOKEN_BYTES + 1);
        assert!(matches!(parse(&raw), Err(Rejection::MalformedToken(_))));
    }
}
