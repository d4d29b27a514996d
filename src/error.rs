// src/error.rs

use thiserror::Error;

/// The primary error type for configuration, administration and network
/// operations in the `nila-federation` library.
///
/// Token verification never surfaces this type to callers; a failed
/// verification is always a [`Rejection`].
#[derive(Debug, Error)]
pub enum NilaFederationError {
    /// An error occurred during an HTTP request.
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The remote endpoint answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A URL uses plain HTTP while HTTPS is required.
    #[error("URL must use https: {0}")]
    InsecureUrl(String),

    /// Another provider is already registered for this issuer (or id).
    #[error("A provider is already registered for {0}")]
    DuplicateProvider(String),

    /// No provider is registered under the given id.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// OpenID discovery for an issuer failed.
    #[error("OIDC discovery failed for {issuer}: {reason}")]
    Discovery { issuer: String, reason: String },

    /// A cryptographic key (JWK) is malformed or not acceptable.
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// A claim rule points at a robot account the provider does not declare.
    #[error("Rule '{rule}' references unknown robot account '{robot_account}'")]
    UnknownRobotAccount { rule: String, robot_account: String },

    /// Errors originating from the `jsonwebtoken` crate while building keys.
    #[error("JWT error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),
}

/// Why a bearer token was refused.
///
/// The `Display` form is meant for operators (logs, audit). Clients should
/// only ever see [`Rejection::client_message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("no identity provider registered for issuer '{0}'")]
    UnknownIssuer(String),

    #[error("no signing key '{kid}' known for provider '{provider}'")]
    KeyNotFound { provider: String, kid: String },

    #[error("signing keys for provider '{0}' are unavailable")]
    ProviderUnavailable(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("token audience does not include '{expected}'")]
    AudienceMismatch { expected: String },

    #[error("no claim rule of provider '{0}' matched the token")]
    NoMatch(String),
}

impl Rejection {
    /// A stable, machine-friendly code for metrics and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MalformedToken(_) => "malformed_token",
            Rejection::UnknownIssuer(_) => "unknown_issuer",
            Rejection::KeyNotFound { .. } => "key_not_found",
            Rejection::ProviderUnavailable(_) => "provider_unavailable",
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::Expired => "expired",
            Rejection::NotYetValid => "not_yet_valid",
            Rejection::AudienceMismatch { .. } => "audience_mismatch",
            Rejection::NoMatch(_) => "no_match",
        }
    }

    /// The message to echo back to the client. Identical for every reason.
    pub fn client_message(&self) -> &'static str {
        "authentication failed"
    }

    /// `true` for a token that verified but has no mapping, as opposed to a
    /// token that is itself bad.
    pub fn is_unmapped(&self) -> bool {
        matches!(self, Rejection::NoMatch(_))
    }
}
