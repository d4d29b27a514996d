// src/lib.rs

//! Workload identity federation for a container registry.
//!
//! CI platforms (GitHub Actions, GitLab CI, Kubernetes) hand their jobs
//! short-lived OIDC tokens. [`FederatedVerifier`](verifier::FederatedVerifier)
//! checks such a token against the issuer's published keys and maps its
//! claims to a federated robot account, which the registry then authorizes
//! like any other robot account.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod model;
pub mod registry;
pub mod rules;
pub mod token;
pub mod validator;
pub mod verifier;

/// The public prelude for the `nila-federation` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::config::{KeyCachePolicy, ProviderConfig, ProviderConfigBuilder, VerifierConfig, VerifierConfigBuilder};
    pub use crate::error::{NilaFederationError, Rejection};
    pub use crate::registry::IdentityProvider;
    pub use crate::rules::{Action, ClaimPredicate, ClaimRule, FederatedRobotAccount, Permission, RobotAccount};
    pub use crate::token::{ClaimValue, TokenClaims};
    pub use crate::verifier::{FederatedVerifier, VerificationResult};
    pub use jsonwebtoken::Algorithm;
}
