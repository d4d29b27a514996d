// src/rules.rs

use crate::error::Rejection;
use crate::registry::IdentityProvider;
use crate::token::{ClaimValue, TokenClaims};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A registry operation a robot account may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pull,
    Push,
    Delete,
}

/// Actions granted on one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub repository: String,
    pub actions: Vec<Action>,
}

/// A robot account as declared in a provider's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RobotAccount {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl RobotAccount {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: Vec::new(),
        }
    }

    pub fn permit(mut self, repository: impl Into<String>, actions: &[Action]) -> Self {
        self.permissions.push(Permission {
            repository: repository.into(),
            actions: actions.to_vec(),
        });
        self
    }
}

/// The identity a token resolves to: a robot account reached through one
/// specific rule of one specific provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FederatedRobotAccount {
    pub name: String,
    pub permissions: Vec<Permission>,
    pub provider_id: String,
    pub rule_id: String,
}

impl FederatedRobotAccount {
    /// Whether this account may perform `action` on `repository`.
    pub fn allows(&self, repository: &str, action: Action) -> bool {
        self.permissions
            .iter()
            .any(|p| p.repository == repository && p.actions.contains(&action))
    }
}

/// A condition on a single claim.
///
/// In configuration a bare value means `equals`; `{ one_of: [...] }` accepts
/// any of the listed values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClaimPredicate {
    OneOf { one_of: Vec<ClaimValue> },
    Equals(ClaimValue),
}

impl ClaimPredicate {
    pub fn equals(value: impl Into<ClaimValue>) -> Self {
        ClaimPredicate::Equals(value.into())
    }

    pub fn one_of<V: Into<ClaimValue>>(values: impl IntoIterator<Item = V>) -> Self {
        ClaimPredicate::OneOf {
            one_of: values.into_iter().map(Into::into).collect(),
        }
    }

    fn holds_for(&self, actual: &ClaimValue) -> bool {
        match self {
            ClaimPredicate::Equals(expected) => actual == expected,
            ClaimPredicate::OneOf { one_of } => one_of.iter().any(|expected| actual == expected),
        }
    }
}

/// Maps tokens whose claims satisfy every condition to a robot account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClaimRule {
    pub id: String,
    /// Name of a robot account declared by the same provider.
    pub robot_account: String,
    pub claims: BTreeMap<String, ClaimPredicate>,
}

impl ClaimRule {
    pub fn new(id: impl Into<String>, robot_account: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            robot_account: robot_account.into(),
            claims: BTreeMap::new(),
        }
    }

    /// Adds a condition. A later condition on the same claim replaces the earlier one.
    pub fn require(mut self, claim: impl Into<String>, predicate: ClaimPredicate) -> Self {
        self.claims.insert(claim.into(), predicate);
        self
    }

    /// All conditions hold. A claim missing from the token fails its condition.
    pub fn matches(&self, claims: &TokenClaims) -> bool {
        self.claims
            .iter()
            .all(|(name, predicate)| claims.get(name).is_some_and(|actual| predicate.holds_for(actual)))
    }
}

/// A rule bound to the account it grants, as stored on a registered provider.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: ClaimRule,
    pub account: Arc<FederatedRobotAccount>,
}

/// Selects the robot account for verified claims: the provider's rules are
/// tried in configured order and the first full match wins.
pub fn match_claims(provider: &IdentityProvider, claims: &TokenClaims) -> Result<Arc<FederatedRobotAccount>, Rejection> {
    provider
        .rules
        .iter()
        .find(|compiled| compiled.rule.matches(claims))
        .map(|compiled| {
            debug!(provider = %provider.id, rule = %compiled.rule.id, "Claim rule matched");
            Arc::clone(&compiled.account)
        })
        .ok_or_else(|| Rejection::NoMatch(provider.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token;
    use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde_json::json;

    fn claims(payload: serde_json::Value) -> TokenClaims {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        token::parse(&format!("{}.{}.c2ln", header, body)).unwrap().claims
    }

    #[test]
    fn rule_requires_every_condition() {
        let rule = ClaimRule::new("main", "R1")
            .require("repository", ClaimPredicate::equals("myorg/myrepo"))
            .require("ref", ClaimPredicate::equals("refs/heads/main"));

        assert!(rule.matches(&claims(json!({"repository": "myorg/myrepo", "ref": "refs/heads/main"}))));
        assert!(!rule.matches(&claims(json!({"repository": "myorg/myrepo", "ref": "refs/heads/dev"}))));
        assert!(!rule.matches(&claims(json!({"repository": "myorg/myrepo"}))));
    }

    #[test]
    fn equality_is_exact() {
        let rule = ClaimRule::new("exact", "R1").require("repository", ClaimPredicate::equals("myorg/myrepo"));
        assert!(!rule.matches(&claims(json!({"repository": "MyOrg/MyRepo"}))));
        assert!(!rule.matches(&claims(json!({"repository": "myorg/myrepo-fork"}))));
        assert!(!rule.matches(&claims(json!({"repository": ["myorg/myrepo"]}))));
    }

    #[test]
    fn one_of_accepts_any_listed_value() {
        let rule = ClaimRule::new("branches", "R1")
            .require("ref", ClaimPredicate::one_of(["refs/heads/main", "refs/heads/release"]));
        assert!(rule.matches(&claims(json!({"ref": "refs/heads/release"}))));
        assert!(!rule.matches(&claims(json!({"ref": "refs/heads/feature"}))));
    }

    #[test]
    fn predicates_load_from_yaml() {
        let yaml = r#"
id: k8s
robot_account: cluster-puller
claims:
  sub: system:serviceaccount:ci:builder
  run_attempt: 1
  ref_type: { one_of: [branch, tag] }
"#;
        let rule: ClaimRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.claims["sub"], ClaimPredicate::equals("system:serviceaccount:ci:builder"));
        assert_eq!(rule.claims["ref_type"], ClaimPredicate::one_of(["branch", "tag"]));
        assert!(rule.matches(&claims(json!({
            "sub": "system:serviceaccount:ci:builder",
            "run_attempt": 1,
            "ref_type": "tag"
        }))));
    }

    #[test]
    fn robot_account_permissions() {
        let account = FederatedRobotAccount {
            name: "R1".to_string(),
            permissions: RobotAccount::new("R1").permit("myorg/app", &[Action::Pull, Action::Push]).permissions,
            provider_id: "github".to_string(),
            rule_id: "main".to_string(),
        };
        assert!(account.allows("myorg/app", Action::Push));
        assert!(!account.allows("myorg/app", Action::Delete));
        assert!(!account.allows("myorg/other", Action::Pull));
    }
}
