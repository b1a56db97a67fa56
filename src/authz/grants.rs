//! Permission grants and their store.
//!
//! A grant binds a subject (role or user) to a resource pattern and a set
//! of actions, optionally bounded by an expiry and argument conditions.
//! Grants are strictly additive: there are no explicit denies, and
//! user-scoped and role-scoped grants carry equal weight.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pattern::ResourcePattern;

/// Resource families protected by grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Web search back-ends
    WebSearch,
    /// Vector store collections
    VectorDb,
    /// Relational tables
    Database,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WebSearch => "web_search",
            Self::VectorDb => "vector_db",
            Self::Database => "database",
        };
        f.write_str(s)
    }
}

/// Actions a grant can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Read / query
    Read,
    /// Create or update
    Write,
    /// Remove
    Delete,
}

/// Subject of a grant: a role name or a user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum GrantSubject {
    /// All users holding the role
    Role(String),
    /// One specific user
    User(String),
}

impl GrantSubject {
    fn key(&self) -> String {
        match self {
            Self::Role(name) => format!("role:{name}"),
            Self::User(id) => format!("user:{id}"),
        }
    }
}

/// A permission grant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Grant subject
    pub subject: GrantSubject,
    /// Protected resource family
    pub resource_type: ResourceType,
    /// Wildcard pattern over concrete resource names
    pub resource_pattern: ResourcePattern,
    /// Allowed actions
    pub actions: BTreeSet<Action>,
    /// Optional argument conditions: every key must equal the request
    /// argument of the same name for the grant to apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Map<String, Value>>,
    /// Creation instant
    pub granted_at: DateTime<Utc>,
    /// Optional expiry; an expired grant yields no rights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionGrant {
    /// Whether this grant applies to `(resource_type, resource, action)`
    /// under the given request arguments at `now`.
    #[must_use]
    pub fn applies(
        &self,
        resource_type: ResourceType,
        resource: &str,
        action: Action,
        arguments: &Value,
        now: DateTime<Utc>,
    ) -> bool {
        if self.resource_type != resource_type || !self.actions.contains(&action) {
            return false;
        }
        if self.expires_at.is_some_and(|exp| now >= exp) {
            return false;
        }
        if !self.resource_pattern.matches(resource) {
            return false;
        }
        match &self.conditions {
            None => true,
            Some(conditions) => conditions
                .iter()
                .all(|(key, expected)| arguments.get(key) == Some(expected)),
        }
    }
}

/// Grant storage keyed by subject.
///
/// Unique on `(subject, resource_type, resource_pattern)`; `grant` replaces
/// an existing record with the same key rather than duplicating it.
#[derive(Default)]
pub struct GrantStore {
    by_subject: DashMap<String, Vec<PermissionGrant>>,
}

impl GrantStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a grant.
    pub fn grant(&self, grant: PermissionGrant) {
        let mut grants = self.by_subject.entry(grant.subject.key()).or_default();
        grants.retain(|g| {
            !(g.resource_type == grant.resource_type
                && g.resource_pattern == grant.resource_pattern)
        });
        grants.push(grant);
    }

    /// Remove a grant. Returns `true` if it existed.
    pub fn revoke(
        &self,
        subject: &GrantSubject,
        resource_type: ResourceType,
        resource_pattern: &str,
    ) -> bool {
        let Some(mut grants) = self.by_subject.get_mut(&subject.key()) else {
            return false;
        };
        let before = grants.len();
        grants.retain(|g| {
            !(g.resource_type == resource_type
                && g.resource_pattern.as_str() == resource_pattern)
        });
        before != grants.len()
    }

    /// Grants applicable to a user: those keyed by the user id plus those
    /// keyed by any of the user's roles.
    #[must_use]
    pub fn grants_for(&self, user_id: &str, roles: &[String]) -> Vec<PermissionGrant> {
        let mut out = Vec::new();
        if let Some(grants) = self.by_subject.get(&format!("user:{user_id}")) {
            out.extend(grants.iter().cloned());
        }
        for role in roles {
            if let Some(grants) = self.by_subject.get(&format!("role:{role}")) {
                out.extend(grants.iter().cloned());
            }
        }
        out
    }

    /// Every stored grant (admin enumeration).
    #[must_use]
    pub fn list_all(&self) -> Vec<PermissionGrant> {
        let mut out: Vec<PermissionGrant> = self
            .by_subject
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.subject
                .key()
                .cmp(&b.subject.key())
                .then(a.resource_pattern.as_str().cmp(b.resource_pattern.as_str()))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(subject: GrantSubject, pattern: &str, actions: &[Action]) -> PermissionGrant {
        PermissionGrant {
            subject,
            resource_type: ResourceType::VectorDb,
            resource_pattern: ResourcePattern::parse(pattern).unwrap(),
            actions: actions.iter().copied().collect(),
            conditions: None,
            granted_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn applies_checks_type_action_pattern() {
        let g = grant(GrantSubject::Role("user".into()), "docs.*", &[Action::Read]);
        let now = Utc::now();

        assert!(g.applies(ResourceType::VectorDb, "docs.kb", Action::Read, &json!({}), now));
        assert!(!g.applies(ResourceType::Database, "docs.kb", Action::Read, &json!({}), now));
        assert!(!g.applies(ResourceType::VectorDb, "docs.kb", Action::Write, &json!({}), now));
        assert!(!g.applies(ResourceType::VectorDb, "other", Action::Read, &json!({}), now));
    }

    #[test]
    fn expired_grant_yields_no_rights() {
        let mut g = grant(GrantSubject::User("u1".into()), "*", &[Action::Read]);
        g.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!g.applies(ResourceType::VectorDb, "docs", Action::Read, &json!({}), Utc::now()));

        // Boundary: a grant expiring exactly now is already expired
        let mut g = grant(GrantSubject::User("u1".into()), "*", &[Action::Read]);
        let now = Utc::now();
        g.expires_at = Some(now);
        assert!(!g.applies(ResourceType::VectorDb, "docs", Action::Read, &json!({}), now));
    }

    #[test]
    fn conditions_compare_against_arguments() {
        let mut g = grant(GrantSubject::User("u1".into()), "*", &[Action::Read]);
        let mut conditions = serde_json::Map::new();
        conditions.insert("tenant".to_string(), json!("acme"));
        g.conditions = Some(conditions);

        let now = Utc::now();
        assert!(g.applies(
            ResourceType::VectorDb,
            "docs",
            Action::Read,
            &json!({"tenant": "acme", "query": "q"}),
            now
        ));
        assert!(!g.applies(
            ResourceType::VectorDb,
            "docs",
            Action::Read,
            &json!({"tenant": "other"}),
            now
        ));
        assert!(!g.applies(ResourceType::VectorDb, "docs", Action::Read, &json!({}), now));
    }

    #[test]
    fn store_replaces_on_same_key() {
        let store = GrantStore::new();
        let subject = GrantSubject::Role("user".into());
        store.grant(grant(subject.clone(), "docs.*", &[Action::Read]));
        store.grant(grant(subject.clone(), "docs.*", &[Action::Read, Action::Write]));

        let grants = store.grants_for("any", &["user".to_string()]);
        assert_eq!(grants.len(), 1);
        assert!(grants[0].actions.contains(&Action::Write));
    }

    #[test]
    fn grants_for_merges_user_and_role_scopes() {
        let store = GrantStore::new();
        store.grant(grant(GrantSubject::User("u1".into()), "private.*", &[Action::Read]));
        store.grant(grant(GrantSubject::Role("user".into()), "shared.*", &[Action::Read]));
        store.grant(grant(GrantSubject::Role("analyst".into()), "reports.*", &[Action::Read]));

        let grants = store.grants_for("u1", &["user".to_string()]);
        assert_eq!(grants.len(), 2);

        let grants = store.grants_for("u2", &["user".to_string(), "analyst".to_string()]);
        assert_eq!(grants.len(), 2);
    }

    #[test]
    fn revoke_removes_exact_key_only() {
        let store = GrantStore::new();
        let subject = GrantSubject::Role("user".into());
        store.grant(grant(subject.clone(), "a.*", &[Action::Read]));
        store.grant(grant(subject.clone(), "b.*", &[Action::Read]));

        assert!(store.revoke(&subject, ResourceType::VectorDb, "a.*"));
        assert!(!store.revoke(&subject, ResourceType::VectorDb, "a.*"));
        assert_eq!(store.grants_for("x", &["user".to_string()]).len(), 1);
    }
}
