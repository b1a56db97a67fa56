//! Authorization engine — role and resource-level access decisions.
//!
//! The decision procedure, in order: resolve the tool binding (unknown
//! tool denies), public tools allow, anonymous principals deny, the role
//! intersection test, the implicit admin allow, then grant evaluation
//! against the concrete resource name derived from the call arguments.
//! Grants are strictly additive; user-scoped and role-scoped grants are
//! treated equally.
//!
//! Decisions may be cached per `(principal, tool, resource)` for a short
//! window; any grant or role mutation for a principal invalidates that
//! principal's entries.

pub mod bindings;
pub mod grants;
pub mod pattern;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::auth::Principal;

use bindings::{BindingSet, ToolAccess};
use grants::GrantStore;

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed
    Allow,
    /// The call is denied with a stable reason
    Deny(DenyReason),
}

/// Stable deny reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No binding exists for the tool name
    UnknownTool,
    /// No principal attached to the request
    Unauthenticated,
    /// Principal's roles do not intersect the tool's minimum roles
    RoleInsufficient,
    /// No applicable grant matched the concrete resource
    ResourceForbidden,
}

impl DenyReason {
    /// Stable string for error envelopes and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::Unauthenticated => "unauthenticated",
            Self::RoleInsufficient => "role_insufficient",
            Self::ResourceForbidden => "resource_forbidden",
        }
    }
}

/// Evaluates access decisions for tool calls.
pub struct AuthorizationEngine {
    bindings: Arc<BindingSet>,
    grants: Arc<GrantStore>,
    decision_cache: DashMap<(String, String, String), (Decision, Instant)>,
    cache_ttl: Duration,
}

impl AuthorizationEngine {
    /// Create an engine over a binding registry and grant store.
    #[must_use]
    pub fn new(bindings: Arc<BindingSet>, grants: Arc<GrantStore>, cache_ttl: Duration) -> Self {
        Self {
            bindings,
            grants,
            decision_cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// The grant store (admin surface mutations go through this).
    #[must_use]
    pub fn grants(&self) -> &Arc<GrantStore> {
        &self.grants
    }

    /// The binding registry.
    #[must_use]
    pub fn bindings(&self) -> &Arc<BindingSet> {
        &self.bindings
    }

    /// Decide whether `principal` may invoke `tool_name` with `arguments`.
    #[must_use]
    pub fn authorize(&self, principal: &Principal, tool_name: &str, arguments: &Value) -> Decision {
        // 1. Resolve the binding; unknown tool denies.
        let Some(bound) = self.bindings.get(tool_name) else {
            return Decision::Deny(DenyReason::UnknownTool);
        };

        // 2. Public tools allow unconditionally.
        let binding = match &bound.access {
            ToolAccess::Public => return Decision::Allow,
            ToolAccess::Authenticated(b) | ToolAccess::Admin(b) => b,
        };

        // 3. Anonymous principals deny.
        let Some(user) = principal.user() else {
            return Decision::Deny(DenyReason::Unauthenticated);
        };

        // 4. Role intersection test.
        let meets_roles = user
            .roles
            .iter()
            .any(|r| binding.minimum_roles.iter().any(|m| m == r));
        if !meets_roles {
            return Decision::Deny(DenyReason::RoleInsufficient);
        }
        if matches!(bound.access, ToolAccess::Admin(_)) && !user.is_admin() {
            return Decision::Deny(DenyReason::RoleInsufficient);
        }

        // 5. Admin holds an implicit `*` grant with all actions.
        if user.is_admin() {
            return Decision::Allow;
        }

        // 6. Concrete resource name from arguments (or `*`).
        let resource = self.bindings.resource_name(tool_name, arguments);

        let cache_key = (user.id.clone(), tool_name.to_string(), resource.clone());
        if let Some(entry) = self.decision_cache.get(&cache_key) {
            let (decision, cached_at) = *entry;
            if cached_at.elapsed() < self.cache_ttl {
                return decision;
            }
        }

        // 7-9. Grant evaluation.
        let now = Utc::now();
        let allowed = self
            .grants
            .grants_for(&user.id, &user.roles)
            .iter()
            .any(|g| g.applies(binding.resource_type, &resource, binding.action, arguments, now));

        let decision = if allowed {
            Decision::Allow
        } else {
            debug!(
                user = %user.id,
                tool = %tool_name,
                resource = %resource,
                "No applicable grant"
            );
            Decision::Deny(DenyReason::ResourceForbidden)
        };

        self.decision_cache.insert(cache_key, (decision, Instant::now()));
        decision
    }

    /// Drop cached decisions for one principal. Called on any grant or
    /// role change affecting that principal.
    pub fn invalidate_principal(&self, principal_id: &str) {
        self.decision_cache.retain(|(id, _, _), _| id != principal_id);
    }

    /// Drop every cached decision (role-scoped grant changes).
    pub fn invalidate_all(&self) {
        self.decision_cache.clear();
    }
}
