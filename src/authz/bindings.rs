//! Tool bindings — static mapping from tool names to required permissions.
//!
//! Every dispatchable tool carries exactly one binding, or is explicitly
//! public. The registry is assembled once at startup from the tool
//! descriptors and never mutated.

use std::collections::HashMap;

use crate::auth::ROLE_ADMIN;

use super::grants::{Action, ResourceType};

/// Access class of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAccess {
    /// Callable without a principal (e.g. `health_check`)
    Public,
    /// Requires an authenticated principal meeting the binding
    Authenticated(ToolBinding),
    /// Requires the admin role in addition to the binding
    Admin(ToolBinding),
}

impl ToolAccess {
    /// The binding, when the tool is not public.
    #[must_use]
    pub fn binding(&self) -> Option<&ToolBinding> {
        match self {
            Self::Public => None,
            Self::Authenticated(b) | Self::Admin(b) => Some(b),
        }
    }
}

/// Required resource, action, and minimum roles for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    /// Protected resource family
    pub resource_type: ResourceType,
    /// Action the tool performs
    pub action: Action,
    /// Roles allowed to attempt the call (intersection test)
    pub minimum_roles: Vec<String>,
}

impl ToolBinding {
    /// Binding for a read tool callable by `user` and `admin`.
    #[must_use]
    pub fn read(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            action: Action::Read,
            minimum_roles: vec!["user".to_string(), ROLE_ADMIN.to_string()],
        }
    }
}

/// One registered binding: access class plus where the concrete resource
/// name comes from.
#[derive(Debug, Clone)]
pub struct BoundTool {
    /// Access class and binding
    pub access: ToolAccess,
    /// Argument that names the concrete resource (`None` means `*`)
    pub resource_arg: Option<&'static str>,
}

/// Immutable name → binding registry.
#[derive(Debug, Default)]
pub struct BindingSet {
    bindings: HashMap<&'static str, BoundTool>,
}

impl BindingSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool binding. Panics on duplicate names: the registry is
    /// built from static descriptors at startup, where a duplicate is a
    /// programming error.
    pub fn insert(&mut self, name: &'static str, bound: BoundTool) {
        let previous = self.bindings.insert(name, bound);
        assert!(previous.is_none(), "duplicate tool binding: {name}");
    }

    /// Look up a tool's binding.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BoundTool> {
        self.bindings.get(name)
    }

    /// Derive the concrete resource name for a call from its arguments.
    ///
    /// Tools without an argument-derived resource use `*`.
    #[must_use]
    pub fn resource_name(&self, name: &str, arguments: &serde_json::Value) -> String {
        self.get(name)
            .and_then(|b| b.resource_arg)
            .and_then(|arg| arguments.get(arg))
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string()
    }
}
