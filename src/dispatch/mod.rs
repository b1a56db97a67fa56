//! Tool dispatcher — typed registry and JSON-RPC method dispatch.
//!
//! Tools are registered once at startup as [`ToolHandler`] values carrying
//! a [`ToolDescriptor`]: access class, argument schema, resource binding,
//! and cache policy. Dispatch is a typed lookup, never a stringly-typed
//! chain of `if` tests.

pub mod retriever;
pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::authz::bindings::{BindingSet, BoundTool, ToolAccess};
use crate::pipeline::context::RequestContext;
use crate::protocol::{JsonRpcRequest, ToolSummary, ToolsCallParams, ToolsListResult};
use crate::{Error, Result};

use retriever::{ResultStream, collect_stream};

/// JSON-RPC method for tool enumeration.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// JSON-RPC method for tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// JSON-RPC method alias for the public health tool.
pub const METHOD_HEALTH: &str = "health_check";

// ── Argument schemas ──────────────────────────────────────────────────────

/// Declared type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// JSON string
    String,
    /// JSON integer
    Integer,
    /// JSON object
    Object,
}

impl ArgKind {
    fn json_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Object => "object",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Object => value.is_object(),
        }
    }
}

/// One declared argument.
#[derive(Debug, Clone)]
pub struct ArgField {
    /// Argument name
    pub name: &'static str,
    /// Expected JSON type
    pub kind: ArgKind,
    /// Whether the argument must be present
    pub required: bool,
}

/// Declarative argument schema for a tool.
#[derive(Debug, Clone, Default)]
pub struct ArgumentSchema {
    /// Declared fields
    pub fields: Vec<ArgField>,
}

impl ArgumentSchema {
    /// Validate call arguments against the schema.
    ///
    /// Unknown keys are rejected so that a typo'd argument fails fast
    /// instead of being silently ignored.
    pub fn validate(&self, arguments: &Value) -> Result<()> {
        let empty = Map::new();
        let object = match arguments {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => {
                return Err(Error::Validation("arguments must be an object".to_string()));
            }
        };

        for field in &self.fields {
            match object.get(field.name) {
                Some(value) => {
                    if !field.kind.accepts(value) {
                        return Err(Error::Validation(format!(
                            "argument '{}' must be a {}",
                            field.name,
                            field.kind.json_name()
                        )));
                    }
                }
                None if field.required => {
                    return Err(Error::Validation(format!(
                        "missing required argument '{}'",
                        field.name
                    )));
                }
                None => {}
            }
        }

        for key in object.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                return Err(Error::Validation(format!("unknown argument '{key}'")));
            }
        }
        Ok(())
    }

    /// JSON Schema rendering for `tools/list`.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            properties.insert(
                field.name.to_string(),
                json!({"type": field.kind.json_name()}),
            );
            if field.required {
                required.push(Value::from(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ── Descriptors and handlers ──────────────────────────────────────────────

/// Cache eligibility, a static property of the tool binding.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Include the principal in the fingerprint (results vary per user)
    pub principal_scoped: bool,
}

/// Static declaration of one tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Tool name (JSON-RPC `params.name`)
    pub name: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Access class and permission binding
    pub access: ToolAccess,
    /// Argument naming the concrete resource, if any
    pub resource_arg: Option<&'static str>,
    /// Declared argument schema
    pub schema: ArgumentSchema,
    /// Cache eligibility; `None` bypasses the cache
    pub cache: Option<CachePolicy>,
}

/// Output of a tool invocation.
pub enum ToolOutput {
    /// A complete value
    Value(Value),
    /// A finite, non-restartable stream of items
    Stream(ResultStream),
}

impl ToolOutput {
    /// Materialize the output into a single value.
    ///
    /// Streams are drained into `{"results": [...], "count": n}`.
    pub async fn aggregate(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(stream) => {
                let items = collect_stream(stream).await?;
                Ok(json!({"count": items.len(), "results": items}))
            }
        }
    }
}

/// A registered tool implementation.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    /// The tool's static descriptor.
    fn descriptor(&self) -> &ToolDescriptor;

    /// Invoke the tool.
    async fn call(&self, ctx: &RequestContext, arguments: Value) -> Result<ToolOutput>;
}

// ── Dispatcher ────────────────────────────────────────────────────────────

/// Maps JSON-RPC methods and tool names onto handlers.
pub struct ToolDispatcher {
    tools: HashMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolDispatcher {
    /// Build a dispatcher from handlers. Panics on duplicate tool names
    /// (startup-time programming error).
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        let mut tools: HashMap<&'static str, Arc<dyn ToolHandler>> = HashMap::new();
        for handler in handlers {
            let name = handler.descriptor().name;
            let previous = tools.insert(name, handler);
            assert!(previous.is_none(), "duplicate tool name: {name}");
        }
        Self { tools }
    }

    /// Assemble the binding registry for the authorization engine.
    #[must_use]
    pub fn binding_set(&self) -> BindingSet {
        let mut set = BindingSet::new();
        for handler in self.tools.values() {
            let descriptor = handler.descriptor();
            set.insert(
                descriptor.name,
                BoundTool {
                    access: descriptor.access.clone(),
                    resource_arg: descriptor.resource_arg,
                },
            );
        }
        set
    }

    /// Look up a tool descriptor.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|h| h.descriptor())
    }

    /// Whether a JSON-RPC method is dispatchable.
    #[must_use]
    pub fn method_exists(&self, method: &str) -> bool {
        matches!(method, METHOD_TOOLS_LIST | METHOD_TOOLS_CALL | METHOD_HEALTH)
    }

    /// Validate a request's params early (Validation middleware).
    pub fn validate_request(&self, request: &JsonRpcRequest) -> Result<()> {
        match request.method.as_str() {
            METHOD_TOOLS_LIST | METHOD_HEALTH => Ok(()),
            METHOD_TOOLS_CALL => {
                let params = self.parse_call_params(request)?;
                let descriptor = self
                    .descriptor(&params.name)
                    .ok_or_else(|| Error::NotFound(format!("tool '{}'", params.name)))?;
                descriptor.schema.validate(&params.arguments)
            }
            other => Err(Error::NotFound(format!("method '{other}'"))),
        }
    }

    /// Tool name targeted by a request (`None` for non-call methods).
    #[must_use]
    pub fn target_tool(&self, request: &JsonRpcRequest) -> Option<String> {
        match request.method.as_str() {
            METHOD_HEALTH => Some(METHOD_HEALTH.to_string()),
            METHOD_TOOLS_CALL => self.parse_call_params(request).ok().map(|p| p.name),
            _ => None,
        }
    }

    /// Tools visible to a principal, filtered by the static bindings.
    #[must_use]
    pub fn visible_tools(&self, principal: &crate::auth::Principal) -> ToolsListResult {
        let mut tools: Vec<ToolSummary> = self
            .tools
            .values()
            .map(|h| h.descriptor())
            .filter(|d| match &d.access {
                ToolAccess::Public => true,
                ToolAccess::Authenticated(binding) => principal.user().is_some_and(|u| {
                    u.is_admin()
                        || u.roles
                            .iter()
                            .any(|r| binding.minimum_roles.iter().any(|m| m == r))
                }),
                ToolAccess::Admin(_) => principal.user().is_some_and(crate::auth::UserPrincipal::is_admin),
            })
            .map(|d| ToolSummary {
                name: d.name.to_string(),
                description: d.description.to_string(),
                input_schema: d.schema.to_json_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        ToolsListResult { tools }
    }

    /// Dispatch a validated, authorized request.
    pub async fn dispatch(&self, ctx: &RequestContext, request: &JsonRpcRequest) -> Result<ToolOutput> {
        match request.method.as_str() {
            METHOD_TOOLS_LIST => {
                let listing = self.visible_tools(&ctx.principal);
                Ok(ToolOutput::Value(serde_json::to_value(listing)?))
            }
            METHOD_HEALTH => self.invoke(ctx, METHOD_HEALTH, Value::Null).await,
            METHOD_TOOLS_CALL => {
                let params = self.parse_call_params(request)?;
                self.invoke(ctx, &params.name, params.arguments).await
            }
            other => Err(Error::NotFound(format!("method '{other}'"))),
        }
    }

    /// Invoke a tool by name, aggregating any stream output.
    pub async fn call_tool(&self, ctx: &RequestContext, name: &str, arguments: Value) -> Result<Value> {
        self.invoke(ctx, name, arguments).await?.aggregate().await
    }

    async fn invoke(&self, ctx: &RequestContext, name: &str, arguments: Value) -> Result<ToolOutput> {
        let handler = self
            .tools
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        handler.call(ctx, arguments).await
    }

    fn parse_call_params(&self, request: &JsonRpcRequest) -> Result<ToolsCallParams> {
        let params = request
            .params
            .clone()
            .ok_or_else(|| Error::Validation("tools/call requires params".to_string()))?;
        serde_json::from_value(params)
            .map_err(|e| Error::Validation(format!("malformed tools/call params: {e}")))
    }
}
