//! Per-request ambient state.
//!
//! A [`RequestContext`] is created when a request enters the server and
//! threaded through the middleware pipeline. Stages never mutate shared
//! state: they pass on augmented copies (`with_principal` after
//! authentication, and so on). Lifetime is exactly one request.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::auth::Principal;

/// Ambient value carried through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id (generated, or propagated from `X-Request-Id`)
    pub request_id: String,
    /// JSON-RPC method
    pub method: String,
    /// Client network address, when known
    pub client_addr: Option<String>,
    /// Raw bearer credential from the `Authorization` header
    pub bearer: Option<String>,
    /// Principal attached by the authentication stage
    pub principal: Principal,
    /// W3C trace context, when propagated
    pub trace_id: Option<String>,
    /// Arrival instant
    pub received_at: Instant,
    /// Optional request deadline
    pub deadline: Option<Duration>,
}

impl RequestContext {
    /// Create a context for an incoming request.
    #[must_use]
    pub fn new(method: &str, client_addr: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            client_addr,
            bearer: None,
            principal: Principal::Anonymous,
            trace_id: None,
            received_at: Instant::now(),
            deadline: None,
        }
    }

    /// Adopt a caller-provided request id (gateway-to-server propagation).
    #[must_use]
    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = request_id;
        self
    }

    /// Attach the raw bearer credential.
    #[must_use]
    pub fn with_bearer(mut self, bearer: Option<String>) -> Self {
        self.bearer = bearer;
        self
    }

    /// Attach the verified principal (authentication stage).
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    /// Attach propagated trace context.
    #[must_use]
    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Attach a deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Identity for rate limiting: the principal when authenticated,
    /// otherwise the client network address.
    #[must_use]
    pub fn rate_identity(&self) -> String {
        self.principal
            .identity()
            .map(str::to_string)
            .or_else(|| self.client_addr.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserPrincipal;

    #[test]
    fn augmentation_returns_new_values() {
        let ctx = RequestContext::new("tools/call", Some("10.0.0.1".to_string()));
        assert_eq!(ctx.principal, Principal::Anonymous);
        assert_eq!(ctx.rate_identity(), "10.0.0.1");

        let ctx = ctx.with_principal(Principal::User(UserPrincipal {
            id: "u1".to_string(),
            email: None,
            roles: vec![],
        }));
        assert_eq!(ctx.rate_identity(), "u1");
    }

    #[test]
    fn request_ids_are_unique_unless_propagated() {
        let a = RequestContext::new("tools/list", None);
        let b = RequestContext::new("tools/list", None);
        assert_ne!(a.request_id, b.request_id);

        let c = RequestContext::new("tools/list", None).with_request_id("req-1".to_string());
        assert_eq!(c.request_id, "req-1");
    }
}
