//! Middleware pipeline — the ordered chain every tool call traverses.
//!
//! The canonical order, outer to inner: observability, error handler,
//! request logging, validation, authentication, authorization, rate limit,
//! metrics, cache, dispatch. Profiles select a subset; the error handler
//! is always present, and every subset preserves this relative order.
//!
//! Ordering rationale: the error handler sits inside observability so a
//! failed request still produces a completed span. Validation precedes
//! authentication so malformed traffic cannot probe auth timing.
//! Authorization precedes rate limiting so unauthorized traffic does not
//! drain a legitimate principal's budget — the authentication reject path
//! separately consumes a token from the network identity's bucket to
//! bound brute-force attempts.

pub mod context;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::auth::credentials::CredentialService;
use crate::authz::{AuthorizationEngine, Decision, DenyReason};
use crate::config::{CacheConfig, StageFlags};
use crate::dispatch::{METHOD_HEALTH, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, ToolDispatcher, ToolOutput};
use crate::observe::ObserverHandle;
use crate::protocol::{JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse};
use crate::ratelimit::RateLimiter;
use crate::rescache::ResultCache;
use crate::{Error, Result};

use context::RequestContext;

/// Pipeline stages in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Trace context + whole-request timing
    Observability,
    /// Catches structured errors; always present
    ErrorHandler,
    /// Request logging with sensitive-field redaction
    Logging,
    /// Envelope and argument-schema validation
    Validation,
    /// Credential verification, principal attachment
    Authentication,
    /// Role and resource-level access decision
    Authorization,
    /// Token-bucket admission
    RateLimit,
    /// Counters and latency
    Metrics,
    /// Result cache with single-flight
    Cache,
    /// Tool dispatch (innermost)
    Dispatch,
}

/// Everything the stages need, shared across requests.
pub struct PipelineDeps {
    /// Credential service (authentication stage)
    pub credentials: Arc<CredentialService>,
    /// Authorization engine
    pub authz: Arc<AuthorizationEngine>,
    /// Rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Result cache, when the profile enables it
    pub cache: Option<Arc<ResultCache>>,
    /// Tool dispatcher
    pub dispatcher: Arc<ToolDispatcher>,
    /// Observability sink
    pub observer: ObserverHandle,
    /// Per-tool cache TTLs
    pub cache_ttls: CacheConfig,
    /// When false, public methods (tools/list, health_check) skip auth
    pub require_auth: bool,
    /// Keys redacted from request logs (case-insensitive substring)
    pub sensitive_fields: Vec<String>,
}

/// Outcome of a stage: the (possibly augmented) context plus the result.
pub struct StageOutcome {
    /// Context after inner stages ran
    pub ctx: RequestContext,
    /// Tool output or structured error
    pub result: Result<ToolOutput>,
}

/// The composed pipeline, built once at startup.
pub struct Pipeline {
    stages: Vec<Stage>,
    deps: Arc<PipelineDeps>,
}

impl Pipeline {
    /// Compose the stage list for a profile's effective flags.
    #[must_use]
    pub fn from_flags(flags: StageFlags, deps: Arc<PipelineDeps>) -> Self {
        let mut stages = vec![Stage::Observability, Stage::ErrorHandler];
        if flags.logging {
            stages.push(Stage::Logging);
        }
        if flags.validation {
            stages.push(Stage::Validation);
        }
        if flags.auth {
            stages.push(Stage::Authentication);
            stages.push(Stage::Authorization);
        }
        if flags.rate_limit {
            stages.push(Stage::RateLimit);
        }
        if flags.metrics {
            stages.push(Stage::Metrics);
        }
        if flags.cache && deps.cache.is_some() {
            stages.push(Stage::Cache);
        }
        stages.push(Stage::Dispatch);
        Self { stages, deps }
    }

    /// The composed stage order (startup logging, tests).
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run a request through the pipeline, producing the wire response.
    pub async fn execute(&self, ctx: RequestContext, request: &JsonRpcRequest) -> JsonRpcResponse {
        let outcome = self.run(0, ctx, request).await;
        let id = Some(request.id.clone());
        match outcome.result {
            Ok(output) => match output.aggregate().await {
                Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
                Err(e) => JsonRpcResponse::from_error(id, &e),
            },
            Err(e) => JsonRpcResponse::from_error(id, &e),
        }
    }

    /// Run a request and return the raw outcome (streaming endpoints).
    pub async fn execute_raw(&self, ctx: RequestContext, request: &JsonRpcRequest) -> StageOutcome {
        self.run(0, ctx, request).await
    }

    fn run<'a>(
        &'a self,
        idx: usize,
        ctx: RequestContext,
        request: &'a JsonRpcRequest,
    ) -> BoxFuture<'a, StageOutcome> {
        Box::pin(async move {
            let Some(stage) = self.stages.get(idx).copied() else {
                // The stage list always terminates in Dispatch.
                return StageOutcome {
                    ctx,
                    result: Err(Error::Internal("pipeline underrun".to_string())),
                };
            };
            match stage {
                Stage::Observability => self.observability(idx, ctx, request).await,
                Stage::ErrorHandler => self.error_handler(idx, ctx, request).await,
                Stage::Logging => self.logging(idx, ctx, request).await,
                Stage::Validation => self.validation(idx, ctx, request).await,
                Stage::Authentication => self.authentication(idx, ctx, request).await,
                Stage::Authorization => self.authorization(idx, ctx, request).await,
                Stage::RateLimit => self.rate_limit(idx, ctx, request).await,
                Stage::Metrics => self.metrics(idx, ctx, request).await,
                Stage::Cache => self.cache(idx, ctx, request).await,
                Stage::Dispatch => {
                    let result = match ctx.deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_sub(ctx.received_at.elapsed());
                            match tokio::time::timeout(
                                remaining,
                                self.deps.dispatcher.dispatch(&ctx, request),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => {
                                    debug!(request_id = %ctx.request_id, "Request deadline exceeded");
                                    Err(Error::ServiceUnavailable)
                                }
                            }
                        }
                        None => self.deps.dispatcher.dispatch(&ctx, request).await,
                    };
                    StageOutcome { ctx, result }
                }
            }
        })
    }

    // ── Stages ────────────────────────────────────────────────────────────

    async fn observability(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        let started = std::time::Instant::now();
        let out = self.run(idx + 1, ctx, request).await;

        let outcome_label = match &out.result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        let mut attributes = vec![
            ("method".to_string(), request.method.clone()),
            ("request_id".to_string(), out.ctx.request_id.clone()),
            ("outcome".to_string(), outcome_label),
        ];
        if let Some(trace_id) = &out.ctx.trace_id {
            attributes.push(("trace_id".to_string(), trace_id.clone()));
        }
        self.deps
            .observer
            .emit_span("request", attributes, started.elapsed());
        out
    }

    async fn error_handler(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        let out = self.run(idx + 1, ctx, request).await;
        if let Err(e) = &out.result {
            // Internal detail stays here; the wire sees stable messages.
            warn!(
                request_id = %out.ctx.request_id,
                kind = e.kind(),
                error = %e,
                "Request failed"
            );
            self.deps.observer.emit_error(
                e.kind(),
                &e.public_message(),
                vec![("request_id".to_string(), out.ctx.request_id.clone())],
            );
        }
        out
    }

    async fn logging(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        let redacted = request
            .params
            .as_ref()
            .map(|p| redact(p, &self.deps.sensitive_fields));
        debug!(
            request_id = %ctx.request_id,
            method = %request.method,
            params = ?redacted,
            "Request received"
        );

        let started = std::time::Instant::now();
        let out = self.run(idx + 1, ctx, request).await;

        info!(
            request_id = %out.ctx.request_id,
            method = %request.method,
            principal = out.ctx.principal.identity().unwrap_or("anonymous"),
            duration_ms = started.elapsed().as_millis() as u64,
            ok = out.result.is_ok(),
            "Request completed"
        );
        out
    }

    async fn validation(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        if request.jsonrpc != JSONRPC_VERSION {
            return StageOutcome {
                ctx,
                result: Err(Error::Validation(format!(
                    "unsupported jsonrpc version '{}'",
                    request.jsonrpc
                ))),
            };
        }
        if let Err(e) = self.deps.dispatcher.validate_request(request) {
            return StageOutcome { ctx, result: Err(e) };
        }
        self.run(idx + 1, ctx, request).await
    }

    async fn authentication(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        // Internal trust already attached a principal upstream.
        if ctx.principal != Principal::Anonymous {
            return self.run(idx + 1, ctx, request).await;
        }

        let bypass = match request.method.as_str() {
            METHOD_HEALTH => true,
            METHOD_TOOLS_LIST => !self.deps.require_auth,
            _ => false,
        };

        match ctx.bearer.clone() {
            Some(token) => match self.deps.credentials.verify_access(&token) {
                Ok(user) => {
                    let ctx = ctx.with_principal(Principal::User(user));
                    self.run(idx + 1, ctx, request).await
                }
                Err(e) => {
                    self.penalize_network(&ctx).await;
                    StageOutcome { ctx, result: Err(e) }
                }
            },
            None if bypass => self.run(idx + 1, ctx, request).await,
            None => {
                self.penalize_network(&ctx).await;
                StageOutcome {
                    ctx,
                    result: Err(Error::Authentication),
                }
            }
        }
    }

    /// Consume a token from the network identity's bucket on auth
    /// rejection, bounding credential brute-force.
    async fn penalize_network(&self, ctx: &RequestContext) {
        if let Some(addr) = &ctx.client_addr {
            let _ = self.deps.limiter.check(addr).await;
        }
    }

    async fn authorization(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        // tools/list is authorized by response filtering in the dispatcher.
        if request.method == METHOD_TOOLS_LIST {
            return self.run(idx + 1, ctx, request).await;
        }

        let Some(tool) = self.deps.dispatcher.target_tool(request) else {
            return self.run(idx + 1, ctx, request).await;
        };
        let arguments = call_arguments(request);

        match self.deps.authz.authorize(&ctx.principal, &tool, &arguments) {
            Decision::Allow => self.run(idx + 1, ctx, request).await,
            Decision::Deny(DenyReason::UnknownTool) => StageOutcome {
                ctx,
                result: Err(Error::NotFound(format!("tool '{tool}'"))),
            },
            Decision::Deny(DenyReason::Unauthenticated) => StageOutcome {
                ctx,
                result: Err(Error::Authentication),
            },
            Decision::Deny(reason) => StageOutcome {
                ctx,
                result: Err(Error::deny(reason.as_str())),
            },
        }
    }

    async fn rate_limit(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        if let Err(e) = self.deps.limiter.check(&ctx.rate_identity()).await {
            return StageOutcome { ctx, result: Err(e) };
        }
        self.run(idx + 1, ctx, request).await
    }

    async fn metrics(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        self.deps.observer.emit_counter(
            "rgw_requests_total",
            vec![("method".to_string(), request.method.clone())],
            1,
        );
        let started = std::time::Instant::now();
        let out = self.run(idx + 1, ctx, request).await;

        let status = match &out.result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.deps.observer.emit_counter(
            "rgw_responses_total",
            vec![
                ("method".to_string(), request.method.clone()),
                ("status".to_string(), status.to_string()),
            ],
            1,
        );
        self.deps.observer.emit_span(
            "dispatch",
            vec![("method".to_string(), request.method.clone())],
            started.elapsed(),
        );
        out
    }

    async fn cache(
        &self,
        idx: usize,
        ctx: RequestContext,
        request: &JsonRpcRequest,
    ) -> StageOutcome {
        let Some(cache) = self.deps.cache.as_ref() else {
            return self.run(idx + 1, ctx, request).await;
        };
        if request.method != METHOD_TOOLS_CALL {
            return self.run(idx + 1, ctx, request).await;
        }
        let Some(tool) = self.deps.dispatcher.target_tool(request) else {
            return self.run(idx + 1, ctx, request).await;
        };
        let Some(policy) = self.deps.dispatcher.descriptor(&tool).and_then(|d| d.cache) else {
            // Side-effecting and stream-unbounded tools bypass the cache.
            return self.run(idx + 1, ctx, request).await;
        };

        let arguments = call_arguments(request);
        let principal_scope = policy
            .principal_scoped
            .then(|| ctx.principal.identity().unwrap_or("anonymous").to_string());
        let fingerprint =
            ResultCache::fingerprint(&tool, principal_scope.as_deref(), &arguments);
        let ttl = self.deps.cache_ttls.ttl_for(&tool);

        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let compute_ctx = ctx.clone();
        let result = cache
            .get_or_compute(&fingerprint, ttl, async move {
                dispatcher.call_tool(&compute_ctx, &tool, arguments).await
            })
            .await;

        StageOutcome {
            ctx,
            result: result.map(ToolOutput::Value),
        }
    }
}

/// Arguments of a `tools/call` request (`Null` otherwise).
fn call_arguments(request: &JsonRpcRequest) -> Value {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Redact values whose key matches the sensitive-field list.
fn redact(value: &Value, sensitive: &[String]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                let lowered = key.to_lowercase();
                if sensitive.iter().any(|s| lowered.contains(&s.to_lowercase())) {
                    out.insert(key.clone(), Value::from("[REDACTED]"));
                } else {
                    out.insert(key.clone(), redact(val, sensitive));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact(v, sensitive)).collect()),
        other => other.clone(),
    }
}
