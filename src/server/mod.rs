//! Tool Server tier — the JSON-RPC endpoint behind the gateway.
//!
//! A single `/rpc` endpoint (plus `/rpc/stream` for tools emitting
//! sequences and `/health` for liveness). Requests bearing the internal
//! trust token have their principal headers trusted and skip the
//! authentication stage; anything else goes through the full pipeline,
//! which supports direct calls with an access credential.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get, routing::post};
use futures::StreamExt;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::auth::Principal;
use crate::bootstrap::{build_core, build_dispatch, default_retriever_factory, principal_from_headers};
use crate::config::Config;
use crate::dispatch::ToolOutput;
use crate::error::rpc_codes;
use crate::gateway::bearer_token;
use crate::gateway::server::shutdown_signal;
use crate::gateway::proxy::{
    HEADER_PRINCIPAL_ID, HEADER_PRINCIPAL_ROLES, HEADER_REQUEST_ID, HEADER_TRACEPARENT,
};
use crate::observe::TracingObserver;
use crate::pipeline::context::RequestContext;
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::rescache::ResultCache;
use crate::{Error, Result};

/// The Tool Server tier.
pub struct ToolServer {
    config: Config,
}

#[derive(Clone)]
struct ServerState {
    pipeline: Arc<Pipeline>,
    trust_token: Arc<str>,
}

impl ToolServer {
    /// Create a tool server from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the tool server until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured
    /// address or an unrecoverable runtime error occurs.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let core = build_core(&self.config, &shutdown_tx).await?;
        let (dispatcher, authz) = build_dispatch(&self.config, default_retriever_factory());

        let flags = self.config.profile.stage_flags();
        let cache = flags.cache.then(|| {
            let cache = Arc::new(ResultCache::new(Arc::clone(&core.kv)));
            crate::rescache::spawn_maintenance(
                Arc::clone(&cache),
                std::time::Duration::from_secs(60),
                shutdown_tx.subscribe(),
            );
            cache
        });

        let deps = Arc::new(PipelineDeps {
            credentials: Arc::clone(&core.credentials),
            authz,
            limiter: Arc::clone(&core.limiter),
            cache,
            dispatcher,
            observer: Arc::new(TracingObserver),
            cache_ttls: self.config.cache.clone(),
            require_auth: self.config.security.require_auth,
            sensitive_fields: self.config.security.sensitive_fields.clone(),
        });
        let pipeline = Arc::new(Pipeline::from_flags(flags, deps));
        info!(stages = ?pipeline.stages(), "Pipeline composed");

        let state = ServerState {
            pipeline,
            trust_token: self.config.security.resolve_trust_token().into(),
        };

        let router = Router::new()
            .route("/health", get(health))
            .route("/rpc", post(rpc))
            .route("/rpc/stream", post(rpc_stream))
            .with_state(state)
            .layer(tower_http::trace::TraceLayer::new_for_http());

        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Tool Server listening");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

        info!("Tool Server shutdown complete");
        Ok(())
    }
}

/// `GET /health` — liveness, no auth.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "tier": "tool-server"}))
}

/// `POST /rpc` — the JSON-RPC endpoint.
async fn rpc(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Unparseable JSON-RPC body");
            let envelope = JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, "parse error");
            return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
        }
    };

    let ctx = build_context(&state, &headers, addr, &request);
    let outcome = state.pipeline.execute_raw(ctx, &request).await;
    match outcome.result {
        Ok(output) => match output.aggregate().await {
            Ok(value) => {
                let envelope = JsonRpcResponse::success(request.id.clone(), value);
                (StatusCode::OK, Json(envelope)).into_response()
            }
            Err(e) => error_response(&request, &e),
        },
        Err(e) => error_response(&request, &e),
    }
}

/// `POST /rpc/stream` — server-streamed variant: newline-delimited JSON
/// items for tools yielding sequences.
async fn rpc_stream(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            let envelope = JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, "parse error");
            return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
        }
    };

    let ctx = build_context(&state, &headers, addr, &request);
    let outcome = state.pipeline.execute_raw(ctx, &request).await;
    match outcome.result {
        Ok(ToolOutput::Stream(stream)) => {
            let lines = stream.map(|item| {
                let line = match item {
                    Ok(value) => format!("{value}\n"),
                    Err(e) => {
                        format!(
                            "{}\n",
                            json!({"error": {"kind": e.kind(), "message": e.public_message()}})
                        )
                    }
                };
                Ok::<_, std::convert::Infallible>(Bytes::from(line))
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/x-ndjson")
                .body(Body::from_stream(lines))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(ToolOutput::Value(value)) => {
            let line = format!("{value}\n");
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/x-ndjson")
                .body(Body::from(line))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => error_response(&request, &e),
    }
}

fn error_response(request: &JsonRpcRequest, err: &Error) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = JsonRpcResponse::from_error(Some(request.id.clone()), err);
    (status, Json(envelope)).into_response()
}

/// Build the request context, honoring the internal trust token.
fn build_context(
    state: &ServerState,
    headers: &HeaderMap,
    addr: SocketAddr,
    request: &JsonRpcRequest,
) -> RequestContext {
    let mut ctx = RequestContext::new(&request.method, Some(addr.ip().to_string()));

    if let Some(request_id) = headers.get(HEADER_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_request_id(request_id.to_string());
    }
    let trace = headers
        .get(HEADER_TRACEPARENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ctx = ctx.with_trace(trace);

    if let Some(ms) = headers
        .get("x-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        ctx = ctx.with_deadline(std::time::Duration::from_millis(ms));
    }

    let bearer = bearer_token(headers);
    let is_internal = bearer
        .as_deref()
        .is_some_and(|b| bool::from(b.as_bytes().ct_eq(state.trust_token.as_bytes())));

    if is_internal {
        // Gateway-verified principal rides in headers; authentication is
        // skipped, authorization onward still runs.
        let principal = principal_from_headers(
            headers.get(HEADER_PRINCIPAL_ID).and_then(|v| v.to_str().ok()),
            headers.get(HEADER_PRINCIPAL_ROLES).and_then(|v| v.to_str().ok()),
        )
        .map_or(Principal::Service, Principal::User);
        ctx.with_principal(principal)
    } else {
        ctx.with_bearer(bearer)
    }
}
