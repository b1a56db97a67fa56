//! Gateway server assembly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get, routing::post};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::credentials::CredentialService;
use crate::bootstrap::{build_core, build_dispatch, default_retriever_factory};
use crate::config::Config;
use crate::gateway::admin::{AdminState, admin_routes};
use crate::gateway::proxy::{GatewayProxy, HEADER_REQUEST_ID, HEADER_TRACEPARENT};
use crate::gateway::routes::{AuthState, auth_routes};
use crate::gateway::bearer_token;
use crate::{Error, Result};

/// The client-facing Gateway tier.
pub struct Gateway {
    config: Config,
}

#[derive(Clone)]
struct ToolsState {
    credentials: Arc<CredentialService>,
    proxy: Arc<GatewayProxy>,
}

impl Gateway {
    /// Create a gateway from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the gateway until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured
    /// address or an unrecoverable runtime error occurs.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let core = build_core(&self.config, &shutdown_tx).await?;
        // The admin surface shares the engine's grant store and cache hooks.
        let (_dispatcher, authz) = build_dispatch(&self.config, default_retriever_factory());

        let proxy = Arc::new(GatewayProxy::new(
            &self.config.upstream.tool_server_url,
            &self.config.security.resolve_trust_token(),
            self.config.upstream.request_timeout,
        )?);

        let router = Router::new()
            .route("/health", get(health))
            .route("/tools", post(proxy_tools))
            .route("/tools/{*rest}", post(proxy_tools))
            .with_state(ToolsState {
                credentials: Arc::clone(&core.credentials),
                proxy,
            })
            .merge(auth_routes(AuthState {
                directory: Arc::clone(&core.directory),
                credentials: Arc::clone(&core.credentials),
                limiter: Arc::clone(&core.limiter),
            }))
            .merge(admin_routes(AdminState {
                directory: Arc::clone(&core.directory),
                credentials: Arc::clone(&core.credentials),
                authz,
            }))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::cors::CorsLayer::permissive());

        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %addr,
            upstream = %self.config.upstream.tool_server_url,
            "Gateway listening"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// `GET /health` — liveness, no auth.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "tier": "gateway"}))
}

/// `POST /tools[/*]` — authenticate the client credential, rewrite to the
/// internal trust token, and relay the JSON-RPC body upstream.
async fn proxy_tools(
    State(state): State<ToolsState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let token = bearer_token(&headers).ok_or(Error::Authentication)?;
    let principal = state.credentials.verify_access(&token)?;

    let request_id = headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    let traceparent = headers.get(HEADER_TRACEPARENT).and_then(|v| v.to_str().ok());

    debug!(request_id = %request_id, principal = %principal.id, "Proxying tool call");
    state
        .proxy
        .forward(&principal, &request_id, traceparent, body)
        .await
}

pub(crate) async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
