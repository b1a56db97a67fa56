//! Gateway → Tool Server proxy.
//!
//! Forwards JSON-RPC bodies upstream carrying the internal trust token and
//! the verified principal as structured headers. Streaming upstream
//! responses are relayed without buffering. Transport failures map to
//! [`Error::Gateway`]; the upstream address appears only in logs.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::{debug, warn};

use crate::auth::UserPrincipal;
use crate::{Error, Result};

/// Header carrying the verified principal id.
pub const HEADER_PRINCIPAL_ID: &str = "x-principal-id";
/// Header carrying the principal's roles, comma-joined.
pub const HEADER_PRINCIPAL_ROLES: &str = "x-principal-roles";
/// Header carrying the request correlation id.
pub const HEADER_REQUEST_ID: &str = "x-request-id";
/// W3C trace context header.
pub const HEADER_TRACEPARENT: &str = "traceparent";

/// Proxy client for the Tool Server.
pub struct GatewayProxy {
    client: reqwest::Client,
    upstream_url: String,
    trust_token: String,
}

impl GatewayProxy {
    /// Create a proxy for the configured upstream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the HTTP client cannot be built.
    pub fn new(upstream_url: &str, trust_token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("proxy client: {e}")))?;
        Ok(Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            trust_token: trust_token.to_string(),
        })
    }

    /// Forward a JSON-RPC body to the Tool Server, relaying the response
    /// stream.
    pub async fn forward(
        &self,
        principal: &UserPrincipal,
        request_id: &str,
        traceparent: Option<&str>,
        body: Bytes,
    ) -> Result<Response> {
        let url = format!("{}/rpc", self.upstream_url);
        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.trust_token))
            .header(HEADER_PRINCIPAL_ID, &principal.id)
            .header(HEADER_PRINCIPAL_ROLES, principal.roles.join(","))
            .header(HEADER_REQUEST_ID, request_id)
            .body(body);
        if let Some(trace) = traceparent {
            request = request.header(HEADER_TRACEPARENT, trace);
        }

        let upstream = request.send().await.map_err(|e| {
            // Keep the address out of the error; it lives in logs only.
            warn!(error = %e, upstream = %self.upstream_url, "Tool Server unreachable");
            Error::Gateway
        })?;

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        debug!(status = %status, request_id = %request_id, "Relaying upstream response");

        let mut response = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if name == "content-type" || name == "content-length" {
                response = response.header(name, value);
            }
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::Internal(format!("relay response: {e}")))
    }
}
