//! Gateway tier — client-facing auth, admin surface, and tool proxy.
//!
//! The gateway terminates client credentials, exposes the `/auth/*` and
//! `/admin/*` surfaces, and forwards `/tools` JSON-RPC traffic to the Tool
//! Server under the internal trust token.

pub mod admin;
pub mod proxy;
pub mod routes;
pub mod server;

pub use server::Gateway;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::Error;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.public_message(),
            }
        });
        if let Error::RateLimit { retry_after } = &self {
            body["error"]["retry_after"] = json!(retry_after.as_secs_f64().ceil() as u64);
        }
        if let Error::Authorization { reason } = &self {
            body["error"]["reason"] = json!(reason);
        }

        let mut response = (status, Json(body)).into_response();
        match &self {
            Error::Authentication => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Error::RateLimit { retry_after } => {
                let secs = retry_after.as_secs_f64().ceil() as u64;
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            _ => {}
        }
        response
    }
}

/// Extract the bearer token from an `Authorization` header value.
#[must_use]
pub(crate) fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::to_string)
}
