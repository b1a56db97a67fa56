//! Error types for the retrieval gateway
//!
//! Every error carries a stable kind string; user-visible messages are
//! stable and never include internal detail beyond the request id.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the retrieval gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Retrieval gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed envelope or params
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Missing/invalid/expired/revoked credential
    #[error("invalid credentials")]
    Authentication,

    /// Authenticated but insufficient rights
    #[error("access denied: {reason}")]
    Authorization {
        /// Stable deny reason (e.g. `role_insufficient`, `resource_forbidden`)
        reason: &'static str,
    },

    /// Rate bucket exhausted
    #[error("rate limit exceeded")]
    RateLimit {
        /// Time until the most-constrained bucket replenishes one token
        retry_after: Duration,
    },

    /// Unknown tool or resource
    #[error("not found: {0}")]
    NotFound(String),

    /// Downstream retriever failure
    #[error("retriever error: {0}")]
    Retriever(String),

    /// Tool Server unreachable from the Gateway
    #[error("upstream unavailable")]
    Gateway,

    /// Dependency saturated or unreachable
    #[error("service unavailable")]
    ServiceUnavailable,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string for logs and error envelopes.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Validation(_) => "ValidationError",
            Self::Authentication => "AuthenticationError",
            Self::Authorization { .. } => "AuthorizationError",
            Self::RateLimit { .. } => "RateLimitError",
            Self::NotFound(_) => "NotFoundError",
            Self::Retriever(_) => "RetrieverError",
            Self::Gateway => "GatewayError",
            Self::ServiceUnavailable => "ServiceUnavailableError",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "InternalError",
        }
    }

    /// Convert to a JSON-RPC error code.
    #[must_use]
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Validation(_) => rpc_codes::INVALID_PARAMS,
            Self::Authentication => rpc_codes::AUTHENTICATION,
            Self::Authorization { .. } => rpc_codes::AUTHORIZATION,
            Self::RateLimit { .. } => rpc_codes::RATE_LIMIT,
            Self::NotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::ServiceUnavailable => rpc_codes::SERVER_ERROR,
            Self::Retriever(_)
            | Self::Gateway
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Transport status for HTTP responses.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authentication => 401,
            Self::Authorization { .. } => 403,
            Self::NotFound(_) => 404,
            Self::RateLimit { .. } => 429,
            Self::Retriever(_) | Self::Gateway => 502,
            Self::ServiceUnavailable => 503,
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable message for the wire. Internal detail stays in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid request: {msg}"),
            Self::Authentication => "invalid credentials".to_string(),
            Self::Authorization { reason } => format!("access denied: {reason}"),
            Self::RateLimit { .. } => "rate limit exceeded".to_string(),
            Self::NotFound(what) => format!("not found: {what}"),
            Self::Retriever(_) => "retriever error".to_string(),
            Self::Gateway => "upstream unavailable".to_string(),
            Self::ServiceUnavailable => "service unavailable".to_string(),
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                "internal error".to_string()
            }
        }
    }

    /// Authorization deny with a stable reason.
    #[must_use]
    pub fn deny(reason: &'static str) -> Self {
        Self::Authorization { reason }
    }
}

impl From<reqwest::Error> for Error {
    fn from(_: reqwest::Error) -> Self {
        // The upstream address must never leak into a response.
        Self::Gateway
    }
}

/// JSON-RPC error codes used on the wire
pub mod rpc_codes {
    /// Parse error - invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found / unknown tool
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Missing/invalid/expired/revoked credential
    pub const AUTHENTICATION: i32 = -32040;
    /// Authenticated but insufficient rights
    pub const AUTHORIZATION: i32 = -32041;
    /// Rate bucket exhausted
    pub const RATE_LIMIT: i32 = -32045;
    /// Dependency saturated or unreachable
    pub const SERVER_ERROR: i32 = -32000;
}
