//! Retrieval Gateway Library
//!
//! Two-tier access control plane fronting retrieval tools (web, vector,
//! relational) over JSON-RPC.
//!
//! # Architecture
//!
//! - **Gateway** (`gateway`): terminates client credentials, serves the
//!   `/auth/*` and `/admin/*` surfaces, and proxies `/tools` traffic to
//!   the Tool Server under an internal trust token.
//! - **Tool Server** (`server`): validates credentials, runs every call
//!   through the middleware pipeline (auth → validation → authorization →
//!   rate limit → cache → dispatch), and fans out to retriever back-ends.
//!
//! The shared core: credential issuance and revocation ([`auth`]),
//! RBAC with wildcard resource patterns ([`authz`]), the pipeline
//! ([`pipeline`]), the typed tool registry ([`dispatch`]), the result
//! cache with single-flight ([`rescache`]), and token-bucket rate limiting
//! ([`ratelimit`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod authz;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod observe;
pub mod pipeline;
pub mod protocol;
pub mod ratelimit;
pub mod rescache;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
