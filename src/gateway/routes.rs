//! Gateway authentication routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/auth/register` | Create an account |
//! | `POST` | `/auth/login` | Exchange email + password for a credential pair |
//! | `POST` | `/auth/refresh` | Rotate a refresh credential |
//! | `POST` | `/auth/logout` | Invalidate a refresh credential |
//! | `GET` | `/auth/me` | Principal summary for the presented access credential |
//!
//! A failed login is uniformly `AuthenticationError` with a generic
//! message: unknown user and wrong password are indistinguishable.

use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get, routing::post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{debug, info};

use crate::auth::credentials::{CredentialPair, CredentialService};
use crate::auth::users::UserDirectory;
use crate::ratelimit::RateLimiter;
use crate::{Error, Result};

use super::bearer_token;

/// Shared state for the auth routes.
#[derive(Clone)]
pub struct AuthState {
    /// User directory (C3)
    pub directory: Arc<dyn UserDirectory>,
    /// Credential service (C1)
    pub credentials: Arc<CredentialService>,
    /// Network-identity limiter bounding credential brute-force
    pub limiter: Arc<RateLimiter>,
}

/// Build the `/auth` routes.
pub fn auth_routes(state: AuthState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .with_state(state)
}

// ── Request / response bodies ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RefreshRequest {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Credential pair on the wire.
#[derive(Debug, Serialize)]
struct TokenPairResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: u64,
}

impl From<CredentialPair> for TokenPairResponse {
    fn from(pair: CredentialPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "bearer",
            expires_in: pair.expires_in,
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn register(
    State(state): State<AuthState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let user = state.directory.register(&body.email, &body.password).await?;
    info!(user_id = %user.id, "User registered");
    Ok((StatusCode::CREATED, Json(user.summary())))
}

async fn login(
    State(state): State<AuthState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    // Failed logins drain the caller's network bucket, not a user's.
    let user = match state.directory.authenticate(&body.email, &body.password).await {
        Ok(user) => user,
        Err(e) => {
            let _ = state.limiter.check(&addr.ip().to_string()).await;
            return Err(e);
        }
    };

    let pair = state.credentials.mint_pair(&user, body.device).await?;
    debug!(user_id = %user.id, "Login succeeded");
    Ok(Json(TokenPairResponse::from(pair)))
}

async fn refresh(
    State(state): State<AuthState>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse> {
    let token = body.refresh_token.ok_or(Error::Authentication)?;
    let pair = state.credentials.rotate(&token, &state.directory).await?;
    Ok(Json(TokenPairResponse::from(pair)))
}

async fn logout(
    State(state): State<AuthState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<impl IntoResponse> {
    // The refresh credential may arrive in the body or the header.
    let token = body
        .and_then(|Json(b)| b.refresh_token)
        .or_else(|| bearer_token(&headers))
        .ok_or(Error::Authentication)?;

    let jti = state.credentials.refresh_jti(&token)?;
    let revoked = state.credentials.revoke(&jti).await?;
    Ok(Json(json!({"revoked": revoked})))
}

async fn me(State(state): State<AuthState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    let token = bearer_token(&headers).ok_or(Error::Authentication)?;
    let principal = state.credentials.verify_access(&token)?;
    Ok(Json(json!({
        "id": principal.id,
        "email": principal.email,
        "roles": principal.roles,
    })))
}
