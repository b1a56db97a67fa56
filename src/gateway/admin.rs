//! Admin surface — users, sessions, and permissions.
//!
//! Read-mostly, every handler gated on the `admin` role. Mutations are
//! idempotent where possible: revoking an absent session returns a
//! zero-count success. Grant and role mutations invalidate the
//! authorization decision cache for the affected principals.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::delete, routing::get, routing::post, routing::put};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::UserPrincipal;
use crate::auth::credentials::CredentialService;
use crate::auth::users::UserDirectory;
use crate::authz::AuthorizationEngine;
use crate::authz::grants::{Action, GrantSubject, PermissionGrant, ResourceType};
use crate::authz::pattern::ResourcePattern;
use crate::{Error, Result};

use super::bearer_token;

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct AdminState {
    /// User directory (C3)
    pub directory: Arc<dyn UserDirectory>,
    /// Credential service (C1) — session enumeration and revocation
    pub credentials: Arc<CredentialService>,
    /// Authorization engine (C4) — grants and cache invalidation
    pub authz: Arc<AuthorizationEngine>,
}

/// Build the `/admin` routes.
pub fn admin_routes(state: AdminState) -> Router {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/{id}", get(get_user))
        .route("/admin/users/{id}/roles", put(set_user_roles))
        .route("/admin/users/{id}/sessions", get(list_user_sessions))
        .route("/admin/users/{id}/sessions", delete(revoke_user_sessions))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{jti}", delete(revoke_session))
        .route("/admin/permissions", get(list_permissions))
        .route("/admin/permissions", post(grant_permission))
        .route("/admin/permissions", delete(revoke_permission))
        .with_state(state)
}

/// Resolve the caller and require the admin role.
fn require_admin(state: &AdminState, headers: &HeaderMap) -> Result<UserPrincipal> {
    let token = bearer_token(headers).ok_or(Error::Authentication)?;
    let principal = state.credentials.verify_access(&token)?;
    if principal.is_admin() {
        Ok(principal)
    } else {
        Err(Error::deny("role_insufficient"))
    }
}

// ── Users ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_users(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let users = state
        .directory
        .search(&query.q, query.limit, query.offset)
        .await?;
    let summaries: Vec<_> = users.iter().map(crate::auth::users::User::summary).collect();
    Ok(Json(json!({"users": summaries})))
}

async fn get_user(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let user = state
        .directory
        .find_by_id(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
    Ok(Json(user.summary()))
}

#[derive(Debug, Deserialize)]
struct SetRolesRequest {
    roles: Vec<String>,
}

async fn set_user_roles(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SetRolesRequest>,
) -> Result<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let user = state.directory.set_roles(&id, body.roles).await?;
    // Role changes must take effect within the decision-cache window.
    state.authz.invalidate_principal(&id);
    info!(admin = %admin.id, user_id = %id, roles = ?user.roles, "Roles updated");
    Ok(Json(user.summary()))
}

// ── Sessions ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    cursor: Option<String>,
}

async fn list_sessions(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let (sessions, next_cursor) = state
        .credentials
        .sessions()
        .list_active(query.limit, query.cursor)
        .await?;
    Ok(Json(json!({"sessions": sessions, "next_cursor": next_cursor})))
}

async fn list_user_sessions(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let sessions = state.credentials.sessions().list_by_user(&id).await?;
    Ok(Json(json!({"sessions": sessions})))
}

async fn revoke_session(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(jti): Path<String>,
) -> Result<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let revoked = state.credentials.revoke(&jti).await?;
    info!(admin = %admin.id, jti = %jti, revoked, "Session revocation");
    Ok(Json(json!({"revoked": u32::from(revoked)})))
}

async fn revoke_user_sessions(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let revoked = state.credentials.revoke_all(&id).await?;
    info!(admin = %admin.id, user_id = %id, revoked, "User sessions revoked");
    Ok(Json(json!({"revoked": revoked})))
}

// ── Permissions ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GrantRequest {
    subject: GrantSubject,
    resource_type: ResourceType,
    /// Validated by [`ResourcePattern::parse`]; invalid patterns are
    /// rejected here, at grant time.
    resource_pattern: String,
    actions: BTreeSet<Action>,
    #[serde(default)]
    conditions: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

async fn list_permissions(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({"grants": state.authz.grants().list_all()})))
}

async fn grant_permission(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(body): Json<GrantRequest>,
) -> Result<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    if body.actions.is_empty() {
        return Err(Error::Validation("grant requires at least one action".to_string()));
    }
    let pattern = ResourcePattern::parse(&body.resource_pattern)?;

    let grant = PermissionGrant {
        subject: body.subject.clone(),
        resource_type: body.resource_type,
        resource_pattern: pattern,
        actions: body.actions,
        conditions: body.conditions,
        granted_at: Utc::now(),
        expires_at: body.expires_at,
    };
    state.authz.grants().grant(grant.clone());
    invalidate_for_subject(&state, &body.subject);
    info!(
        admin = %admin.id,
        subject = ?body.subject,
        pattern = %body.resource_pattern,
        "Permission granted"
    );
    Ok(Json(json!({"grant": grant})))
}

#[derive(Debug, Deserialize)]
struct RevokeGrantRequest {
    subject: GrantSubject,
    resource_type: ResourceType,
    resource_pattern: String,
}

async fn revoke_permission(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(body): Json<RevokeGrantRequest>,
) -> Result<impl IntoResponse> {
    let admin = require_admin(&state, &headers)?;
    let revoked =
        state
            .authz
            .grants()
            .revoke(&body.subject, body.resource_type, &body.resource_pattern);
    invalidate_for_subject(&state, &body.subject);
    info!(admin = %admin.id, subject = ?body.subject, revoked, "Permission revocation");
    Ok(Json(json!({"revoked": u32::from(revoked)})))
}

/// Decision-cache invalidation: precise for user subjects, global for role
/// subjects (a role change can affect any principal holding it).
fn invalidate_for_subject(state: &AdminState, subject: &GrantSubject) {
    match subject {
        GrantSubject::User(id) => state.authz.invalidate_principal(id),
        GrantSubject::Role(_) => state.authz.invalidate_all(),
    }
}
