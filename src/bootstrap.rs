//! Shared component assembly for both tiers.
//!
//! The Gateway and the Tool Server wire the same core: stores from DSNs,
//! the credential service, the authorization engine, the retriever
//! factory, and (on the Tool Server) the middleware pipeline. Background
//! maintenance tasks subscribe to the shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::auth::credentials::CredentialService;
use crate::auth::sessions::{InMemorySessionStore, KvSessionStore, SessionStore, spawn_reaper};
use crate::auth::users::{self, UserDirectory};
use crate::auth::{ROLE_USER, UserPrincipal};
use crate::authz::AuthorizationEngine;
use crate::authz::grants::{Action, GrantStore, GrantSubject, PermissionGrant, ResourceType};
use crate::authz::pattern::ResourcePattern;
use crate::config::Config;
use crate::dispatch::retriever::{RetrieverFactory, RetrieverKind, StaticRetriever};
use crate::dispatch::tools::default_tools;
use crate::dispatch::ToolDispatcher;
use crate::kv::{self, KvStore};
use crate::ratelimit::{RateLimiter, spawn_sweeper};
use crate::{Error, Result};

/// Sweep interval for background maintenance tasks.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Per-branch deadline for the composite search tool.
const BRANCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Core components shared by both tiers.
pub struct CoreComponents {
    /// KVStore capability
    pub kv: Arc<dyn KvStore>,
    /// Session store (C2)
    pub sessions: Arc<dyn SessionStore>,
    /// User directory (C3)
    pub directory: Arc<dyn UserDirectory>,
    /// Credential service (C1)
    pub credentials: Arc<CredentialService>,
    /// Rate limiter (C5)
    pub limiter: Arc<RateLimiter>,
}

/// Assemble the stores, credential service, and limiter from config.
pub async fn build_core(
    config: &Config,
    shutdown: &broadcast::Sender<()>,
) -> Result<CoreComponents> {
    let kv = kv::from_dsn(&config.stores.kv)?;

    // Anything that depends on the kv store must find it reachable at
    // startup, not at first use.
    let flags = config.profile.stage_flags();
    if flags.cache || config.rate.distributed || config.stores.session == "kv://" {
        kv::probe(&kv).await?;
    }

    let sessions: Arc<dyn SessionStore> = match config.stores.session.as_str() {
        "memory://" => {
            let store = Arc::new(InMemorySessionStore::new());
            spawn_reaper(Arc::clone(&store), MAINTENANCE_INTERVAL, shutdown.subscribe());
            store
        }
        "kv://" => Arc::new(KvSessionStore::new(Arc::clone(&kv))),
        other => {
            return Err(Error::Config(format!(
                "unsupported session store DSN scheme: {other}"
            )));
        }
    };

    let directory = users::from_dsn(&config.stores.users).await?;

    let credentials = Arc::new(CredentialService::new(
        &config.security.resolve_signing_key(),
        config.security.access_ttl,
        config.security.refresh_ttl,
        Arc::clone(&sessions),
    ));

    let limiter = Arc::new(RateLimiter::new(
        &config.rate,
        config.rate.distributed.then(|| Arc::clone(&kv)),
    ));
    spawn_sweeper(Arc::clone(&limiter), MAINTENANCE_INTERVAL, shutdown.subscribe());

    Ok(CoreComponents {
        kv,
        sessions,
        directory,
        credentials,
        limiter,
    })
}

/// Default retriever factory: canned in-process retrievers for every kind.
///
/// Production deployments replace these with real back-end clients before
/// building the dispatcher.
#[must_use]
pub fn default_retriever_factory() -> Arc<RetrieverFactory> {
    let mut factory = RetrieverFactory::new();
    factory.register(
        RetrieverKind::Web,
        Arc::new(StaticRetriever::new(
            RetrieverKind::Web,
            vec![
                json!({"title": "Result A", "url": "https://example.com/a"}),
                json!({"title": "Result B", "url": "https://example.com/b"}),
                json!({"title": "Result C", "url": "https://example.com/c"}),
            ],
        )),
    );
    factory.register(
        RetrieverKind::Vector,
        Arc::new(StaticRetriever::new(
            RetrieverKind::Vector,
            vec![json!({"id": "doc-1", "score": 0.92}), json!({"id": "doc-2", "score": 0.81})],
        )),
    );
    factory.register(
        RetrieverKind::Database,
        Arc::new(StaticRetriever::new(
            RetrieverKind::Database,
            vec![json!({"row": 1}), json!({"row": 2})],
        )),
    );
    Arc::new(factory)
}

/// Build the dispatcher and the authorization engine over it.
#[must_use]
pub fn build_dispatch(
    config: &Config,
    factory: Arc<RetrieverFactory>,
) -> (Arc<ToolDispatcher>, Arc<AuthorizationEngine>) {
    let dispatcher = Arc::new(ToolDispatcher::new(default_tools(factory, BRANCH_TIMEOUT)));
    let grants = Arc::new(GrantStore::new());
    seed_default_grants(&grants);
    let engine = Arc::new(AuthorizationEngine::new(
        Arc::new(dispatcher.binding_set()),
        grants,
        config.security.decision_cache_ttl,
    ));
    (dispatcher, engine)
}

/// Seed the grant store with the stock role grants.
///
/// The `user` role can read every retrieval resource; `guest` gets
/// nothing (denied by the role intersection before grants are consulted);
/// `admin` is an implicit universal grant and is never stored.
pub fn seed_default_grants(grants: &Arc<GrantStore>) {
    for resource_type in [
        ResourceType::WebSearch,
        ResourceType::VectorDb,
        ResourceType::Database,
    ] {
        grants.grant(PermissionGrant {
            subject: GrantSubject::Role(ROLE_USER.to_string()),
            resource_type,
            resource_pattern: ResourcePattern::parse("**").expect("static pattern"),
            actions: [Action::Read].into_iter().collect(),
            conditions: None,
            granted_at: chrono::Utc::now(),
            expires_at: None,
        });
    }
    info!("Seeded default role grants");
}

/// Parse the principal headers forwarded by the gateway.
#[must_use]
pub fn principal_from_headers(id: Option<&str>, roles: Option<&str>) -> Option<UserPrincipal> {
    let id = id?.trim();
    if id.is_empty() {
        return None;
    }
    let roles = roles
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    Some(UserPrincipal {
        id: id.to_string(),
        email: None,
        roles,
    })
}
