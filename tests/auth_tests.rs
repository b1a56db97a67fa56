//! End-to-end authentication tests
//!
//! Tests the credential lifecycle against the real stores:
//! - login → verified access credential
//! - refresh rotation chains
//! - logout and revocation semantics
//! - the revoked-refresh scenario (revoked ≡ expired to the caller)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_test::assert_ok;

use retrieval_gateway::auth::credentials::CredentialService;
use retrieval_gateway::auth::sessions::{InMemorySessionStore, SessionStore};
use retrieval_gateway::auth::users::{InMemoryUserDirectory, UserDirectory};
use retrieval_gateway::bootstrap::build_core;
use retrieval_gateway::config::Config;

const KEY: &str = "an-hs256-signing-key-of-32-bytes";

struct Stack {
    credentials: Arc<CredentialService>,
    directory: Arc<dyn UserDirectory>,
    sessions: Arc<InMemorySessionStore>,
}

async fn stack() -> Stack {
    let sessions = Arc::new(InMemorySessionStore::new());
    let credentials = Arc::new(CredentialService::new(
        KEY,
        Duration::from_secs(1800),
        Duration::from_secs(7 * 24 * 3600),
        Arc::clone(&sessions) as Arc<dyn SessionStore>,
    ));
    let directory: Arc<dyn UserDirectory> =
        Arc::new(InMemoryUserDirectory::new().await.unwrap());
    Stack {
        credentials,
        directory,
        sessions,
    }
}

#[tokio::test]
async fn login_yields_verifiable_pair() {
    let s = stack().await;
    let user = s.directory.register("alice@example.com", "Pw12345!").await.unwrap();

    let pair = s.credentials.mint_pair(&user, Some("cli".to_string())).await.unwrap();
    assert_eq!(pair.expires_in, 1800);

    let principal = assert_ok!(s.credentials.verify_access(&pair.access_token));
    assert_eq!(principal.id, user.id);
    assert_eq!(principal.roles, vec!["user".to_string()]);

    let record = s.credentials.verify_refresh(&pair.refresh_token).await.unwrap();
    assert_eq!(record.user_id, user.id);
    assert_eq!(record.device.as_deref(), Some("cli"));
}

#[tokio::test]
async fn revoked_refresh_scenario() {
    // Login yields (a, r); logout with r; refresh with r fails with the
    // same error an expired credential would produce.
    let s = stack().await;
    let user = s.directory.register("alice@example.com", "Pw12345!").await.unwrap();
    let pair = s.credentials.mint_pair(&user, None).await.unwrap();

    // Logout: accepts the still-valid refresh credential
    let jti = s.credentials.refresh_jti(&pair.refresh_token).unwrap();
    assert!(s.credentials.revoke(&jti).await.unwrap());

    // Refresh with the revoked credential fails
    let err = s
        .credentials
        .rotate(&pair.refresh_token, &s.directory)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AuthenticationError");
    assert_eq!(err.public_message(), "invalid credentials");

    // The access credential stays valid until it expires: revocation is a
    // refresh-chain concept.
    assert!(s.credentials.verify_access(&pair.access_token).is_ok());
}

#[tokio::test]
async fn rotation_chains_invalidate_old_credentials() {
    let s = stack().await;
    let user = s.directory.register("alice@example.com", "Pw12345!").await.unwrap();
    let pair1 = s.credentials.mint_pair(&user, None).await.unwrap();

    let pair2 = s.credentials.rotate(&pair1.refresh_token, &s.directory).await.unwrap();
    let pair3 = s.credentials.rotate(&pair2.refresh_token, &s.directory).await.unwrap();

    // Every superseded refresh credential is dead
    assert!(s.credentials.verify_refresh(&pair1.refresh_token).await.is_err());
    assert!(s.credentials.verify_refresh(&pair2.refresh_token).await.is_err());
    assert!(s.credentials.verify_refresh(&pair3.refresh_token).await.is_ok());

    // Exactly one live session remains for the user
    assert_eq!(s.sessions.list_by_user(&user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn revoke_all_ends_every_device_session() {
    let s = stack().await;
    let user = s.directory.register("alice@example.com", "Pw12345!").await.unwrap();
    let laptop = s.credentials.mint_pair(&user, Some("laptop".to_string())).await.unwrap();
    let phone = s.credentials.mint_pair(&user, Some("phone".to_string())).await.unwrap();

    assert_eq!(s.credentials.revoke_all(&user.id).await.unwrap(), 2);
    assert!(s.credentials.verify_refresh(&laptop.refresh_token).await.is_err());
    assert!(s.credentials.verify_refresh(&phone.refresh_token).await.is_err());
    // Idempotent
    assert_eq!(s.credentials.revoke_all(&user.id).await.unwrap(), 0);
}

#[tokio::test]
async fn role_changes_take_effect_on_next_mint() {
    // Session records do not embed roles; the directory is consulted at
    // mint time, so a role change shows up in the next access credential.
    let s = stack().await;
    let user = s.directory.register("alice@example.com", "Pw12345!").await.unwrap();
    let pair = s.credentials.mint_pair(&user, None).await.unwrap();

    s.directory
        .set_roles(&user.id, vec!["admin".to_string()])
        .await
        .unwrap();

    let rotated = s.credentials.rotate(&pair.refresh_token, &s.directory).await.unwrap();
    let principal = s.credentials.verify_access(&rotated.access_token).unwrap();
    assert_eq!(principal.roles, vec!["admin".to_string()]);
}

#[tokio::test]
async fn core_assembly_honors_config_ttls() {
    let mut config = Config::default();
    config.security.signing_key = KEY.to_string();
    config.security.access_ttl = Duration::from_secs(60);
    let (shutdown, _) = broadcast::channel(1);

    let core = build_core(&config, &shutdown).await.unwrap();
    let user = core.directory.register("a@b.com", "Pw12345!").await.unwrap();
    let pair = core.credentials.mint_pair(&user, None).await.unwrap();
    assert_eq!(pair.expires_in, 60);
}
