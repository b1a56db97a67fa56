//! User directory — users, password hashes, role assignments.
//!
//! Password hashing uses argon2 (adaptive, salted). Hashing and
//! verification run on the blocking pool so the async runtime is never
//! stalled. `authenticate` verifies against a dummy hash when the email is
//! unknown, keeping its timing comparable for present and absent accounts.

use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::auth::ROLE_USER;
use crate::{Error, Result};

/// A stored user account.
///
/// The password hash is deliberately private to this module; external
/// consumers see [`UserSummary`].
#[derive(Debug, Clone)]
pub struct User {
    /// Opaque user id (UUID v4)
    pub id: String,
    /// Unique, case-folded email
    pub email: String,
    /// Assigned role names (never empty; defaults to `user`)
    pub roles: Vec<String>,
    /// Soft-delete flag
    pub active: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last mutation instant
    pub updated_at: DateTime<Utc>,
    password_hash: String,
}

impl User {
    /// Public view of this account (no password hash).
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            active: self.active,
            created_at: self.created_at,
        }
    }
}

/// Public view of a user account.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    /// Opaque user id
    pub id: String,
    /// Email
    pub email: String,
    /// Role names
    pub roles: Vec<String>,
    /// Soft-delete flag
    pub active: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Trait abstracting the user storage backend.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Create a user. Fails on duplicate email or policy violation.
    async fn register(&self, email: &str, password: &str) -> Result<User>;

    /// Verify email + password. Failure is uniformly
    /// [`Error::Authentication`] (unknown user, wrong password, and
    /// deactivated account are indistinguishable to the caller).
    async fn authenticate(&self, email: &str, password: &str) -> Result<User>;

    /// Look up by id.
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>>;

    /// Look up by email (case-folded).
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Substring search on email, ordered by creation time.
    async fn search(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<User>>;

    /// Replace a user's role set. An empty set falls back to `user`.
    async fn set_roles(&self, user_id: &str, roles: Vec<String>) -> Result<User>;

    /// Activate or deactivate an account.
    async fn set_active(&self, user_id: &str, active: bool) -> Result<User>;

    /// Change a password after verifying the current one.
    async fn change_password(&self, user_id: &str, current: &str, new: &str) -> Result<()>;
}

/// Enforce the registration password policy.
///
/// Minimum 8 characters, at least one uppercase, one lowercase, one digit.
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        return Err(Error::Validation(
            "password must be at least 8 characters".to_string(),
        ));
    }
    if !password.chars().any(char::is_uppercase) {
        return Err(Error::Validation(
            "password must contain an uppercase letter".to_string(),
        ));
    }
    if !password.chars().any(char::is_lowercase) {
        return Err(Error::Validation(
            "password must contain a lowercase letter".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(
            "password must contain a digit".to_string(),
        ));
    }
    Ok(())
}

async fn hash_password(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| Error::Internal(format!("hashing task panicked: {e}")))?
}

async fn verify_password(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

/// In-memory user directory backed by a `DashMap` with an email index.
pub struct InMemoryUserDirectory {
    by_id: DashMap<String, User>,
    email_index: DashMap<String, String>,
    /// Verified against when the email is unknown, so authentication timing
    /// does not reveal whether an account exists.
    dummy_hash: String,
}

impl InMemoryUserDirectory {
    /// Create an empty directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the dummy hash cannot be computed.
    pub async fn new() -> Result<Self> {
        let dummy_hash = hash_password(Uuid::new_v4().to_string()).await?;
        Ok(Self {
            by_id: DashMap::new(),
            email_index: DashMap::new(),
            dummy_hash,
        })
    }

    fn fold(email: &str) -> String {
        email.trim().to_lowercase()
    }
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn register(&self, email: &str, password: &str) -> Result<User> {
        validate_password(password)?;
        let email = Self::fold(email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Validation("invalid email address".to_string()));
        }

        let password_hash = hash_password(password.to_string()).await?;
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            roles: vec![ROLE_USER.to_string()],
            active: true,
            created_at: now,
            updated_at: now,
            password_hash,
        };

        // The email index insert is the uniqueness commit point.
        match self.email_index.entry(email) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Validation("email already registered".to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(user.id.clone());
            }
        }
        self.by_id.insert(user.id.clone(), user.clone());
        debug!(user_id = %user.id, "Registered user");
        Ok(user)
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let email = Self::fold(email);
        let user = self
            .email_index
            .get(&email)
            .and_then(|id| self.by_id.get(id.value()).map(|u| u.clone()));

        match user {
            Some(user) => {
                let ok = verify_password(password.to_string(), user.password_hash.clone()).await;
                if ok && user.active {
                    Ok(user)
                } else {
                    Err(Error::Authentication)
                }
            }
            None => {
                // Dummy verification keeps timing comparable.
                let _ = verify_password(password.to_string(), self.dummy_hash.clone()).await;
                Err(Error::Authentication)
            }
        }
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.by_id.get(user_id).map(|u| u.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = Self::fold(email);
        Ok(self
            .email_index
            .get(&email)
            .and_then(|id| self.by_id.get(id.value()).map(|u| u.clone())))
    }

    async fn search(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<User>> {
        let needle = query.to_lowercase();
        let mut matches: Vec<User> = self
            .by_id
            .iter()
            .filter(|u| u.value().email.contains(&needle))
            .map(|u| u.value().clone())
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_roles(&self, user_id: &str, roles: Vec<String>) -> Result<User> {
        let mut entry = self
            .by_id
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        entry.roles = if roles.is_empty() {
            vec![ROLE_USER.to_string()]
        } else {
            roles
        };
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn set_active(&self, user_id: &str, active: bool) -> Result<User> {
        let mut entry = self
            .by_id
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        entry.active = active;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn change_password(&self, user_id: &str, current: &str, new: &str) -> Result<()> {
        validate_password(new)?;
        let existing_hash = self
            .by_id
            .get(user_id)
            .map(|u| u.password_hash.clone())
            .ok_or(Error::Authentication)?;

        if !verify_password(current.to_string(), existing_hash).await {
            return Err(Error::Authentication);
        }

        let new_hash = hash_password(new.to_string()).await?;
        let mut entry = self.by_id.get_mut(user_id).ok_or(Error::Authentication)?;
        entry.password_hash = new_hash;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

/// Construct a user directory from a DSN.
pub async fn from_dsn(dsn: &str) -> Result<Arc<dyn UserDirectory>> {
    if dsn == "memory://" {
        Ok(Arc::new(InMemoryUserDirectory::new().await?))
    } else {
        Err(Error::Config(format!(
            "unsupported user directory DSN scheme: {dsn}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_PW: &str = "Pw12345!";

    async fn directory() -> InMemoryUserDirectory {
        InMemoryUserDirectory::new().await.unwrap()
    }

    #[test]
    fn password_policy_rejects_weak_passwords() {
        assert!(validate_password("Pw1").is_err()); // too short
        assert!(validate_password("alllowercase1").is_err());
        assert!(validate_password("ALLUPPERCASE1").is_err());
        assert!(validate_password("NoDigitsHere").is_err());
        assert!(validate_password(GOOD_PW).is_ok());
    }

    #[tokio::test]
    async fn register_and_authenticate() {
        let dir = directory().await;
        let user = dir.register("alice@example.com", GOOD_PW).await.unwrap();
        assert_eq!(user.roles, vec![ROLE_USER.to_string()]);
        assert!(user.active);

        let authed = dir.authenticate("alice@example.com", GOOD_PW).await.unwrap();
        assert_eq!(authed.id, user.id);
    }

    #[tokio::test]
    async fn email_is_case_folded_and_unique() {
        let dir = directory().await;
        dir.register("Alice@Example.COM", GOOD_PW).await.unwrap();

        let err = dir.register("alice@example.com", GOOD_PW).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        // Lookup under any casing resolves the same account
        assert!(dir.find_by_email("ALICE@example.com").await.unwrap().is_some());
        assert!(dir.authenticate("alice@EXAMPLE.com", GOOD_PW).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_indistinguishable() {
        let dir = directory().await;
        dir.register("alice@example.com", GOOD_PW).await.unwrap();

        let e1 = dir
            .authenticate("alice@example.com", "Wrong1234")
            .await
            .unwrap_err();
        let e2 = dir
            .authenticate("nobody@example.com", GOOD_PW)
            .await
            .unwrap_err();
        assert_eq!(e1.kind(), "AuthenticationError");
        assert_eq!(e2.kind(), "AuthenticationError");
        assert_eq!(e1.public_message(), e2.public_message());
    }

    #[tokio::test]
    async fn deactivated_account_cannot_authenticate() {
        let dir = directory().await;
        let user = dir.register("alice@example.com", GOOD_PW).await.unwrap();
        dir.set_active(&user.id, false).await.unwrap();

        let err = dir.authenticate("alice@example.com", GOOD_PW).await.unwrap_err();
        assert_eq!(err.kind(), "AuthenticationError");
    }

    #[tokio::test]
    async fn set_roles_defaults_empty_to_user() {
        let dir = directory().await;
        let user = dir.register("alice@example.com", GOOD_PW).await.unwrap();

        let updated = dir
            .set_roles(&user.id, vec!["admin".to_string()])
            .await
            .unwrap();
        assert_eq!(updated.roles, vec!["admin".to_string()]);

        let updated = dir.set_roles(&user.id, vec![]).await.unwrap();
        assert_eq!(updated.roles, vec![ROLE_USER.to_string()]);
    }

    #[tokio::test]
    async fn change_password_requires_current() {
        let dir = directory().await;
        let user = dir.register("alice@example.com", GOOD_PW).await.unwrap();

        let err = dir
            .change_password(&user.id, "Wrong1234", "NewPw12345")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AuthenticationError");

        dir.change_password(&user.id, GOOD_PW, "NewPw12345")
            .await
            .unwrap();
        assert!(dir.authenticate("alice@example.com", "NewPw12345").await.is_ok());
        assert!(dir.authenticate("alice@example.com", GOOD_PW).await.is_err());
    }

    #[tokio::test]
    async fn search_paginates_by_creation_order() {
        let dir = directory().await;
        for name in ["a@x.com", "b@x.com", "c@y.com"] {
            dir.register(name, GOOD_PW).await.unwrap();
        }

        let hits = dir.search("x.com", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 2);

        let page = dir.search("", 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn summary_omits_password_hash() {
        let dir = directory().await;
        let user = dir.register("alice@example.com", GOOD_PW).await.unwrap();
        let json = serde_json::to_value(user.summary()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["email"], "alice@example.com");
    }
}
