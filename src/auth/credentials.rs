//! Credential service — mints, verifies, revokes signed bearer credentials.
//!
//! Credentials are JWTs signed with HMAC-SHA256. Two kinds exist:
//!
//! - **access**: short-lived, stateless; verification never touches the
//!   session store.
//! - **refresh**: long-lived; its `jti` is stored in the session store and
//!   must be present (unrevoked) at verification time.
//!
//! Expiry is checked by this service with zero clock-skew tolerance, so a
//! credential is invalid exactly at its `exp` instant. Every verification
//! failure surfaces as [`Error::Authentication`]; the specific cause goes
//! to the debug log only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::UserPrincipal;
use crate::auth::sessions::{SessionRecord, SessionStore};
use crate::auth::users::{User, UserDirectory};
use crate::{Error, Result};

/// Key id placed in the JWT header; permits future rotation.
const KEY_ID: &str = "v1";

/// Credential kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Short-lived, stateless
    Access,
    /// Long-lived, stored server-side
    Refresh,
}

/// Signed credential claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Email (access credentials only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role names (access credentials only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Unique credential id
    pub jti: String,
    /// Issued-at (Unix epoch seconds)
    pub iat: i64,
    /// Expires-at (Unix epoch seconds)
    pub exp: i64,
    /// Credential kind
    pub kind: CredentialKind,
    /// Optional device label (refresh credentials)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// A freshly minted access + refresh pair.
#[derive(Debug, Clone)]
pub struct CredentialPair {
    /// Signed access credential
    pub access_token: String,
    /// Signed refresh credential
    pub refresh_token: String,
    /// Access credential lifetime in seconds
    pub expires_in: u64,
}

/// Mints, verifies, and revokes signed bearer credentials.
pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    sessions: Arc<dyn SessionStore>,
}

impl CredentialService {
    /// Create a service over a signing key and session store.
    ///
    /// The key is read once here; it is immutable for the process lifetime.
    #[must_use]
    pub fn new(
        signing_key: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            access_ttl,
            refresh_ttl,
            sessions,
        }
    }

    /// Access credential lifetime.
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// The backing session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    // ── Minting ───────────────────────────────────────────────────────────

    /// Mint a signed access credential for a user. No side effects.
    pub fn mint_access(&self, user: &User) -> Result<String> {
        self.mint_access_at(user, Utc::now().timestamp())
    }

    pub(crate) fn mint_access_at(&self, user: &User, now: i64) -> Result<String> {
        let claims = Claims {
            sub: user.id.clone(),
            email: Some(user.email.clone()),
            roles: Some(user.roles.clone()),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.access_ttl.as_secs() as i64,
            kind: CredentialKind::Access,
            device: None,
        };
        self.sign(&claims)
    }

    /// Mint a signed refresh credential and record its jti in the session
    /// store.
    pub async fn mint_refresh(&self, user: &User, device: Option<String>) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            email: None,
            roles: None,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.refresh_ttl.as_secs() as i64,
            kind: CredentialKind::Refresh,
            device: device.clone(),
        };
        let token = self.sign(&claims)?;

        self.sessions
            .put(
                SessionRecord {
                    jti: claims.jti,
                    user_id: user.id.clone(),
                    issued_at: timestamp(now),
                    expires_at: timestamp(claims.exp),
                    device,
                    metadata: HashMap::new(),
                },
                self.refresh_ttl,
            )
            .await?;
        Ok(token)
    }

    /// Mint a full pair for a user (login).
    pub async fn mint_pair(&self, user: &User, device: Option<String>) -> Result<CredentialPair> {
        Ok(CredentialPair {
            access_token: self.mint_access(user)?,
            refresh_token: self.mint_refresh(user, device).await?,
            expires_in: self.access_ttl.as_secs(),
        })
    }

    // ── Verification ──────────────────────────────────────────────────────

    /// Verify an access credential and return the principal it carries.
    ///
    /// Stateless: the session store is never consulted.
    pub fn verify_access(&self, token: &str) -> Result<UserPrincipal> {
        self.verify_access_at(token, Utc::now().timestamp())
    }

    pub(crate) fn verify_access_at(&self, token: &str, now: i64) -> Result<UserPrincipal> {
        let claims = self.decode_at(token, CredentialKind::Access, now)?;
        Ok(UserPrincipal {
            id: claims.sub,
            email: claims.email,
            roles: claims.roles.unwrap_or_default(),
        })
    }

    /// Verify a refresh credential: signature, kind, expiry, and the jti
    /// being present and unrevoked in the session store.
    pub async fn verify_refresh(&self, token: &str) -> Result<SessionRecord> {
        let claims = self.decode_at(token, CredentialKind::Refresh, Utc::now().timestamp())?;
        match self.sessions.get(&claims.jti).await? {
            Some(record) => Ok(record),
            None => {
                debug!(jti = %claims.jti, "Refresh credential revoked or unknown");
                Err(Error::Authentication)
            }
        }
    }

    // ── Rotation & revocation ─────────────────────────────────────────────

    /// Rotate a refresh credential: verify the old one, mint a new pair,
    /// invalidate the old jti.
    ///
    /// The delete of the old jti is the commit point: under concurrent
    /// rotations of the same credential exactly one caller observes the
    /// delete succeed; the others roll back their inserted record and fail
    /// with [`Error::Authentication`]. If a store operation fails before
    /// the delete commits, the old refresh credential remains valid.
    pub async fn rotate(
        &self,
        refresh_token: &str,
        directory: &Arc<dyn UserDirectory>,
    ) -> Result<CredentialPair> {
        let record = self.verify_refresh(refresh_token).await?;

        let user = directory
            .find_by_id(&record.user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(Error::Authentication)?;

        // Insert the replacement first so a crash between the two store
        // operations can only leave an extra session, never a lost one.
        let pair = CredentialPair {
            access_token: self.mint_access(&user)?,
            refresh_token: self.mint_refresh(&user, record.device.clone()).await?,
            expires_in: self.access_ttl.as_secs(),
        };

        if !self.sessions.delete(&record.jti).await? {
            // Lost the race: someone else already rotated this credential.
            let new_claims =
                self.decode_at(&pair.refresh_token, CredentialKind::Refresh, Utc::now().timestamp())?;
            self.sessions.delete(&new_claims.jti).await?;
            debug!(jti = %record.jti, "Concurrent rotation lost the commit race");
            return Err(Error::Authentication);
        }

        Ok(pair)
    }

    /// Revoke one session by jti. Idempotent: revoking an absent jti
    /// succeeds and reports `false`.
    pub async fn revoke(&self, jti: &str) -> Result<bool> {
        self.sessions.delete(jti).await
    }

    /// Revoke all sessions for a user. Returns the number removed.
    pub async fn revoke_all(&self, user_id: &str) -> Result<usize> {
        self.sessions.delete_by_user(user_id).await
    }

    /// Extract the jti of a refresh credential without consulting the
    /// session store (used by logout, which must accept already-revoked
    /// credentials).
    pub fn refresh_jti(&self, token: &str) -> Result<String> {
        let claims = self.decode_at(token, CredentialKind::Refresh, Utc::now().timestamp())?;
        Ok(claims.jti)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(KEY_ID.to_string());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("credential signing failed: {e}")))
    }

    /// Decode and validate: signature, kind, and expiry at `now` with zero
    /// leeway. All failures collapse to [`Error::Authentication`].
    fn decode_at(&self, token: &str, expected: CredentialKind, now: i64) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is enforced below so the `now == exp` boundary is exact.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(error = %e, "Credential signature or structure invalid");
            Error::Authentication
        })?;
        let claims = data.claims;

        if claims.kind != expected {
            debug!(kind = ?claims.kind, expected = ?expected, "Credential kind mismatch");
            return Err(Error::Authentication);
        }
        if now >= claims.exp {
            debug!(jti = %claims.jti, exp = claims.exp, now, "Credential expired");
            return Err(Error::Authentication);
        }
        Ok(claims)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}
