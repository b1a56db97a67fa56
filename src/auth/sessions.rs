//! Session store — persistence for refresh-credential identifiers.
//!
//! The [`SessionStore`] trait abstracts over storage backends. Two
//! implementations ship: [`InMemorySessionStore`] (two `DashMap` indices
//! with a background reaper) and [`KvSessionStore`] (records serialized
//! into any [`KvStore`]).
//!
//! # Design
//!
//! Records are indexed by **jti** for O(1) verification and revocation,
//! *and* by **user id** so `revoke_all` can enumerate a user's sessions.
//! `delete` reports whether the key existed; credential rotation uses that
//! as its commit point, so exactly one of several concurrent rotations of
//! the same refresh credential wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::kv::KvStore;

/// A stored refresh session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique refresh credential identifier
    pub jti: String,
    /// Owning user
    pub user_id: String,
    /// Issued-at instant
    pub issued_at: DateTime<Utc>,
    /// Expiry instant (matches the refresh credential's `exp`)
    pub expires_at: DateTime<Utc>,
    /// Optional device label supplied at login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SessionRecord {
    /// Returns `true` if the record has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Page of active sessions plus a continuation cursor.
pub type SessionPage = (Vec<SessionRecord>, Option<String>);

/// Trait abstracting the session storage backend.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a record. The TTL matches the refresh credential lifetime.
    async fn put(&self, record: SessionRecord, ttl: Duration) -> Result<()>;

    /// Look up a record by jti. Expired records read as absent.
    async fn get(&self, jti: &str) -> Result<Option<SessionRecord>>;

    /// Delete a record. Returns `true` if it existed.
    async fn delete(&self, jti: &str) -> Result<bool>;

    /// Delete all records for a user. Returns the number removed.
    async fn delete_by_user(&self, user_id: &str) -> Result<usize>;

    /// Enumerate a user's live sessions.
    ///
    /// Read-your-writes: a `put` or `delete` for the same user is visible
    /// to a subsequent call within the same request.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    /// Enumerate live sessions, paginated by an opaque cursor.
    async fn list_active(&self, limit: usize, cursor: Option<String>) -> Result<SessionPage>;
}

// ── In-memory implementation ──────────────────────────────────────────────

/// In-memory session store backed by two `DashMap` indices.
#[derive(Default)]
pub struct InMemorySessionStore {
    by_jti: DashMap<String, SessionRecord>,
    by_user: DashMap<String, Vec<String>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired records. Called by the background reaper.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .by_jti
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for jti in expired {
            if let Some((_, record)) = self.by_jti.remove(&jti) {
                self.unindex(&record.user_id, &jti);
                debug!(jti = %jti, "Reaped expired session");
            }
        }
        count
    }

    fn unindex(&self, user_id: &str, jti: &str) {
        if let Some(mut jtis) = self.by_user.get_mut(user_id) {
            jtis.retain(|j| j != jti);
            let empty = jtis.is_empty();
            drop(jtis);
            if empty {
                self.by_user.remove_if(user_id, |_, jtis| jtis.is_empty());
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, record: SessionRecord, _ttl: Duration) -> Result<()> {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.jti.clone());
        self.by_jti.insert(record.jti.clone(), record);
        Ok(())
    }

    async fn get(&self, jti: &str) -> Result<Option<SessionRecord>> {
        let Some(entry) = self.by_jti.get(jti) else {
            return Ok(None);
        };
        let record = entry.clone();
        drop(entry);

        if record.is_expired() {
            // Lazy eviction on access
            self.by_jti.remove(jti);
            self.unindex(&record.user_id, jti);
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn delete(&self, jti: &str) -> Result<bool> {
        if let Some((_, record)) = self.by_jti.remove(jti) {
            self.unindex(&record.user_id, jti);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_by_user(&self, user_id: &str) -> Result<usize> {
        let jtis = self
            .by_user
            .remove(user_id)
            .map(|(_, jtis)| jtis)
            .unwrap_or_default();
        let mut count = 0;
        for jti in jtis {
            if self.by_jti.remove(&jti).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let jtis = self
            .by_user
            .get(user_id)
            .map(|e| e.clone())
            .unwrap_or_default();
        let mut records: Vec<SessionRecord> = jtis
            .iter()
            .filter_map(|jti| self.by_jti.get(jti).map(|e| e.clone()))
            .filter(|r| !r.is_expired())
            .collect();
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(records)
    }

    async fn list_active(&self, limit: usize, cursor: Option<String>) -> Result<SessionPage> {
        let mut records: Vec<SessionRecord> = self
            .by_jti
            .iter()
            .filter(|e| !e.value().is_expired())
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.jti.cmp(&b.jti));

        if let Some(cursor) = cursor {
            records.retain(|r| r.jti > cursor);
        }
        let has_more = records.len() > limit;
        records.truncate(limit);
        let next_cursor = has_more.then(|| records.last().map(|r| r.jti.clone())).flatten();
        Ok((records, next_cursor))
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<InMemorySessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}

// ── KVStore-backed implementation ─────────────────────────────────────────

const KEY_PREFIX: &str = "session:";

/// Session store over any [`KvStore`], records serialized as JSON.
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
}

impl KvSessionStore {
    /// Wrap a KVStore.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(jti: &str) -> String {
        format!("{KEY_PREFIX}{jti}")
    }

    async fn load(&self, key: &str) -> Result<Option<SessionRecord>> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let record: SessionRecord = serde_json::from_str(&raw)?;
        if record.is_expired() {
            self.kv.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[async_trait::async_trait]
impl SessionStore for KvSessionStore {
    async fn put(&self, record: SessionRecord, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(&record)?;
        self.kv.set(&Self::key(&record.jti), raw, Some(ttl)).await
    }

    async fn get(&self, jti: &str) -> Result<Option<SessionRecord>> {
        self.load(&Self::key(jti)).await
    }

    async fn delete(&self, jti: &str) -> Result<bool> {
        self.kv.delete(&Self::key(jti)).await
    }

    async fn delete_by_user(&self, user_id: &str) -> Result<usize> {
        let mut count = 0;
        for record in self.list_by_user(user_id).await? {
            if self.kv.delete(&Self::key(&record.jti)).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for key in self.kv.scan(KEY_PREFIX).await? {
            if let Some(record) = self.load(&key).await? {
                if record.user_id == user_id {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(records)
    }

    async fn list_active(&self, limit: usize, cursor: Option<String>) -> Result<SessionPage> {
        let mut records = Vec::new();
        for key in self.kv.scan(KEY_PREFIX).await? {
            if let Some(record) = self.load(&key).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.jti.cmp(&b.jti));
        if let Some(cursor) = cursor {
            records.retain(|r| r.jti > cursor);
        }
        let has_more = records.len() > limit;
        records.truncate(limit);
        let next_cursor = has_more.then(|| records.last().map(|r| r.jti.clone())).flatten();
        Ok((records, next_cursor))
    }
}
