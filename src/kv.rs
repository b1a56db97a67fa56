//! KVStore capability
//!
//! TTL'd key-value storage consumed by the Session Store, the Result Cache,
//! and the optional distributed rate limiter. The trait keeps remote
//! backends possible; the shipped implementation is in-process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::{Error, Result};

/// Trait abstracting the key-value backend.
///
/// All operations may suspend (a remote backend is an I/O hop). Errors are
/// [`crate::Error::ServiceUnavailable`] when the backend is unreachable.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Look up a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, optionally bounded by a TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate live keys with the given prefix.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically increment a counter, setting its expiry on first touch.
    ///
    /// Returns the post-increment count. The fixed-window rate limiter
    /// leans on this being a single atomic step.
    async fn atomic_incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process KVStore backed by a `DashMap`.
///
/// Expiry is lazy (on read) plus a periodic sweep via [`InMemoryKvStore::sweep`].
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, KvEntry>,
    counters: DashMap<String, (u64, Instant)>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict expired entries and counters. Called by the maintenance task.
    pub fn sweep(&self) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter_map(|e| e.value().is_expired().then(|| e.key().clone()))
            .collect();
        let count = stale.len();
        for key in stale {
            self.entries.remove(&key);
        }

        let now = Instant::now();
        let stale_counters: Vec<String> = self
            .counters
            .iter()
            .filter_map(|e| (now >= e.value().1).then(|| e.key().clone()))
            .collect();
        for key in stale_counters {
            self.counters.remove(&key);
        }

        if count > 0 {
            debug!(count, "Swept expired kv entries");
        }
    }

    /// Current number of live entries (tests and stats).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` when the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect())
    }

    async fn atomic_incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, Instant::now() + ttl));
        let (count, expires_at) = entry.value_mut();
        if Instant::now() >= *expires_at {
            *count = 0;
            *expires_at = Instant::now() + ttl;
        }
        *count += 1;
        Ok(*count)
    }
}

/// Check that a KVStore DSN names a supported scheme.
///
/// `memory://` is the only shipped scheme; anything else is a configuration
/// error so that a typo'd DSN fails `check-config` rather than first use.
pub fn validate_dsn(dsn: &str) -> Result<()> {
    if dsn == "memory://" {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unsupported kv store DSN scheme: {dsn}"
        )))
    }
}

/// Construct a KVStore from a DSN.
pub fn from_dsn(dsn: &str) -> Result<Arc<dyn KvStore>> {
    validate_dsn(dsn)?;
    Ok(Arc::new(InMemoryKvStore::new()))
}

/// Verify the store answers a write/delete round trip.
///
/// Run at startup when the cache (or another consumer) depends on the
/// store, so an unreachable backend fails fast instead of at first use.
pub async fn probe(kv: &Arc<dyn KvStore>) -> Result<()> {
    let key = "probe:startup";
    kv.set(key, "ok".to_string(), Some(Duration::from_secs(60)))
        .await
        .map_err(|e| Error::Config(format!("kv store unreachable: {e}")))?;
    kv.delete(key)
        .await
        .map_err(|e| Error::Config(format!("kv store unreachable: {e}")))?;
    Ok(())
}
