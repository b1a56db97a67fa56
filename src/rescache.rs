//! Result cache with TTL and single-flight computation.
//!
//! Entries live in the [`KvStore`] capability under `cache:{fingerprint}`
//! keys, so a shared backing store is shared across processes; the TTL is
//! delegated to the store, with an embedded expiry as a backstop against
//! lax backends. When the store is unreachable a lookup propagates
//! [`Error::ServiceUnavailable`]; a computed result is still served when
//! only the store write fails.
//!
//! Cache keys are fingerprints: the SHA-256 digest of the canonical JSON
//! of `{tool, principal?, arguments}`. serde_json orders object keys, so
//! semantically equal argument objects fingerprint identically regardless
//! of their original ordering. The principal is included only for tools
//! whose results vary per principal.
//!
//! Under a miss, at most one computation per fingerprint is in flight:
//! concurrent callers await the winner through a watch channel. That
//! coordinator is in-process by design. The computation runs in a
//! detached task, so a caller departing early never abandons the
//! remaining waiters. Failures are delivered to every waiter and are not
//! cached.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::{Error, Result};

const KEY_PREFIX: &str = "cache:";

/// Cloneable error surfaced to every single-flight waiter.
#[derive(Debug, Clone)]
struct FlightError {
    kind: String,
    message: String,
}

impl FlightError {
    fn capture(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    fn rebuild(&self) -> Error {
        match self.kind.as_str() {
            "RetrieverError" => Error::Retriever(self.message.clone()),
            "ServiceUnavailableError" => Error::ServiceUnavailable,
            "NotFoundError" => Error::NotFound(self.message.clone()),
            _ => Error::Internal(self.message.clone()),
        }
    }
}

type FlightResult = std::result::Result<Value, FlightError>;

/// Serialized cache entry.
///
/// The embedded expiry backs up the store's TTL: a backend that keeps a
/// record past its lifetime still cannot serve a stale payload.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    expires_at_ms: i64,
    value: Value,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// Cache statistics tracked atomically.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    coalesced: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Entries served from cache
    pub hits: u64,
    /// Lookups that required computation
    pub misses: u64,
    /// Stale or undecodable entries removed
    pub evictions: u64,
    /// Callers that awaited an in-flight computation
    pub coalesced: u64,
}

/// Fingerprinted TTL cache with single-flight coordination.
///
/// Storage is the [`KvStore`] capability; the flight map is `Arc`-shared
/// with the detached computation tasks.
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    flights: Arc<DashMap<String, watch::Receiver<Option<FlightResult>>>>,
    stats: CacheStats,
}

impl ResultCache {
    /// Create a cache over a KVStore.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            flights: Arc::new(DashMap::new()),
            stats: CacheStats::default(),
        }
    }

    fn key(fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }

    /// Compute the fingerprint for a tool invocation.
    ///
    /// `principal` is `Some` only for tools whose binding declares results
    /// principal-varying.
    #[must_use]
    pub fn fingerprint(tool: &str, principal: Option<&str>, arguments: &Value) -> String {
        let canonical = json!({
            "arguments": arguments,
            "principal": principal,
            "tool": tool,
        });
        let serialized = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    }

    /// Serve from cache, or compute with single-flight coordination.
    ///
    /// `compute` must be `'static`: it is detached so that cancellation of
    /// the calling request cannot abandon other waiters.
    pub async fn get_or_compute<F>(&self, fingerprint: &str, ttl: Duration, compute: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        if let Some(value) = self.lookup(fingerprint).await? {
            return Ok(value);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        // Claim the flight or join the existing one.
        let mut rx = {
            match self.flights.entry(fingerprint.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    entry.get().clone()
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    slot.insert(rx.clone());
                    self.spawn_flight(fingerprint.to_string(), ttl, tx, compute);
                    rx
                }
            }
        };

        loop {
            let settled = rx.borrow().clone();
            if let Some(result) = settled {
                return result.map_err(|e| e.rebuild());
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: the flight task died.
                return Err(Error::Internal("cache computation aborted".to_string()));
            }
        }
    }

    fn spawn_flight<F>(
        &self,
        fingerprint: String,
        ttl: Duration,
        tx: watch::Sender<Option<FlightResult>>,
        compute: F,
    ) where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let kv = Arc::clone(&self.kv);
        let flights = Arc::clone(&self.flights);
        tokio::spawn(async move {
            let outcome = compute.await;
            let flight_result = match &outcome {
                Ok(value) => {
                    let entry = StoredEntry {
                        expires_at_ms: now_ms() + ttl.as_millis() as i64,
                        value: value.clone(),
                    };
                    match serde_json::to_string(&entry) {
                        Ok(raw) => {
                            if let Err(e) = kv.set(&Self::key(&fingerprint), raw, Some(ttl)).await
                            {
                                // The computation succeeded; serve it even
                                // though it could not be stored.
                                warn!(error = %e, "Cache store failed, serving uncached result");
                            }
                        }
                        Err(e) => warn!(error = %e, "Cache entry serialization failed"),
                    }
                    Ok(value.clone())
                }
                Err(err) => {
                    debug!(fingerprint = %fingerprint, kind = err.kind(), "Cache computation failed");
                    Err(FlightError::capture(err))
                }
            };
            // Publish before releasing the flight slot so late joiners see
            // either the settled channel or a fresh store state.
            let _ = tx.send(Some(flight_result));
            flights.remove(&fingerprint);
        });
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<Value>> {
        let key = Self::key(fingerprint);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let entry: StoredEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.kv.delete(&key).await?;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };
        if now_ms() >= entry.expires_at_ms {
            self.kv.delete(&key).await?;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.value))
    }

    /// Remove entries whose embedded expiry has passed.
    ///
    /// The backing store's own TTL evicts on its schedule; this sweep
    /// covers backends without one. Returns the number removed.
    pub async fn evict_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.kv.scan(KEY_PREFIX).await? {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let stale = match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(entry) => now_ms() >= entry.expires_at_ms,
                Err(_) => true,
            };
            if stale && self.kv.delete(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.stats.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Evicted expired cache entries");
        }
        Ok(removed)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a background task sweeping stale entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_maintenance(
    cache: Arc<ResultCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = cache.evict_expired().await {
                        warn!(error = %e, "Cache maintenance sweep failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> Arc<ResultCache> {
        Arc::new(ResultCache::new(Arc::new(InMemoryKvStore::new())))
    }

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = serde_json::from_str::<Value>(r#"{"query": "q", "limit": 3}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"limit": 3, "query": "q"}"#).unwrap();
        assert_eq!(
            ResultCache::fingerprint("search_web", None, &a),
            ResultCache::fingerprint("search_web", None, &b)
        );
    }

    #[test]
    fn fingerprint_varies_by_tool_principal_and_args() {
        let args = json!({"query": "q"});
        let base = ResultCache::fingerprint("search_web", None, &args);
        assert_ne!(base, ResultCache::fingerprint("search_vectors", None, &args));
        assert_ne!(base, ResultCache::fingerprint("search_web", Some("u1"), &args));
        assert_ne!(
            base,
            ResultCache::fingerprint("search_web", None, &json!({"query": "other"}))
        );
    }

    #[tokio::test]
    async fn hit_serves_without_recompute() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_compute("fp", Duration::from_secs(60), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"n": 1}))
                })
                .await
                .unwrap();
            assert_eq!(value, json!({"n": 1}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache = cache();
        cache
            .get_or_compute("fp", Duration::ZERO, async { Ok(json!(1)) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let value = cache
            .get_or_compute("fp", Duration::from_secs(60), async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn caches_share_a_backing_store() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let a = ResultCache::new(Arc::clone(&kv));
        let b = ResultCache::new(Arc::clone(&kv));

        a.get_or_compute("fp", Duration::from_secs(60), async { Ok(json!(1)) })
            .await
            .unwrap();
        // The second cache instance serves the entry without computing
        let value = b
            .get_or_compute("fp", Duration::from_secs(60), async {
                panic!("must be served from the shared store");
            })
            .await
            .unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(b.stats().hits, 1);
    }

    #[tokio::test]
    async fn stale_entry_is_evicted_even_without_store_ttl() {
        // A lax backend kept the record past its lifetime; the embedded
        // expiry still refuses it.
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cache = ResultCache::new(Arc::clone(&kv));
        let entry = StoredEntry {
            expires_at_ms: now_ms() - 1000,
            value: json!("stale"),
        };
        kv.set("cache:fp", serde_json::to_string(&entry).unwrap(), None)
            .await
            .unwrap();

        let value = cache
            .get_or_compute("fp", Duration::from_secs(60), async { Ok(json!("fresh")) })
            .await
            .unwrap();
        assert_eq!(value, json!("fresh"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_computation() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("fp", Duration::from_secs(60), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"result": "shared"}))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one computation");
        assert!(results.iter().all(|r| r == &json!({"result": "shared"})));
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_is_not_cached() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("fp", Duration::from_secs(60), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<Value, _>(Error::Retriever("backend down".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "RetrieverError");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Not cached: the next call recomputes and can succeed
        let value = cache
            .get_or_compute("fp", Duration::from_secs(60), async { Ok(json!("ok")) })
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
    }

    #[tokio::test]
    async fn caller_cancellation_does_not_abandon_waiters() {
        let cache = cache();

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("fp", Duration::from_secs(60), async {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(json!("survived"))
                    })
                    .await
            })
        };
        // Give the leader time to claim the flight, then cancel it
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let value = cache
            .get_or_compute("fp", Duration::from_secs(60), async {
                panic!("a second computation must not start");
            })
            .await
            .unwrap();
        assert_eq!(value, json!("survived"));
    }

    #[tokio::test]
    async fn evict_expired_sweeps_embedded_expiry() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cache = ResultCache::new(Arc::clone(&kv));

        let stale = StoredEntry {
            expires_at_ms: now_ms() - 1000,
            value: json!(1),
        };
        let fresh = StoredEntry {
            expires_at_ms: now_ms() + 60_000,
            value: json!(2),
        };
        kv.set("cache:stale", serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        kv.set("cache:fresh", serde_json::to_string(&fresh).unwrap(), None)
            .await
            .unwrap();

        assert_eq!(cache.evict_expired().await.unwrap(), 1);
        assert!(kv.get("cache:stale").await.unwrap().is_none());
        assert!(kv.get("cache:fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreachable_store_propagates_service_unavailable() {
        struct BrokenKv;

        #[async_trait::async_trait]
        impl KvStore for BrokenKv {
            async fn get(&self, _: &str) -> Result<Option<String>> {
                Err(Error::ServiceUnavailable)
            }
            async fn set(&self, _: &str, _: String, _: Option<Duration>) -> Result<()> {
                Err(Error::ServiceUnavailable)
            }
            async fn delete(&self, _: &str) -> Result<bool> {
                Err(Error::ServiceUnavailable)
            }
            async fn scan(&self, _: &str) -> Result<Vec<String>> {
                Err(Error::ServiceUnavailable)
            }
            async fn atomic_incr_with_expiry(&self, _: &str, _: Duration) -> Result<u64> {
                Err(Error::ServiceUnavailable)
            }
        }

        let cache = ResultCache::new(Arc::new(BrokenKv));
        let err = cache
            .get_or_compute("fp", Duration::from_secs(60), async { Ok(json!(1)) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ServiceUnavailableError");
    }
}
