//! Rate limiting — token buckets per (scope, identity).
//!
//! Each identity gets a per-minute and a per-hour bucket; a request is
//! admitted iff both hold at least one token. Refill is lazy: elapsed time
//! times the refill rate, clamped to capacity. Denials report the time
//! until the most-constrained bucket replenishes one token.
//!
//! An optional distributed mode runs fixed-window counters through the
//! KVStore's atomic increment. When that backend is unreachable the
//! limiter fails open and logs a warning: a dependency outage must not
//! lock out legitimate traffic.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::kv::KvStore;
use crate::{Error, Result};

/// Rate limit scope (bucket window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Per-minute window
    PerMinute,
    /// Per-hour window
    PerHour,
}

impl Scope {
    fn window_secs(self) -> u64 {
        match self {
            Self::PerMinute => 60,
            Self::PerHour => 3600,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::PerMinute => "minute",
            Self::PerHour => "hour",
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Token-bucket rate limiter keyed by `(scope, identity)`.
pub struct RateLimiter {
    buckets: DashMap<(Scope, String), Bucket>,
    capacity: f64,
    minute_rate: f64,
    hour_rate: f64,
    idle_after: Duration,
    distributed: Option<DistributedBackend>,
}

struct DistributedBackend {
    kv: Arc<dyn KvStore>,
    per_minute: u64,
    per_hour: u64,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    ///
    /// `kv` is only consulted when `config.distributed` is set.
    #[must_use]
    pub fn new(config: &RateLimitConfig, kv: Option<Arc<dyn KvStore>>) -> Self {
        let distributed = match (config.distributed, kv) {
            (true, Some(kv)) => Some(DistributedBackend {
                kv,
                per_minute: u64::from(config.per_minute),
                per_hour: u64::from(config.per_hour),
            }),
            _ => None,
        };
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(config.burst),
            minute_rate: f64::from(config.per_minute) / 60.0,
            hour_rate: f64::from(config.per_hour) / 3600.0,
            idle_after: config.idle_after,
            distributed,
        }
    }

    /// Admit or deny one request for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimit`] with `retry_after` when either bucket
    /// is exhausted.
    pub async fn check(&self, identity: &str) -> Result<()> {
        if let Some(backend) = &self.distributed {
            return self.check_distributed(backend, identity).await;
        }
        self.check_local(identity)
    }

    fn check_local(&self, identity: &str) -> Result<()> {
        match self.try_consume(Scope::PerMinute, identity) {
            Err(minute_deficit) => {
                // Denied by the minute bucket; report the most-constrained.
                let hour_deficit = self.peek_deficit(Scope::PerHour, identity);
                let retry_after = Duration::from_secs_f64(minute_deficit.max(hour_deficit));
                debug!(identity = %identity, scope = Scope::PerMinute.label(), "Rate limited");
                Err(Error::RateLimit { retry_after })
            }
            Ok(()) => match self.try_consume(Scope::PerHour, identity) {
                Ok(()) => Ok(()),
                Err(hour_deficit) => {
                    // The minute token must be returned: the request was
                    // not admitted.
                    self.refund(Scope::PerMinute, identity);
                    debug!(identity = %identity, scope = Scope::PerHour.label(), "Rate limited");
                    Err(Error::RateLimit {
                        retry_after: Duration::from_secs_f64(hour_deficit),
                    })
                }
            },
        }
    }

    /// Refill, then consume one token. On denial returns the seconds until
    /// one token is available.
    fn try_consume(&self, scope: Scope, identity: &str) -> std::result::Result<(), f64> {
        let rate = self.rate(scope);
        let mut entry = self
            .buckets
            .entry((scope, identity.to_string()))
            .or_insert_with(|| Bucket {
                tokens: self.capacity,
                last_refill: Instant::now(),
                last_access: Instant::now(),
            });
        let bucket = entry.value_mut();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_access = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - bucket.tokens) / rate)
        }
    }

    /// Seconds until one token is available, without consuming.
    fn peek_deficit(&self, scope: Scope, identity: &str) -> f64 {
        let rate = self.rate(scope);
        let Some(mut entry) = self.buckets.get_mut(&(scope, identity.to_string())) else {
            return 0.0;
        };
        let bucket = entry.value_mut();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - bucket.tokens) / rate
        }
    }

    fn refund(&self, scope: Scope, identity: &str) {
        if let Some(mut entry) = self.buckets.get_mut(&(scope, identity.to_string())) {
            let bucket = entry.value_mut();
            bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
        }
    }

    fn rate(&self, scope: Scope) -> f64 {
        match scope {
            Scope::PerMinute => self.minute_rate,
            Scope::PerHour => self.hour_rate,
        }
    }

    async fn check_distributed(&self, backend: &DistributedBackend, identity: &str) -> Result<()> {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        for (scope, limit) in [
            (Scope::PerMinute, backend.per_minute),
            (Scope::PerHour, backend.per_hour),
        ] {
            let window = scope.window_secs();
            let window_start = now_secs / window * window;
            let key = format!("rl:{}:{identity}:{window_start}", scope.label());

            match backend
                .kv
                .atomic_incr_with_expiry(&key, Duration::from_secs(window))
                .await
            {
                Ok(count) if count > limit => {
                    let retry_after = Duration::from_secs(window_start + window - now_secs);
                    debug!(identity = %identity, scope = scope.label(), count, "Rate limited (distributed)");
                    return Err(Error::RateLimit { retry_after });
                }
                Ok(_) => {}
                Err(e) => {
                    // Fail open: never lock out traffic during a backend outage.
                    warn!(error = %e, scope = scope.label(), "Rate limit backend unavailable, admitting request");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Reclaim buckets idle past the configured threshold.
    pub fn sweep_idle(&self) {
        let idle_after = self.idle_after;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_access.elapsed() < idle_after);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, "Reclaimed idle rate buckets");
        }
    }

    /// Current number of live buckets (tests and stats).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Spawn a background task sweeping idle buckets every `interval`.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => limiter.sweep_idle(),
                _ = shutdown.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn config(per_minute: u32, per_hour: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            per_minute,
            per_hour,
            burst,
            distributed: false,
            idle_after: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn burst_is_admitted_then_denied() {
        let limiter = RateLimiter::new(&config(2, 1000, 2), None);

        assert!(limiter.check("alice").await.is_ok());
        assert!(limiter.check("alice").await.is_ok());
        let err = limiter.check("alice").await.unwrap_err();
        let Error::RateLimit { retry_after } = err else {
            panic!("expected RateLimitError");
        };
        assert!(retry_after > Duration::ZERO);
        // A slow refill (2/min) cannot replenish within this test
        assert!(retry_after <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn identities_have_independent_buckets() {
        let limiter = RateLimiter::new(&config(1, 1000, 1), None);

        assert!(limiter.check("alice").await.is_ok());
        assert!(limiter.check("alice").await.is_err());
        assert!(limiter.check("bob").await.is_ok());
    }

    #[tokio::test]
    async fn one_token_admits_and_leaves_zero() {
        let limiter = RateLimiter::new(&config(60, 1000, 1), None);

        assert!(limiter.check("alice").await.is_ok());
        // Bucket now at zero: immediate retry denies
        assert!(limiter.check("alice").await.is_err());
    }

    #[tokio::test]
    async fn hour_bucket_denial_refunds_the_minute_token() {
        // Hour capacity is the constraint here: burst 2 shared, but the
        // hour bucket refills so slowly the third call reports it.
        let limiter = RateLimiter::new(&config(6000, 2, 2), None);

        assert!(limiter.check("alice").await.is_ok());
        assert!(limiter.check("alice").await.is_ok());

        let err = limiter.check("alice").await.unwrap_err();
        let Error::RateLimit { retry_after } = err else {
            panic!("expected RateLimitError");
        };
        // Most-constrained bucket is the hour one: ~1800s per token
        assert!(retry_after > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn distributed_mode_counts_via_kv() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let mut cfg = config(2, 1000, 2);
        cfg.distributed = true;
        let limiter = RateLimiter::new(&cfg, Some(kv));

        assert!(limiter.check("alice").await.is_ok());
        assert!(limiter.check("alice").await.is_ok());
        let err = limiter.check("alice").await.unwrap_err();
        assert_eq!(err.kind(), "RateLimitError");
    }

    #[tokio::test]
    async fn distributed_mode_fails_open_on_backend_error() {
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

        let mut cfg = config(1, 1, 1);
        cfg.distributed = true;
        let limiter = RateLimiter::new(&cfg, Some(Arc::new(BrokenKv)));

        // Every request is admitted while the backend is down
        for _ in 0..5 {
            assert!(limiter.check("alice").await.is_ok());
        }
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_buckets() {
        let mut cfg = config(60, 1000, 10);
        cfg.idle_after = Duration::ZERO;
        let limiter = RateLimiter::new(&cfg, None);

        limiter.check("alice").await.unwrap();
        limiter.check("bob").await.unwrap();
        assert!(limiter.bucket_count() >= 2);

        limiter.sweep_idle();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
