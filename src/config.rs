//! Configuration management
//!
//! Loads a typed configuration from a YAML file merged with `RGW_`-prefixed
//! environment variables (environment wins). Secrets support `env:VAR`
//! indirection and `auto` generation for development.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum length for the signing key and the internal trust token.
pub const MIN_SECRET_LEN: usize = 32;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Middleware profile and per-stage overrides
    pub profile: ProfileConfig,
    /// Security configuration (keys, TTLs, trust token)
    pub security: SecurityConfig,
    /// Rate limiter parameters
    pub rate: RateLimitConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// Backing store DSNs
    pub stores: StoreConfig,
    /// Gateway-to-Tool-Server upstream configuration
    pub upstream: UpstreamConfig,
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Middleware profile selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareProfile {
    /// Validation + dispatch only (error handler always present)
    Minimal,
    /// Authentication and authorization, no cache/rate-limit/metrics
    AuthOnly,
    /// `auth_only` plus enhanced request logging and observability
    AuthWithContext,
    /// `auth_with_context` plus the result cache
    AuthWithCache,
    /// Everything
    #[default]
    Full,
    /// Start from nothing but the error handler; flags opt stages in
    Custom,
}

/// Profile plus individual stage overrides
///
/// A `None` flag means "use the profile default"; `Some(_)` overrides it.
/// The error handler is always present regardless of profile or flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProfileConfig {
    /// Selected preset
    pub profile: MiddlewareProfile,
    /// Override: authentication + authorization stages
    pub enable_auth: Option<bool>,
    /// Override: result cache stage
    pub enable_cache: Option<bool>,
    /// Override: rate limit stage
    pub enable_rate_limit: Option<bool>,
    /// Override: metrics stage
    pub enable_metrics: Option<bool>,
    /// Override: envelope/params validation stage
    pub enable_validation: Option<bool>,
    /// Override: error handler stage (default true; forced on)
    pub enable_error_handler: Option<bool>,
    /// Override: request logging with redaction + observability span
    pub enable_enhanced_logging: Option<bool>,
}

/// Effective set of pipeline stages after applying profile and overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFlags {
    /// Observability span + request logging
    pub logging: bool,
    /// Envelope and argument-schema validation
    pub validation: bool,
    /// Authentication (credential verification)
    pub auth: bool,
    /// Rate limiting
    pub rate_limit: bool,
    /// Metrics counters
    pub metrics: bool,
    /// Result cache
    pub cache: bool,
}

impl ProfileConfig {
    /// Compute the effective stage set.
    ///
    /// The error handler is not represented here: it is unconditionally part
    /// of every pipeline.
    #[must_use]
    pub fn stage_flags(&self) -> StageFlags {
        let base = match self.profile {
            MiddlewareProfile::Minimal => StageFlags {
                logging: false,
                validation: true,
                auth: false,
                rate_limit: false,
                metrics: false,
                cache: false,
            },
            MiddlewareProfile::AuthOnly => StageFlags {
                logging: false,
                validation: true,
                auth: true,
                rate_limit: false,
                metrics: false,
                cache: false,
            },
            MiddlewareProfile::AuthWithContext => StageFlags {
                logging: true,
                validation: true,
                auth: true,
                rate_limit: false,
                metrics: false,
                cache: false,
            },
            MiddlewareProfile::AuthWithCache => StageFlags {
                logging: true,
                validation: true,
                auth: true,
                rate_limit: false,
                metrics: false,
                cache: true,
            },
            MiddlewareProfile::Full => StageFlags {
                logging: true,
                validation: true,
                auth: true,
                rate_limit: true,
                metrics: true,
                cache: true,
            },
            MiddlewareProfile::Custom => StageFlags {
                logging: false,
                validation: false,
                auth: false,
                rate_limit: false,
                metrics: false,
                cache: false,
            },
        };

        StageFlags {
            logging: self.enable_enhanced_logging.unwrap_or(base.logging),
            validation: self.enable_validation.unwrap_or(base.validation),
            auth: self.enable_auth.unwrap_or(base.auth),
            rate_limit: self.enable_rate_limit.unwrap_or(base.rate_limit),
            metrics: self.enable_metrics.unwrap_or(base.metrics),
            cache: self.enable_cache.unwrap_or(base.cache),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// MAC key for credentials. Supports literal, `env:VAR`, or `auto`.
    pub signing_key: String,
    /// Gateway <-> Tool Server shared secret. Same resolution rules.
    pub internal_trust_token: String,
    /// Access credential lifetime
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh credential lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// If false, public methods (tools/list, health_check) skip auth
    pub require_auth: bool,
    /// Keys redacted by the logging middleware (case-insensitive substring)
    pub sensitive_fields: Vec<String>,
    /// Authorization decision cache window
    #[serde(with = "humantime_serde")]
    pub decision_cache_ttl: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            internal_trust_token: String::new(),
            access_ttl: Duration::from_secs(30 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            require_auth: true,
            sensitive_fields: default_sensitive_fields(),
            decision_cache_ttl: Duration::from_secs(30),
        }
    }
}

fn default_sensitive_fields() -> Vec<String> {
    ["password", "token", "secret", "authorization", "api_key"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl SecurityConfig {
    /// Resolve the signing key (expand `env:VAR`, generate if `auto`).
    #[must_use]
    pub fn resolve_signing_key(&self) -> String {
        resolve_secret(&self.signing_key)
    }

    /// Resolve the internal trust token.
    #[must_use]
    pub fn resolve_trust_token(&self) -> String {
        resolve_secret(&self.internal_trust_token)
    }
}

/// Resolve a secret value: literal, `env:VAR_NAME`, or `auto`.
///
/// `auto` generates 32 random bytes, base64url-encoded. Development only;
/// tokens do not survive a restart.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if value == "auto" {
        use rand::RngExt;
        let random_bytes: [u8; 32] = rand::rng().random();
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        )
    } else if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Rate limiter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens refilled per minute (per-minute bucket refill)
    pub per_minute: u32,
    /// Tokens refilled per hour (per-hour bucket refill)
    pub per_hour: u32,
    /// Bucket capacity (burst allowance, both scopes)
    pub burst: u32,
    /// Use the KVStore fixed-window backend instead of in-memory buckets
    pub distributed: bool,
    /// Reclaim buckets idle past this threshold
    #[serde(with = "humantime_serde")]
    pub idle_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
            burst: 10,
            distributed: false,
            idle_after: Duration::from_secs(600),
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for tools without a per-tool entry
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Per-tool TTL overrides, keyed by tool name
    #[serde(with = "humantime_serde_map")]
    pub ttl: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut ttl = HashMap::new();
        ttl.insert("search_web".to_string(), Duration::from_secs(5 * 60));
        ttl.insert("search_vectors".to_string(), Duration::from_secs(15 * 60));
        ttl.insert("search_database".to_string(), Duration::from_secs(10 * 60));
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            ttl,
        }
    }
}

impl CacheConfig {
    /// TTL for a given tool.
    #[must_use]
    pub fn ttl_for(&self, tool: &str) -> Duration {
        self.ttl.get(tool).copied().unwrap_or(self.default_ttl)
    }
}

/// Serde adapter: `HashMap<String, Duration>` with humantime values.
mod humantime_serde_map {
    use std::{collections::HashMap, time::Duration};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k.clone(), humantime_serde::Serde::from(*v)))
            .collect::<HashMap<_, _>>()
            .serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let raw = HashMap::<String, humantime_serde::Serde<Duration>>::deserialize(de)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.into_inner())).collect())
    }
}

/// Backing store DSNs
///
/// `memory://` selects the in-process implementation; anything else is
/// handed to the corresponding store constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Session store DSN
    pub session: String,
    /// KVStore DSN (cache, optional distributed rate limiting)
    pub kv: String,
    /// User directory DSN
    pub users: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session: "memory://".to_string(),
            kv: "memory://".to_string(),
            users: "memory://".to_string(),
        }
    }
}

/// Gateway upstream (Tool Server) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the Tool Server JSON-RPC endpoint
    pub tool_server_url: String,
    /// Per-request timeout for proxied calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tool_server_url: "http://127.0.0.1:8081".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus `RGW_*` env vars.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file cannot be parsed or the merged
    /// figure fails extraction.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("RGW_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Environment files feed `env:VAR` secret resolution.
        for env_file in &config.env_files {
            if let Err(e) = dotenvy::from_path(env_file) {
                tracing::debug!(file = %env_file, error = %e, "Skipped env file");
            }
        }

        Ok(config)
    }

    /// Validate the configuration at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first failing option.
    pub fn validate(&self) -> Result<()> {
        let flags = self.profile.stage_flags();

        if flags.auth {
            let key = self.security.resolve_signing_key();
            if key.len() < MIN_SECRET_LEN {
                return Err(Error::Config(format!(
                    "security.signing_key must be at least {MIN_SECRET_LEN} bytes (got {})",
                    key.len()
                )));
            }
            let trust = self.security.resolve_trust_token();
            if trust.len() < MIN_SECRET_LEN {
                return Err(Error::Config(format!(
                    "security.internal_trust_token must be at least {MIN_SECRET_LEN} bytes (got {})",
                    trust.len()
                )));
            }
        }

        if self.security.access_ttl.is_zero() || self.security.refresh_ttl.is_zero() {
            return Err(Error::Config(
                "security.access_ttl and security.refresh_ttl must be non-zero".to_string(),
            ));
        }

        if flags.rate_limit {
            if self.rate.burst == 0 {
                return Err(Error::Config("rate.burst must be positive".to_string()));
            }
            if self.rate.per_minute == 0 || self.rate.per_hour == 0 {
                return Err(Error::Config(
                    "rate.per_minute and rate.per_hour must be positive".to_string(),
                ));
            }
        }

        if flags.cache {
            if self.cache.default_ttl.is_zero() {
                return Err(Error::Config("cache.default_ttl must be non-zero".to_string()));
            }
            if let Some((tool, _)) = self.cache.ttl.iter().find(|(_, ttl)| ttl.is_zero()) {
                return Err(Error::Config(format!("cache.ttl.{tool} must be non-zero")));
            }
            // The cache's backing store must be addressable; reachability
            // is probed when the store is assembled at startup.
            crate::kv::validate_dsn(&self.stores.kv)?;
        }

        Ok(())
    }
}
