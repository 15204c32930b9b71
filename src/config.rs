//! Process configuration.
//!
//! Defaults are usable as-is; everything can be overridden from environment
//! variables ([`ShieldConfig::from_env`]) or a YAML document
//! ([`ShieldConfig::from_yaml_str`]). Without shared store credentials the
//! distributed limiter runs in local-fallback mode for the life of the process.

use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::distributed::{RateLimitType, RouteLimit};
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_STORE_URL: &str = "UPSTASH_REDIS_REST_URL";
pub const ENV_STORE_TOKEN: &str = "UPSTASH_REDIS_REST_TOKEN";
pub const ENV_STORE_TIMEOUT_MS: &str = "SHIELD_STORE_TIMEOUT_MS";
pub const ENV_STORE_RECOVERY_SECS: &str = "SHIELD_STORE_RECOVERY_SECS";
pub const ENV_LOCAL_CACHE_CAPACITY: &str = "SHIELD_LOCAL_CACHE_CAPACITY";
pub const ENV_DEDUP_TIMEOUT_SECS: &str = "SHIELD_DEDUP_TIMEOUT_SECS";
pub const ENV_MAINTENANCE_INTERVAL_MS: &str = "SHIELD_MAINTENANCE_INTERVAL_MS";

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Shared rate store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,
    /// Bound on a single store round trip.
    pub timeout_ms: u64,
    pub key_prefix: String,
    /// How long the store stays marked down before it is tried again.
    pub recovery_cooldown_ms: u64,
    /// Maximum identifiers tracked by the local fallback.
    pub local_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rest_url: None,
            rest_token: None,
            timeout_ms: 1_500,
            key_prefix: "ratelimit".to_string(),
            recovery_cooldown_ms: 5 * 60 * 1000,
            local_cache_capacity: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn is_configured(&self) -> bool {
        matches!((&self.rest_url, &self.rest_token), (Some(u), Some(t)) if !u.is_empty() && !t.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }

    pub fn with_endpoint(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.rest_url = Some(url.into());
        self.rest_token = Some(token.into());
        self
    }
}

/// Top-level configuration for a [`ResilienceRegistry`](crate::resilience::ResilienceRegistry)
/// and the distributed limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub store: StoreConfig,
    /// Applied to breakers created without an explicit config.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Applied to limiters created without an explicit config.
    pub rate_limiter: RateLimiterConfig,
    /// Per-category overrides on top of the built-in route table.
    pub routes: HashMap<RateLimitType, RouteLimit>,
    pub dedup_timeout_ms: u64,
    /// Period of the registry's background sweep.
    pub maintenance_interval_ms: u64,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            routes: HashMap::new(),
            dedup_timeout_ms: 30_000,
            maintenance_interval_ms: 10_000,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl ShieldConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables. Malformed numbers are
    /// ignored rather than rejected.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Some(url) = env_non_empty(ENV_STORE_URL) {
            self.store.rest_url = Some(url);
        }
        if let Some(token) = env_non_empty(ENV_STORE_TOKEN) {
            self.store.rest_token = Some(token);
        }
        if let Some(ms) = env_parse::<u64>(ENV_STORE_TIMEOUT_MS) {
            self.store.timeout_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>(ENV_STORE_RECOVERY_SECS) {
            self.store.recovery_cooldown_ms = secs.saturating_mul(1000);
        }
        if let Some(cap) = env_parse::<usize>(ENV_LOCAL_CACHE_CAPACITY) {
            self.store.local_cache_capacity = cap;
        }
        if let Some(secs) = env_parse::<u64>(ENV_DEDUP_TIMEOUT_SECS) {
            self.dedup_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = env_parse::<u64>(ENV_MAINTENANCE_INTERVAL_MS) {
            self.maintenance_interval_ms = ms;
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                "invalid configuration document",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a YAML file; environment variables still take precedence.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read {}", path.display()),
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })?;
        let mut cfg = Self::from_yaml_str(&content)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(raw) = self.store.rest_url.as_deref() {
            let parsed = url::Url::parse(raw).map_err(|e| {
                Error::configuration_with_context(
                    "shared store endpoint is not a valid URL",
                    ErrorContext::new()
                        .with_field_path("store.rest_url")
                        .with_details(e.to_string()),
                )
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::configuration_with_context(
                    "shared store endpoint must use http or https",
                    ErrorContext::new()
                        .with_field_path("store.rest_url")
                        .with_details(parsed.scheme().to_string()),
                ));
            }
        }
        if self.store.local_cache_capacity == 0 {
            return Err(Error::configuration_with_context(
                "local cache capacity must be non-zero",
                ErrorContext::new().with_field_path("store.local_cache_capacity"),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(Error::configuration_with_context(
                "store timeout must be non-zero",
                ErrorContext::new().with_field_path("store.timeout_ms"),
            ));
        }
        for (kind, route) in &self.routes {
            if route.limit == 0 || route.window.is_zero() {
                return Err(Error::configuration_with_context(
                    "route limits need a non-zero limit and window",
                    ErrorContext::new().with_field_path(format!("routes.{}", kind.as_str())),
                ));
            }
        }
        Ok(())
    }

    pub fn dedup_timeout(&self) -> Duration {
        Duration::from_millis(self.dedup_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ShieldConfig::default();
        assert!(!cfg.store.is_configured());
        assert_eq!(cfg.store.local_cache_capacity, 10_000);
        assert_eq!(cfg.store.recovery_cooldown(), Duration::from_secs(300));
        assert_eq!(cfg.dedup_timeout(), Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides() {
        let cfg = ShieldConfig::from_yaml_str(
            r#"
store:
  rest_url: https://eu1-store.example.io
  rest_token: tok
  timeout_ms: 800
circuit_breaker:
  failure_threshold: 3
  reset_timeout_ms: 1000
rate_limiter:
  max_tokens: 20
  refill_rate: 5
routes:
  posts:
    limit: 5
    window_ms: 3600000
"#,
        )
        .unwrap();
        assert!(cfg.store.is_configured());
        assert_eq!(cfg.store.timeout(), Duration::from_millis(800));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.success_threshold, 2);
        assert_eq!(cfg.circuit_breaker.reset_timeout, Duration::from_secs(1));
        assert_eq!(cfg.rate_limiter.max_tokens, 20.0);
        assert_eq!(cfg.routes[&RateLimitType::Posts].limit, 5);
        assert!(!cfg.routes[&RateLimitType::Posts].strict);
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = ShieldConfig::from_yaml_str("store:\n  rest_url: ftp://x\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        let err = ShieldConfig::from_yaml_str("store:\n  rest_url: not a url\n").unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("store.rest_url")
        );
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err =
            ShieldConfig::from_yaml_str("store:\n  local_cache_capacity: 0\n").unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }
}
