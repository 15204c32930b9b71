//! Cross-instance rate limiting with graceful degradation.
//!
//! [`DistributedRateLimiter`] approximates one sliding-window counter shared
//! by every process instance by delegating to a [`RateStore`]. When the store
//! errors, it is marked down and requests are accounted in a bounded
//! [`LocalRateCache`] until `recovery_cooldown` has passed. Then exactly one
//! caller retries the store while concurrent callers stay local; a success
//! marks it available again and a failure restarts the cooldown.
//!
//! Limits flagged [`strict`](RouteLimit::strict) are denied instead of falling
//! back while a configured store is unavailable, for cases where
//! cross-instance consistency matters more than availability. Without a
//! configured store every route, strict or not, is counted locally.
//!
//! ```no_run
//! use throttle_shield::config::ShieldConfig;
//! use throttle_shield::resilience::distributed::{DistributedRateLimiter, RateLimitType};
//!
//! # async fn run() -> throttle_shield::Result<()> {
//! let limiter = DistributedRateLimiter::new(&ShieldConfig::from_env())?;
//! let outcome = limiter.check("user:42", RateLimitType::Comments).await;
//! if !outcome.success {
//!     println!("retry in {:?}", outcome.retry_after());
//! }
//! # Ok(())
//! # }
//! ```

mod local_cache;
mod routes;
mod store;

pub use local_cache::LocalRateCache;
pub use routes::{RateLimitType, RouteLimit, RouteLimitTable};
pub use store::{RateStore, StoreDecision, UpstashRestStore};

use crate::config::ShieldConfig;
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use store::epoch_ms;
use tokio::time::Instant;
use tracing::{info, warn};

/// Which accounting produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Shared,
    Local,
    /// Strict limit denied because the shared store is unavailable.
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub success: bool,
    pub remaining: u64,
    /// Wall-clock time (epoch ms) at which the window frees up.
    pub reset_at_ms: u64,
    pub source: LimitSource,
}

impl RateLimitOutcome {
    fn from_decision(d: StoreDecision, limit: &RouteLimit, source: LimitSource) -> Self {
        Self {
            success: d.allowed,
            remaining: limit.limit.saturating_sub(d.count),
            reset_at_ms: d.reset_at_ms,
            source,
        }
    }

    /// Wait before a denied request may succeed; zero when allowed.
    pub fn retry_after(&self) -> Duration {
        if self.success {
            Duration::ZERO
        } else {
            Duration::from_millis(self.reset_at_ms.saturating_sub(epoch_ms()))
        }
    }

    /// Converts a denial into [`Error::RateLimited`].
    pub fn into_result(self, scope: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::RateLimited {
                scope: scope.to_string(),
                retry_after_ms: self.retry_after().as_millis() as u64,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub configured: bool,
    pub available: bool,
    pub down_for: Option<Duration>,
    pub local_entries: usize,
}

#[derive(Debug)]
struct StoreHealth {
    available: bool,
    down_since: Option<Instant>,
    /// A post-cooldown retry is in flight.
    retrying: bool,
}

/// Access to the store for one check. Releases the retry slot if the check
/// is dropped before the store answers.
struct StoreLease<'a> {
    limiter: &'a DistributedRateLimiter,
    store: &'a Arc<dyn RateStore>,
    retry: bool,
}

impl Drop for StoreLease<'_> {
    fn drop(&mut self) {
        if self.retry {
            self.limiter.health().retrying = false;
        }
    }
}

pub struct DistributedRateLimiter {
    store: Option<Arc<dyn RateStore>>,
    local: LocalRateCache,
    routes: RouteLimitTable,
    recovery_cooldown: Duration,
    health: Mutex<StoreHealth>,
}

impl DistributedRateLimiter {
    /// Builds the limiter from configuration. Without store credentials it
    /// runs in local mode for the life of the process.
    pub fn new(config: &ShieldConfig) -> Result<Self> {
        let store: Option<Arc<dyn RateStore>> = if config.store.is_configured() {
            Some(Arc::new(UpstashRestStore::new(&config.store)?))
        } else {
            info!(
                capacity = config.store.local_cache_capacity,
                "no shared rate store configured; distributed rate limiting runs in local mode"
            );
            None
        };
        Ok(Self::build(store, config))
    }

    /// Uses a caller-provided store.
    pub fn with_store(store: Arc<dyn RateStore>, config: &ShieldConfig) -> Self {
        Self::build(Some(store), config)
    }

    pub fn local_only(config: &ShieldConfig) -> Self {
        Self::build(None, config)
    }

    fn build(store: Option<Arc<dyn RateStore>>, config: &ShieldConfig) -> Self {
        Self {
            store,
            local: LocalRateCache::new(config.store.local_cache_capacity),
            routes: RouteLimitTable::default().with_overrides(&config.routes),
            recovery_cooldown: config.store.recovery_cooldown(),
            health: Mutex::new(StoreHealth {
                available: true,
                down_since: None,
                retrying: false,
            }),
        }
    }

    fn health(&self) -> MutexGuard<'_, StoreHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn routes(&self) -> &RouteLimitTable {
        &self.routes
    }

    /// The store, unless it is marked down and either still cooling off or
    /// already being retried by another caller.
    fn usable_store(&self) -> Option<StoreLease<'_>> {
        let store = self.store.as_ref()?;
        let mut health = self.health();
        let retry = match health.down_since {
            Some(since) if since.elapsed() < self.recovery_cooldown => return None,
            Some(_) if health.retrying => return None,
            Some(_) => {
                info!(store = store.name(), "retrying shared rate store after cooldown");
                health.retrying = true;
                true
            }
            None => false,
        };
        Some(StoreLease {
            limiter: self,
            store,
            retry,
        })
    }

    fn mark_available(&self, store: &dyn RateStore) {
        let mut health = self.health();
        if !health.available {
            info!(store = store.name(), "shared rate store available again");
        }
        health.available = true;
        health.down_since = None;
        health.retrying = false;
    }

    fn mark_down(&self, store: &dyn RateStore, error: &crate::transport::TransportError) {
        let mut health = self.health();
        if health.available {
            warn!(
                store = store.name(),
                error = %error,
                cooldown_secs = self.recovery_cooldown.as_secs(),
                "shared rate store unavailable, falling back to local accounting"
            );
        }
        health.available = false;
        health.down_since = Some(Instant::now());
        health.retrying = false;
    }

    /// Counts one request by `identifier` against `limit`, namespaced by `kind`.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        limit: &RouteLimit,
        kind: &str,
    ) -> RateLimitOutcome {
        let key = format!("{}:{}", kind, identifier);

        if let Some(lease) = self.usable_store() {
            let store = lease.store;
            match store.hit(&key, limit).await {
                Ok(decision) => {
                    self.mark_available(store.as_ref());
                    return RateLimitOutcome::from_decision(decision, limit, LimitSource::Shared);
                }
                Err(e) => self.mark_down(store.as_ref(), &e),
            }
        }

        if limit.strict && self.store.is_some() {
            warn!(kind, "strict rate limit denied while shared store is unavailable");
            return RateLimitOutcome {
                success: false,
                remaining: 0,
                reset_at_ms: epoch_ms() + self.retry_hint().as_millis() as u64,
                source: LimitSource::StoreUnavailable,
            };
        }

        let decision = self.local.hit(&key, limit);
        RateLimitOutcome::from_decision(decision, limit, LimitSource::Local)
    }

    /// [`check_rate_limit`](Self::check_rate_limit) with the route table's limit.
    pub async fn check(&self, identifier: &str, kind: RateLimitType) -> RateLimitOutcome {
        let limit = self.routes.get(kind);
        self.check_rate_limit(identifier, &limit, kind.as_str()).await
    }

    /// How long a strict denial should tell callers to wait.
    fn retry_hint(&self) -> Duration {
        match self.health().down_since {
            Some(since) => self.recovery_cooldown.saturating_sub(since.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn is_store_available(&self) -> bool {
        self.store.is_some() && self.health().available
    }

    pub fn status(&self) -> StoreStatus {
        let health = self.health();
        StoreStatus {
            configured: self.store.is_some(),
            available: self.store.is_some() && health.available,
            down_for: health.down_since.map(|since| since.elapsed()),
            local_entries: self.local.len(),
        }
    }

    /// Drops expired local fallback entries.
    pub fn purge_expired(&self) -> usize {
        self.local.purge_expired()
    }
}
