//! Named resilience instances owned by the application.
//!
//! A [`ResilienceRegistry`] is created once at the composition root and passed
//! to whatever needs it. Every caller asking for the same name gets the same
//! breaker or limiter, so all traffic to one dependency shares one state.

use crate::config::ShieldConfig;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::resilience::dedup::{DedupKey, RequestDeduplicator};
use crate::resilience::distributed::DistributedRateLimiter;
use crate::resilience::rate_limiter::{AcquireOptions, RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Maintenance {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_requests: usize,
    pub expired_entries: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sweep(dedup: &RequestDeduplicator, distributed: Option<&DistributedRateLimiter>) -> MaintenanceReport {
    MaintenanceReport {
        stale_requests: dedup.sweep_stale(),
        expired_entries: distributed.map_or(0, |d| d.purge_expired()),
    }
}

pub struct ResilienceRegistry {
    config: ShieldConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: Mutex<HashMap<String, RateLimiter>>,
    dedup: RequestDeduplicator,
    distributed: Option<Arc<DistributedRateLimiter>>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(ShieldConfig::default())
    }
}

impl ResilienceRegistry {
    pub fn new(config: ShieldConfig) -> Self {
        let dedup = RequestDeduplicator::new(config.dedup_timeout());
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            dedup,
            distributed: None,
            maintenance: Mutex::new(None),
        }
    }

    /// Registry plus a distributed limiter built from the same config.
    pub fn with_distributed_from_config(config: ShieldConfig) -> Result<Self> {
        let distributed = DistributedRateLimiter::new(&config)?;
        Ok(Self::new(config).with_distributed(Arc::new(distributed)))
    }

    /// Attaches a distributed limiter whose local fallback cache the
    /// maintenance task will purge.
    pub fn with_distributed(mut self, limiter: Arc<DistributedRateLimiter>) -> Self {
        self.distributed = Some(limiter);
        self
    }

    pub fn config(&self) -> &ShieldConfig {
        &self.config
    }

    pub fn distributed(&self) -> Option<&Arc<DistributedRateLimiter>> {
        self.distributed.as_ref()
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    /// Returns the breaker registered under `name`, creating it on first use.
    /// `config` only applies at creation; later calls ignore it.
    pub fn circuit_breaker(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        let cfg = config.unwrap_or_else(|| self.config.circuit_breaker.clone());
        debug!(breaker = name, "creating circuit breaker");
        let breaker = Arc::new(CircuitBreaker::named(name, cfg));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Returns the limiter registered under `name`, creating it on first use.
    pub fn rate_limiter(&self, name: &str, config: Option<RateLimiterConfig>) -> RateLimiter {
        let mut limiters = lock(&self.limiters);
        if let Some(existing) = limiters.get(name) {
            return existing.clone();
        }
        let cfg = config.unwrap_or_else(|| self.config.rate_limiter.clone());
        debug!(limiter = name, "creating rate limiter");
        let limiter = RateLimiter::named(name, cfg);
        limiters.insert(name.to_string(), limiter.clone());
        limiter
    }

    pub async fn with_circuit_breaker<T, F, Fut>(
        &self,
        name: &str,
        op: F,
        config: Option<CircuitBreakerConfig>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.circuit_breaker(name, config).execute(op).await
    }

    /// Acquires one token from the named limiter, then runs `op`.
    pub async fn with_rate_limit<T, F, Fut>(
        &self,
        name: &str,
        op: F,
        options: AcquireOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.rate_limiter(name, None).execute(op, 1.0, options).await
    }

    pub async fn deduplicate_request<T, F, Fut>(&self, op: F, key: impl Into<DedupKey>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.dedup.deduplicate_request(op, key).await
    }

    /// One sweep of stale dedup entries and expired local limiter entries.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        sweep(&self.dedup, self.distributed.as_deref())
    }

    /// Spawns the periodic sweep on the current runtime. Returns `false` if
    /// it is already running.
    pub fn start_maintenance(&self, interval: Duration) -> bool {
        let mut slot = lock(&self.maintenance);
        if slot.as_ref().is_some_and(|m| !m.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let dedup = self.dedup.clone();
        let distributed = self.distributed.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sweep(&dedup, distributed.as_deref());
                        if report != MaintenanceReport::default() {
                            debug!(
                                stale_requests = report.stale_requests,
                                expired_entries = report.expired_entries,
                                "maintenance sweep"
                            );
                        }
                    }
                }
            }
            debug!("maintenance task stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "started resilience maintenance");
        *slot = Some(Maintenance { token, handle });
        true
    }

    /// [`start_maintenance`](Self::start_maintenance) at the configured
    /// `maintenance_interval_ms`.
    pub fn start_configured_maintenance(&self) -> bool {
        self.start_maintenance(self.config.maintenance_interval())
    }

    /// Stops the periodic sweep. Returns `false` if it was not running.
    pub fn stop_maintenance(&self) -> bool {
        match lock(&self.maintenance).take() {
            Some(m) => {
                m.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_maintenance_running(&self) -> bool {
        lock(&self.maintenance)
            .as_ref()
            .is_some_and(|m| !m.handle.is_finished())
    }

    /// Stats for every registered breaker, by name.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = lock(&self.breakers).values().cloned().collect();
        let mut stats: Vec<CircuitBreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn limiter_snapshots(&self) -> Vec<RateLimiterSnapshot> {
        let limiters: Vec<RateLimiter> = lock(&self.limiters).values().cloned().collect();
        let mut snapshots: Vec<RateLimiterSnapshot> = limiters.iter().map(|l| l.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Drop for ResilienceRegistry {
    fn drop(&mut self) {
        if let Some(m) = lock(&self.maintenance).take() {
            m.token.cancel();
        }
    }
}
