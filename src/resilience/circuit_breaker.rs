use crate::config::duration_ms;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics only; nothing here feeds back into control decisions.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub total_requests: u64,
    /// `failures_in_window / min(total_requests, 100)`.
    pub failure_rate: f64,
    pub since_last_success: Option<Duration>,
    pub since_last_failure: Option<Duration>,
    pub since_state_change: Duration,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `monitoring_window` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Cooldown before an open circuit admits trial calls.
    #[serde(with = "duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
    /// Age after which a failure no longer counts.
    #[serde(with = "duration_ms", rename = "monitoring_window_ms")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    state_changed_at: Instant,
    total_requests: u64,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

/// Failure-rate circuit breaker.
///
/// - CLOSED: failures are kept in a sliding window; reaching
///   `failure_threshold` opens the circuit
/// - OPEN: calls fail fast until `reset_timeout` has elapsed, checked lazily
/// - HALF_OPEN: one failure reopens, `success_threshold` successes close
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::named("default", cfg)
    }

    pub fn named(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                state_changed_at: Instant::now(),
                total_requests: 0,
                last_success: None,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, st: &mut State, now: Instant) {
        while let Some(oldest) = st.failures.front() {
            if now.saturating_duration_since(*oldest) > self.cfg.monitoring_window {
                st.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prunes the window and performs the lazy OPEN -> HALF_OPEN move.
    fn refresh(&self, st: &mut State, now: Instant) {
        self.prune(st, now);
        if st.state == CircuitState::Open
            && now.saturating_duration_since(st.state_changed_at) >= self.cfg.reset_timeout
        {
            self.transition(st, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, st: &mut State, to: CircuitState, now: Instant) {
        let from = st.state;
        st.state = to;
        st.state_changed_at = now;
        st.half_open_successes = 0;
        match to {
            CircuitState::Open => {
                st.failures.clear();
                warn!(
                    breaker = %self.name,
                    from = %from,
                    cooldown_ms = self.cfg.reset_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "circuit breaker half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                st.failures.clear();
                info!(breaker = %self.name, "circuit breaker closed");
            }
        }
    }

    fn open_remaining(&self, st: &State, now: Instant) -> Duration {
        self.cfg
            .reset_timeout
            .saturating_sub(now.saturating_duration_since(st.state_changed_at))
    }

    /// Checks whether a call may proceed right now.
    pub fn allow(&self) -> Result<()> {
        let now = Instant::now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        if st.state == CircuitState::Open {
            let remaining = self.open_remaining(&st, now);
            debug!(
                breaker = %self.name,
                retry_after_ms = remaining.as_millis() as u64,
                "circuit breaker rejected call"
            );
            return Err(Error::CircuitOpen {
                name: self.name.clone(),
                retry_after_ms: remaining.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Check if a request is allowed (alias for allow)
    pub fn allow_request(&self) -> bool {
        self.allow().is_ok()
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        st.total_requests = st.total_requests.saturating_add(1);
        st.last_success = Some(now);
        self.refresh(&mut st, now);
        if st.state == CircuitState::HalfOpen {
            st.half_open_successes += 1;
            if st.half_open_successes >= self.cfg.success_threshold {
                self.transition(&mut st, CircuitState::Closed, now);
            }
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        st.total_requests = st.total_requests.saturating_add(1);
        st.last_failure = Some(now);
        self.refresh(&mut st, now);
        match st.state {
            CircuitState::Closed => {
                st.failures.push_back(now);
                if st.failures.len() >= self.cfg.failure_threshold as usize {
                    self.transition(&mut st, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut st, CircuitState::Open, now),
            // A call admitted before the circuit opened; the cooldown is already running.
            CircuitState::Open => {}
        }
    }

    /// Runs `op` through the breaker.
    ///
    /// When the circuit is open, `op` is not invoked and
    /// [`Error::CircuitOpen`] carries the remaining cooldown.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                debug!(breaker = %self.name, error = %e, "protected call failed");
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        st.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        let failures = st.failures.len();
        let denominator = st.total_requests.min(100);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: st.state,
            failures_in_window: failures,
            total_requests: st.total_requests,
            failure_rate: if denominator == 0 {
                0.0
            } else {
                failures as f64 / denominator as f64
            },
            since_last_success: st.last_success.map(|t| now.saturating_duration_since(t)),
            since_last_failure: st.last_failure.map(|t| now.saturating_duration_since(t)),
            since_state_change: now.saturating_duration_since(st.state_changed_at),
            open_remaining_ms: (st.state == CircuitState::Open)
                .then(|| self.open_remaining(&st, now).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::named(
            "rpc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_millis(1000))
                .with_monitoring_window(Duration::from_millis(5000)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(Error::api(ErrorCode::NetworkError, "boom")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_short_circuits() {
        let cb = breaker();
        for _ in 0..3 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let err = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(400)).await;
        let err = cb.allow().unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_close_after_successes() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(succeed(&cb).await.is_ok());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Cooldown restarted from the reopen.
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_the_window() {
        let cb = breaker();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(5001)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let cb = breaker();
        let _ = succeed(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(250)).await;

        let stats = cb.stats();
        assert_eq!(stats.name, "rpc");
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failures_in_window, 1);
        assert!((stats.failure_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.since_last_failure, Some(Duration::from_millis(250)));
        assert!(stats.open_remaining_ms.is_none());
    }

    #[test]
    fn test_circuit_breaker_thread_safe() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(1000)
            .with_monitoring_window(Duration::from_secs(3600));
        let cb = Arc::new(CircuitBreaker::new(config));

        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    cb_clone.record_failure();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = cb.stats();
        assert_eq!(stats.failures_in_window, 50);
        assert_eq!(stats.total_requests, 50);
        assert_eq!(stats.state, CircuitState::Closed);
    }
}
