//! # Resilience Primitives Module
//!
//! Layers that protect calls to external dependencies from overload and
//! cascading failure. Each layer is usable on its own; a typical request
//! handler composes them as
//! dedup → rate limit → circuit breaker → retry → the real call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`token_bucket`] | Lazily refilled token bucket |
//! | [`rate_limiter`] | Queued, prioritized token bucket limiter |
//! | [`circuit_breaker`] | Sliding-window circuit breaker for failure isolation |
//! | [`distributed`] | Cross-instance limiter with local fallback |
//! | [`retry`] | Exponential backoff with jitter |
//! | [`dedup`] | In-flight request coalescing |
//! | [`registry`] | Named instances shared by all callers |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: operations pass; failures accumulate in a sliding window
//! - **Open**: calls fail fast with the remaining cooldown
//! - **Half-Open**: trial calls decide between closing and reopening
//!
//! ```rust
//! use throttle_shield::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(config);
//!
//! if breaker.allow_request() {
//!     // call the dependency...
//!     breaker.record_success();
//! }
//! ```
//!
//! ## Composition
//!
//! ```rust,no_run
//! use throttle_shield::resilience::{retry_with_backoff, AcquireOptions, ResilienceRegistry, RetryOptions};
//!
//! # async fn run(registry: &ResilienceRegistry) -> throttle_shield::Result<()> {
//! let body: String = registry
//!     .deduplicate_request(
//!         || async { Ok("feed".to_string()) },
//!         "feed:42",
//!     )
//!     .await?;
//! let retry = RetryOptions::default();
//! registry
//!     .with_rate_limit(
//!         "search",
//!         || registry.with_circuit_breaker(
//!             "search",
//!             || retry_with_backoff(|| async { Ok(()) }, &retry),
//!             None,
//!         ),
//!         AcquireOptions::default(),
//!     )
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod dedup;
pub mod distributed;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod token_bucket;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use dedup::{DedupKey, RequestDeduplicator};
pub use distributed::{
    DistributedRateLimiter, LimitSource, RateLimitOutcome, RateLimitType, RouteLimit,
    RouteLimitTable,
};
pub use rate_limiter::{AcquireOptions, BackoffOptions, RateLimiter, RateLimiterConfig};
pub use registry::{MaintenanceReport, ResilienceRegistry};
pub use retry::{fetch_with_retry, is_retryable_error, retry_with_backoff, RetryOptions};
pub use token_bucket::TokenBucket;
