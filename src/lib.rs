//! # throttle-shield
//!
//! Resilience layer for services that call flaky or quota-limited
//! dependencies: token bucket and queued rate limiting, circuit breaking,
//! cross-instance rate limiting over a shared Redis-compatible REST store,
//! retry with backoff and jitter, and in-flight request deduplication.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use throttle_shield::config::ShieldConfig;
//! use throttle_shield::resilience::{RateLimitType, ResilienceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> throttle_shield::Result<()> {
//!     let config = ShieldConfig::from_env();
//!     let registry = ResilienceRegistry::with_distributed_from_config(config)?;
//!     registry.start_configured_maintenance();
//!
//!     if let Some(limiter) = registry.distributed() {
//!         limiter
//!             .check("user:42", RateLimitType::Write)
//!             .await
//!             .into_result("write")?;
//!     }
//!
//!     let profile = registry
//!         .with_circuit_breaker("profiles", || async { Ok("profile") }, None)
//!         .await?;
//!     println!("{}", profile);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Limiters, breaker, retry, dedup and the registry |
//! | [`config`] | Environment and YAML configuration |
//! | [`error`] | Error taxonomy and boundary payloads |
//! | [`transport`] | REST client for the shared rate store |

pub mod config;
pub mod error;
pub mod error_code;
pub mod resilience;
pub mod transport;

pub use error::{ApiError, ApiResponse, Error, ErrorContext};
pub use error_code::ErrorCode;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
