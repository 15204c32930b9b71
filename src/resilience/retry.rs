//! Retry with exponential backoff and jitter.

use crate::error::ApiError;
use crate::error_code::ErrorCode;
use crate::transport::TransportError;
use crate::{Error, Result};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Statuses treated as transient.
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

pub type RetryClassifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Delays are perturbed uniformly within `±jitter_factor` of their value.
    pub jitter_factor: f64,
    /// Overrides [`is_retryable_error`] when set.
    pub retryable: Option<RetryClassifier>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retryable: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("retryable", &self.retryable.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(classifier));
        self
    }

    /// `min(initial_delay * multiplier^attempt, max_delay)`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let cap = self.max_delay.as_secs_f64();
        let secs = (self.initial_delay.as_secs_f64() * factor).min(cap);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// [`base_delay`](Self::base_delay) perturbed by jitter, still capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(scale).min(self.max_delay)
    }

    fn should_retry(&self, error: &Error) -> bool {
        match &self.retryable {
            Some(classifier) => classifier(error),
            None => is_retryable_error(error),
        }
    }
}

/// Default retry classification.
///
/// An [`ApiError`]'s own retryable flag is final; when it carries an HTTP
/// status, that status must also be in [`RETRYABLE_STATUSES`]. Other errors
/// with a status retry only on the allowlist. Typed errors otherwise follow
/// [`Error::is_retryable`], and only untyped failures (internal errors and
/// opaque transport errors) fall back to matching their raw message against
/// rate limit, timeout and connection failure phrasing.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Api(e) => {
            e.retryable && e.status.map_or(true, |s| RETRYABLE_STATUSES.contains(&s))
        }
        Error::Internal { message, .. } => message_suggests_retry(message),
        Error::Transport(TransportError::Other(message)) => message_suggests_retry(message),
        _ => match error.status() {
            Some(status) => RETRYABLE_STATUSES.contains(&status),
            None => error.is_retryable(),
        },
    }
}

fn message_suggests_retry(message: &str) -> bool {
    ErrorCode::classify_message(message).retryable()
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out
/// of retries. The last error is returned unchanged.
///
/// A retry-after hint carried by the error raises the next delay to at least
/// that value (itself capped at `max_delay`).
pub async fn retry_with_backoff<T, F, Fut>(mut op: F, options: &RetryOptions) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= options.max_retries || !options.should_retry(&e) {
                    if attempt > 0 {
                        warn!(attempts = attempt + 1, error = %e, "giving up after retries");
                    }
                    return Err(e);
                }
                let mut delay = options.delay_for(attempt);
                if let Some(hint) = e.retry_after() {
                    delay = delay.max(hint.min(options.max_delay));
                }
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Parses a delta-seconds `Retry-After` value. HTTP-date values are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Sends the request produced by `build`, retrying transport failures and
/// responses whose status is in [`RETRYABLE_STATUSES`].
///
/// Other non-success statuses are returned as non-retryable errors without
/// retrying. The final retryable response, if retries run out, is surfaced
/// as an [`Error::Api`] carrying its status.
pub async fn fetch_with_retry<F>(
    client: &reqwest::Client,
    build: F,
    options: &RetryOptions,
) -> Result<reqwest::Response>
where
    F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
{
    retry_with_backoff(
        || async {
            let response = build(client)
                .send()
                .await
                .map_err(|e| Error::Transport(TransportError::from(e)))?;
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                return Ok(response);
            }

            let code = status.as_u16();
            let retry_after = parse_retry_after(response.headers());
            let reason = status.canonical_reason().unwrap_or("unexpected status");
            let mut err = ApiError::from_status(code, format!("{} {}", code, reason))
                .with_retryable(RETRYABLE_STATUSES.contains(&code));
            if let Some(wait) = retry_after {
                err = err.with_details(serde_json::json!({
                    "retryAfterMs": wait.as_millis() as u64
                }));
            }
            Err(Error::Api(err))
        },
        options,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn quick() -> RetryOptions {
        RetryOptions::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_jitter_factor(0.0)
    }

    #[test]
    fn test_base_delay_is_non_decreasing_and_capped() {
        let opts = RetryOptions::default();
        let delays: Vec<Duration> = (0..10).map(|a| opts.base_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= opts.max_delay));
        assert_eq!(delays[9], Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let opts = RetryOptions::default();
        for _ in 0..200 {
            let d = opts.delay_for(1).as_secs_f64();
            assert!((1.8..=2.2).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_classifier() {
        assert!(is_retryable_error(&Error::Api(ApiError::from_status(503, "down"))));
        assert!(is_retryable_error(&Error::Api(ApiError::from_status(429, "slow down"))));
        assert!(!is_retryable_error(&Error::Api(ApiError::from_status(404, "gone"))));
        assert!(!is_retryable_error(&Error::Api(ApiError::from_status(501, "nope"))));
        assert!(is_retryable_error(&Error::Internal {
            message: "read ECONNRESET".into(),
            context: Default::default(),
        }));
        assert!(!is_retryable_error(&Error::Validation {
            message: "request timed out".into(),
            context: Default::default(),
        }));
        assert!(is_retryable_error(&Error::Timeout {
            operation: "fetch".into(),
            after_ms: 10,
        }));
        assert!(is_retryable_error(&Error::Transport(TransportError::Other(
            "connection reset by peer".into()
        ))));
        assert!(!is_retryable_error(&Error::Transport(TransportError::Http {
            status: Some(404),
            message: "connection reset".into(),
        })));
    }

    #[test]
    fn test_explicit_non_retryable_flag_is_final() {
        let quota = ApiError::new(ErrorCode::RateLimited, "daily quota exhausted").with_retryable(false);
        let network = ApiError::new(ErrorCode::NetworkError, "connection reset").with_retryable(false);
        let upstream = ApiError::from_status(503, "maintenance").with_retryable(false);
        assert!(!is_retryable_error(&Error::Api(quota)));
        assert!(!is_retryable_error(&Error::Api(network)));
        assert!(!is_retryable_error(&Error::Api(upstream)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_tag_makes_single_call() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Api(
                    ApiError::new(ErrorCode::RateLimited, "daily quota exhausted")
                        .with_retryable(false),
                ))
            },
            &quick(),
        )
        .await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(Error::api(ErrorCode::NetworkError, "connection reset"))
                } else {
                    Ok(n)
                }
            },
            &quick(),
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::api(ErrorCode::Timeout, format!("attempt {}", n)))
            },
            &quick().with_max_retries(2),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::api(ErrorCode::ValidationError, "bad input"))
            },
            &quick(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_and_retry_after_hint() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let opts = quick().with_classifier(|e| matches!(e, Error::RateLimited { .. }));
        let result = retry_with_backoff(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::RateLimited {
                        scope: "api".into(),
                        retry_after_ms: 600,
                    })
                } else {
                    Ok("done")
                }
            },
            &opts,
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }
}
