use std::time::Duration;
use tokio::time::Instant;

/// Refillable permit counter.
///
/// Tokens accumulate at `refill_rate` per second up to `max_tokens` and are
/// refilled lazily whenever the bucket is observed. The bucket holds no lock
/// of its own; [`RateLimiter`](super::rate_limiter::RateLimiter) owns one
/// behind its state mutex.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket. Negative or non-finite inputs are clamped to zero.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        let max_tokens = sanitize(max_tokens);
        Self {
            max_tokens,
            refill_rate: sanitize(refill_rate),
            tokens: max_tokens,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    /// Consumes `n` tokens if all of them are available. Negative or
    /// non-finite requests are refused.
    pub fn try_consume(&mut self, n: f64) -> bool {
        if !valid_request(n) {
            return false;
        }
        self.refill();
        if n <= self.tokens {
            self.tokens = (self.tokens - n).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens will be available; zero if they already are.
    ///
    /// Returns `Duration::MAX` when `n` can never be satisfied.
    pub fn wait_time(&mut self, n: f64) -> Duration {
        if !valid_request(n) {
            return Duration::MAX;
        }
        self.refill();
        if n <= self.tokens {
            return Duration::ZERO;
        }
        if n > self.max_tokens || self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((n - self.tokens) / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Returns tokens to the bucket, capped at capacity.
    pub fn refund(&mut self, n: f64) {
        if !valid_request(n) {
            return;
        }
        self.refill();
        self.tokens = (self.tokens + n.max(0.0)).min(self.max_tokens);
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

pub(crate) fn valid_request(n: f64) -> bool {
    n.is_finite() && n >= 0.0
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}
