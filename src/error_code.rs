//! Classified API error kinds.
//!
//! Every failure that crosses the resilience layer is tagged with one of
//! these codes, and every code carries a default retryable flag. Callers at
//! the application boundary use the code to decide whether to retry, surface
//! or escalate.
//!
//! ## Example
//!
//! ```rust
//! use throttle_shield::error_code::ErrorCode;
//!
//! let code = ErrorCode::from_http_status(429);
//! assert_eq!(code.as_str(), "RATE_LIMITED");
//! assert!(code.retryable());
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Connection refused/reset, DNS failure, broken transport.
    NetworkError,
    /// Local or remote rate limit hit.
    RateLimited,
    /// A circuit breaker is rejecting calls.
    CircuitOpen,
    /// The operation did not finish in time.
    Timeout,
    /// The request itself is malformed.
    ValidationError,
    /// The target does not exist.
    NotFound,
    /// Missing or rejected credentials.
    Unauthorized,
    /// Remote or local server-side fault.
    InternalError,
    /// Could not be classified.
    UnknownError,
}

impl ErrorCode {
    /// Returns the wire name (e.g. `"CIRCUIT_OPEN"`).
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Timeout => "TIMEOUT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether a failure of this kind is worth retrying by default.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::RateLimited
                | Self::CircuitOpen
                | Self::Timeout
                | Self::InternalError
        )
    }

    /// Maps an HTTP status code to the most likely error kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::ValidationError,
            401 | 403 => Self::Unauthorized,
            404 | 410 => Self::NotFound,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            500..=503 => Self::InternalError,
            505..=599 => Self::InternalError,
            _ => Self::UnknownError,
        }
    }

    /// Classifies free-form error text (typically from a transport or RPC
    /// error body) into an error kind.
    pub fn classify_message(message: &str) -> Self {
        if RATE_LIMIT_PATTERN.is_match(message) {
            Self::RateLimited
        } else if TIMEOUT_PATTERN.is_match(message) {
            Self::Timeout
        } else if NETWORK_PATTERN.is_match(message) {
            Self::NetworkError
        } else if NOT_FOUND_PATTERN.is_match(message) {
            Self::NotFound
        } else if UNAUTHORIZED_PATTERN.is_match(message) {
            Self::Unauthorized
        } else {
            Self::UnknownError
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|throttl")
        .expect("rate limit pattern is valid")
});

pub(crate) static TIMEOUT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timed? ?out|timeout|deadline exceeded|etimedout")
        .expect("timeout pattern is valid")
});

pub(crate) static NETWORK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)econnreset|econnrefused|connection (reset|refused|closed)|socket hang up|network|broken pipe|dns",
    )
    .expect("network pattern is valid")
});

static NOT_FOUND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)not found|\b404\b").expect("not found pattern is valid"));

static UNAUTHORIZED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unauthori[sz]ed|forbidden|invalid (api )?key|\b401\b|\b403\b")
        .expect("unauthorized pattern is valid")
});
