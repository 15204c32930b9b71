use crate::error_code::ErrorCode;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Structured error context for configuration and internal failures.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key or field that caused the error (e.g., "store.rest_url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "rate_limiter", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Classified failure of a protected operation.
///
/// This is the `{code, message, retryable, details}` payload that callers
/// return from the operations they hand to the resilience wrappers, and the
/// payload exposed at the application boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// HTTP status of the upstream response, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ApiError {
    /// Creates an error whose retryable flag is the code's default.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
            details: None,
            status: None,
        }
    }

    /// Builds an error from an upstream HTTP status and body text.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::from_http_status(status), message);
        err.status = Some(status);
        err
    }

    /// Builds an error by classifying free-form error text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorCode::classify_message(&message), message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Unified error type for the resilience layer.
///
/// `Error` is `Clone` so that one deduplicated outcome can be delivered to
/// every caller waiting on the same key.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Circuit breaker '{name}' is open (retry after {retry_after_ms}ms)")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Rate limit exceeded for '{scope}' (retry after {retry_after_ms}ms)")]
    RateLimited { scope: String, retry_after_ms: u64 },

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation '{operation}' timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Internal error: {message}{}", format_context(.context))]
    Internal {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn internal_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Internal {
            message: msg.into(),
            context,
        }
    }

    /// Shorthand for wrapping a classified API failure.
    pub fn api(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Api(ApiError::new(code, message))
    }

    /// The classified kind of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::RateLimited { .. } => ErrorCode::RateLimited,
            Error::Api(e) => e.code,
            Error::Transport(e) => e.code(),
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Validation { .. } => ErrorCode::ValidationError,
            Error::Configuration { .. } | Error::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether the failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::CircuitOpen { .. } | Error::RateLimited { .. } | Error::Timeout { .. } => true,
            Error::Api(e) => e.retryable,
            Error::Transport(e) => e.code().retryable(),
            Error::Configuration { .. } | Error::Validation { .. } | Error::Internal { .. } => {
                false
            }
        }
    }

    /// Upstream HTTP status, if the failure came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(e) => e.status,
            Error::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// Computed wait before the operation may succeed, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_after_ms, .. }
            | Error::RateLimited { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            Error::Api(e) => e
                .details
                .as_ref()
                .and_then(|d| d.get("retryAfterMs"))
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Text safe to show an end user.
    ///
    /// Breaker names, upstream messages and context never leak here; those
    /// belong in logs.
    pub fn user_message(&self) -> String {
        match self.code() {
            ErrorCode::ValidationError => "The request could not be processed.".to_string(),
            ErrorCode::NotFound => "The requested item could not be found.".to_string(),
            ErrorCode::Unauthorized => "Please sign in again to continue.".to_string(),
            _ => match self.retry_after() {
                Some(wait) => {
                    let secs = (wait.as_millis() as u64).div_ceil(1000).max(1);
                    format!(
                        "The service is busy right now. Please try again in {} second{}.",
                        secs,
                        if secs == 1 { "" } else { "s" }
                    )
                }
                None => "Something went wrong. Please try again later.".to_string(),
            },
        }
    }

    /// Converts into the boundary payload, with user-safe text.
    pub fn to_api_error(&self) -> ApiError {
        let mut api = ApiError::new(self.code(), self.user_message())
            .with_retryable(self.is_retryable());
        if let Some(wait) = self.retry_after() {
            api = api.with_details(serde_json::json!({ "retryAfterMs": wait.as_millis() as u64 }));
        }
        api.status = self.status();
        api
    }
}

/// Boundary wire shape: `{"ok":true,"data":...}` or `{"ok":false,"error":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ApiError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// Converts back into a `Result`; a malformed payload becomes an internal error.
    pub fn into_result(self) -> crate::Result<T> {
        match (self.ok, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (false, _, Some(error)) => Err(Error::Api(error)),
            _ => Err(Error::internal_with_context(
                "malformed api response",
                ErrorContext::new().with_source("api_response"),
            )),
        }
    }
}

impl<T> From<crate::Result<T>> for ApiResponse<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(e.to_api_error()),
        }
    }
}
