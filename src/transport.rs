//! HTTP transport to the shared rate store.
//!
//! The shared store speaks a Redis-over-REST protocol: every command is a
//! JSON array POSTed to the endpoint with a bearer token, and the reply is
//! `{"result": ...}` or `{"error": "..."}`.

pub mod http;

pub use http::RestCommandClient;

use crate::error_code::ErrorCode;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error{}: {message}", .status.map(|s| format!(" {}", s)).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    /// `after_ms` is the enforced bound, when the caller knows it.
    #[error("request timed out{}", .after_ms.map(|ms| format!(" after {}ms", ms)).unwrap_or_default())]
    Timeout { after_ms: Option<u64> },

    #[error("store replied with error: {0}")]
    Store(String),

    #[error("unexpected reply: {0}")]
    Decode(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Http {
                status: Some(status),
                ..
            } => ErrorCode::from_http_status(*status),
            TransportError::Http { status: None, .. } => ErrorCode::NetworkError,
            TransportError::Timeout { .. } => ErrorCode::Timeout,
            TransportError::Store(_) | TransportError::Decode(_) => ErrorCode::InternalError,
            TransportError::Other(_) => ErrorCode::NetworkError,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => *status,
            _ => None,
        }
    }
}

impl TransportError {
    /// Like the `From` conversion, but reports timeouts against `bound`.
    pub fn from_reqwest(e: reqwest::Error, bound: Duration) -> Self {
        if e.is_timeout() {
            return TransportError::Timeout {
                after_ms: Some(bound.as_millis() as u64),
            };
        }
        e.into()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return TransportError::Timeout { after_ms: None };
        }
        if e.is_decode() {
            return TransportError::Decode(e.to_string());
        }
        TransportError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}
