//! Error types shared by every request policy.
//!
//! Three families of failure reach a caller:
//! - transport failures, normalized into [`HttpError`] (`message`, `status`, `code`, `details`);
//! - policy rejections (rate limit, full queue, batch count mismatch, cancellation), each its own
//!   [`RequestError`] variant so callers can branch on the cause without string matching;
//! - configuration failures, returned synchronously from constructors and factories.
//!
//! `RequestError` is `Clone`: a failed batch or a cleared throttle queue hands the same error to
//! every member of the group.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Normalized shape of a failed network call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct HttpError {
    /// Human readable description.
    pub message: String,
    /// HTTP status, when the server answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Reason phrase of `status`, e.g. `Not Found`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    /// Machine readable code (`ETIMEDOUT`, `ERR_BAD_RESPONSE`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Response body or any extra context the transport captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HttpError {
    /// Error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, status_text: None, code: None, details: None }
    }

    /// Error for a response whose status is `>= 400`.
    pub fn from_status(status: u16, status_text: &str, details: Option<Value>) -> Self {
        let code = if status >= 500 { "ERR_BAD_RESPONSE" } else { "ERR_BAD_REQUEST" };
        Self {
            message: format!("Request failed with status code {status}"),
            status: Some(status),
            status_text: (!status_text.is_empty()).then(|| status_text.to_string()),
            code: Some(code.to_string()),
            details,
        }
    }

    /// Error for a request that exceeded its `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            message: format!("timeout of {}ms exceeded", timeout.as_millis()),
            status: None,
            status_text: None,
            code: Some("ETIMEDOUT".to_string()),
            details: None,
        }
    }

    /// Error for a request that never produced a response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            status_text: None,
            code: Some("ERR_NETWORK".to_string()),
            details: None,
        }
    }

    /// Attach a code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Unified error type for requests flowing through the policy layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The transport failed or the server answered with an error status.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// The throttler is at its limit and configured to fail fast.
    #[error("rate limit exceeded: {limit} requests per {}ms", .interval.as_millis())]
    RateLimited { limit: usize, interval: Duration },
    /// The throttler queue cannot take another request.
    #[error("throttle queue is full ({max_queue_size} requests waiting)")]
    QueueFull { max_queue_size: usize },
    /// A batch executor returned a different number of responses than requests.
    #[error("batch executor returned {actual} responses for {expected} requests")]
    BatchSizeMismatch { expected: usize, actual: usize },
    /// Batching was turned off while the request waited in a batch.
    #[error("request batching disabled; pending batch rejected")]
    BatchingDisabled,
    /// The request was cancelled before it completed.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },
    /// Invalid setup, reported synchronously.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RequestError {
    /// Build a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled { reason: reason.into() }
    }

    /// HTTP status of a transport error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status,
            _ => None,
        }
    }

    /// Code of a transport error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Http(e) => e.code.as_deref(),
            _ => None,
        }
    }

    /// Borrow the normalized transport error.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this error is a throttler rejection (rate limit or full queue).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::QueueFull { .. })
    }

    /// Reason recorded by the cancellation source, if this is a cancellation.
    pub fn cancellation_reason(&self) -> Option<&str> {
        match self {
            Self::Cancelled { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_error_is_normalized() {
        let err = HttpError::from_status(503, "Service Unavailable", Some(json!({"retry": true})));
        assert_eq!(err.status, Some(503));
        assert_eq!(err.code.as_deref(), Some("ERR_BAD_RESPONSE"));
        assert_eq!(err.message, "Request failed with status code 503");
        assert_eq!(err.status_text.as_deref(), Some("Service Unavailable"));
        assert_eq!(err.details, Some(json!({"retry": true})));

        let client_side = HttpError::from_status(404, "", None);
        assert_eq!(client_side.code.as_deref(), Some("ERR_BAD_REQUEST"));
        assert_eq!(client_side.message, "Request failed with status code 404");
        assert_eq!(client_side.status_text, None);
    }

    #[test]
    fn timeout_error_carries_code() {
        let err = HttpError::timeout(Duration::from_millis(1500));
        assert_eq!(err.code.as_deref(), Some("ETIMEDOUT"));
        assert!(err.message.contains("1500ms"));
    }

    #[test]
    fn accessors_cover_variants() {
        let http: RequestError = HttpError::from_status(429, "Too Many Requests", None).into();
        assert_eq!(http.status(), Some(429));
        assert_eq!(http.code(), Some("ERR_BAD_REQUEST"));
        assert!(http.as_http().is_some());
        assert!(!http.is_cancelled());

        let cancelled = RequestError::cancelled("user navigated away");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.cancellation_reason(), Some("user navigated away"));
        assert_eq!(cancelled.status(), None);

        let limited = RequestError::RateLimited { limit: 2, interval: Duration::from_secs(1) };
        assert!(limited.is_rate_limited());
        assert!(RequestError::QueueFull { max_queue_size: 3 }.is_rate_limited());
    }

    #[test]
    fn display_messages_name_the_cause() {
        let mismatch = RequestError::BatchSizeMismatch { expected: 3, actual: 2 };
        assert_eq!(mismatch.to_string(), "batch executor returned 2 responses for 3 requests");

        let limited = RequestError::RateLimited { limit: 5, interval: Duration::from_millis(1000) };
        assert_eq!(limited.to_string(), "rate limit exceeded: 5 requests per 1000ms");

        let http: RequestError = HttpError::network("connection refused").into();
        assert_eq!(http.to_string(), "connection refused");
    }
}
