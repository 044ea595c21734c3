//! Retry policy for failed requests.
//!
//! [`RequestRetry`] is a stateless evaluator: callers keep their own `retry_count` and ask
//! [`RequestRetry::should_retry`] and [`RequestRetry::get_retry_delay`] after each failure.
//! [`RequestRetry::execute`] wraps the same decisions in a ready-made loop.
//!
//! Semantics:
//! - `retry_count` is the number of retries already made (0 after the first failure).
//! - Nothing is retried when disabled, once `retry_count >= max_retries`, or when the request
//!   method is outside the allow-list (POST and PATCH are excluded by default).
//! - An error is retryable when its HTTP status is in `status_codes`, or when it looks like a
//!   network failure (timeouts, refused/reset connections, DNS failures).
//! - The delay is `base * 2^retry_count` plus up to 20% jitter, unless a custom delay function
//!   is configured, which then decides the delay alone.
//!
//! ```rust
//! use reqpolicy::retry::{RequestRetry, RetryConfig};
//! use reqpolicy::error::{HttpError, RequestError};
//! use reqpolicy::request::Method;
//!
//! let retry = RequestRetry::new(RetryConfig::enabled());
//! let unavailable: RequestError = HttpError::from_status(503, "", None).into();
//! assert!(retry.should_retry(&unavailable, 0, Some(Method::Get)));
//! assert!(!retry.should_retry(&unavailable, 0, Some(Method::Post)));
//! assert!(!retry.should_retry(&unavailable, 3, Some(Method::Get)));
//! ```

use crate::backoff::{Backoff, Jitter};
use crate::config::DynamicConfig;
use crate::error::RequestError;
use crate::request::Method;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit, NullSink, PolicyEvent, RetryEvent, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Statuses retried by default.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Methods retried by default: everything assumed idempotent.
pub const DEFAULT_RETRY_METHODS: [Method; 5] =
    [Method::Get, Method::Put, Method::Delete, Method::Head, Method::Options];

const NETWORK_ERROR_MESSAGES: [&str; 7] = [
    "network error",
    "connection refused",
    "connection reset",
    "timeout",
    "socket hang up",
    "dns",
    "getaddrinfo",
];

const NETWORK_ERROR_CODES: [&str; 6] =
    ["ETIMEDOUT", "ECONNREFUSED", "ECONNRESET", "ENOTFOUND", "EAI_AGAIN", "ERR_NETWORK"];

/// Custom delay function: `(retry_count, error) -> delay`.
pub type RetryDelayFn = Arc<dyn Fn(u32, Option<&RequestError>) -> Duration + Send + Sync>;

/// How long to wait before a retry.
#[derive(Clone)]
pub enum RetryDelay {
    /// `base * 2^retry_count` with up to 20% jitter.
    Exponential(Duration),
    /// Caller-supplied delay; no backoff math applied.
    Custom(RetryDelayFn),
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Exponential(base) => f.debug_tuple("Exponential").field(base).finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential(Duration::from_millis(1000))
    }
}

impl Serialize for RetryDelay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RetryDelay::Exponential(base) => crate::config::serde_millis::serialize(base, serializer),
            RetryDelay::Custom(_) => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for RetryDelay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        crate::config::serde_millis::deserialize(deserializer).map(RetryDelay::Exponential)
    }
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay: RetryDelay,
    pub status_codes: BTreeSet<u16>,
    pub methods: BTreeSet<Method>,
}

impl RetryConfig {
    /// Enabled with 3 retries over the default statuses and methods.
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.retry_delay = RetryDelay::Exponential(base);
        self
    }

    pub fn with_delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, Option<&RequestError>) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay = RetryDelay::Custom(Arc::new(f));
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes = codes.into_iter().collect();
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            retry_delay: RetryDelay::default(),
            status_codes: DEFAULT_RETRY_STATUS_CODES.into_iter().collect(),
            methods: DEFAULT_RETRY_METHODS.into_iter().collect(),
        }
    }
}

/// Retry evaluator plus an optional retry loop.
#[derive(Clone)]
pub struct RequestRetry {
    config: DynamicConfig<RetryConfig>,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for RequestRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRetry")
            .field("config", &self.config.get())
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl RequestRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: DynamicConfig::new(config),
            jitter: Jitter::standard(),
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(NullSink),
        }
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Override the jitter applied to exponential delays.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Update settings in place.
    pub fn configure(&self, f: impl FnOnce(&mut RetryConfig)) {
        self.config.modify(f);
    }

    pub fn config(&self) -> Arc<RetryConfig> {
        self.config.get()
    }

    /// Decide whether a failed request should be tried again.
    pub fn should_retry(&self, error: &RequestError, retry_count: u32, method: Option<Method>) -> bool {
        let cfg = self.config.get();
        if !cfg.enabled || retry_count >= cfg.max_retries {
            return false;
        }
        if let Some(method) = method {
            if !cfg.methods.contains(&method) {
                return false;
            }
        }
        if let Some(status) = error.status() {
            if cfg.status_codes.contains(&status) {
                return true;
            }
        }
        is_network_error(error)
    }

    /// Delay before the next attempt.
    pub fn get_retry_delay(&self, retry_count: u32, error: Option<&RequestError>) -> Duration {
        match &self.config.get().retry_delay {
            RetryDelay::Custom(f) => f(retry_count, error),
            RetryDelay::Exponential(base) => {
                Backoff::exponential(*base).with_jitter(self.jitter).delay(retry_count)
            }
        }
    }

    /// Run `op` until it succeeds or a failure is not retryable.
    ///
    /// `op` receives the attempt index (0 for the initial call).
    pub async fn execute<T, Fut, Op>(&self, method: Method, mut op: Op) -> Result<T, RequestError>
    where
        Fut: Future<Output = Result<T, RequestError>>,
        Op: FnMut(u32) -> Fut,
    {
        let mut retry_count = 0u32;
        loop {
            match op(retry_count).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.is_cancelled() || !self.should_retry(&err, retry_count, Some(method)) {
                        if retry_count > 0 {
                            emit(
                                &self.sink,
                                PolicyEvent::Retry(RetryEvent::GaveUp {
                                    attempts: retry_count + 1,
                                    status: err.status(),
                                }),
                            );
                        }
                        return Err(err);
                    }
                    let delay = self.get_retry_delay(retry_count, Some(&err));
                    tracing::debug!(
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    emit(
                        &self.sink,
                        PolicyEvent::Retry(RetryEvent::Attempt { retry: retry_count + 1, delay }),
                    );
                    self.sleeper.sleep(delay).await;
                    retry_count += 1;
                }
            }
        }
    }
}

/// `true` when the error looks like a failure to reach the server at all.
pub fn is_network_error(error: &RequestError) -> bool {
    let Some(http) = error.as_http() else {
        return false;
    };
    if let Some(code) = http.code.as_deref() {
        if NETWORK_ERROR_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return true;
        }
    }
    let message = http.message.to_ascii_lowercase();
    NETWORK_ERROR_MESSAGES.iter().any(|needle| message.contains(needle))
}
