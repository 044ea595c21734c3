#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # reqpolicy
//!
//! Client-side request policies for async Rust, composed around one HTTP client contract.
//!
//! ## Features
//!
//! - **Cache** of successful responses with TTL, capacity eviction and pattern invalidation
//! - **Throttle** with a sliding window, FIFO queueing or immediate rejection
//! - **Retry** on retryable statuses and network failures with exponential backoff
//! - **Batching** of concurrent requests sharing a key into one executor call
//! - **Debounce** by key with max-wait and cancellation of superseded calls
//! - **Cancellation** tokens with a process-wide registry for "cancel everything"
//! - **Interceptors** and a pluggable transport (`reqwest` by default)
//!
//! Every policy is pass-through until enabled, so a client with nothing turned on behaves like
//! the bare transport.
//!
//! ## Quick Start
//!
//! ```rust
//! use reqpolicy::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = Arc::new(|req: RequestOptions| async move {
//!     Ok::<_, RequestError>(HttpResponse::new(req, 200, ResponseBody::from("ok")))
//! });
//!
//! let client = PolicyClient::builder(InterceptorClient::new(transport))
//!     .with_cache(CacheConfig::enabled().with_ttl(Duration::from_secs(60)))
//!     .with_retry(RetryConfig::enabled().with_max_retries(3))
//!     .with_throttling(ThrottleConfig::enabled().with_limit(10))
//!     .build();
//!
//! let res = client.get("/pets").await.unwrap();
//! assert!(res.is_success());
//! # }
//! ```

pub mod api;
pub mod backoff;
pub mod batch;
pub mod cache;
pub mod cancellation;
pub mod client;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod prelude;
pub mod request;
pub mod retry;
pub mod sleeper;
pub mod stack;
pub mod telemetry;
pub mod throttle;
pub mod transport;

// Re-exports
pub use api::{ApiClient, Configuration, Endpoint, EndpointContext};
pub use backoff::{Backoff, Jitter};
pub use batch::{BatchConfig, BatchExecutor, RequestBatcher};
pub use cache::{CacheConfig, CachePattern, RequestCache};
pub use cancellation::{
    cancel_all_requests, create_cancellation_token, create_tracked_cancellation_token, CancelSignal,
    CancellationToken,
};
pub use client::{HttpClient, InterceptorClient, RequestInterceptor, ResponseInterceptor, Transport};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DynamicConfig, PolicyConfig};
pub use debounce::{
    cancel_all_debounced_requests, debounce_request, DebounceConfig, DebounceManager, DebounceOptions,
    DebouncedFn,
};
pub use error::{HttpError, RequestError};
pub use request::{HttpResponse, Method, RequestOptions, ResponseBody, ResponseType};
pub use retry::{RequestRetry, RetryConfig};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use stack::{PolicyClient, PolicyClientBuilder};
pub use telemetry::{LogSink, MemorySink, NullSink, PolicyEvent, TelemetrySink};
pub use throttle::{RequestThrottler, ThrottleConfig, ThrottleLayer, ThrottleStrategy};
pub use transport::{create_client, create_transport, ReqwestOptions, TransportKind};
