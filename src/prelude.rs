//! Convenient re-exports for common reqpolicy types.
pub use crate::{
    batch::{BatchConfig, BatchExecutor, RequestBatcher},
    cache::{CacheConfig, RequestCache},
    cancellation::{CancelSignal, CancellationToken},
    client::{HttpClient, InterceptorClient, RequestInterceptor, ResponseInterceptor, Transport},
    config::PolicyConfig,
    debounce::{DebounceConfig, DebounceManager},
    error::{HttpError, RequestError},
    request::{HttpResponse, Method, RequestOptions, ResponseBody, ResponseType},
    retry::{RequestRetry, RetryConfig},
    stack::{PolicyClient, PolicyClientBuilder},
    telemetry::{PolicyEvent, TelemetrySink},
    throttle::{RequestThrottler, ThrottleConfig, ThrottleLayer, ThrottleStrategy},
};
