//! Policy stack: every request policy composed around one [`HttpClient`].
//!
//! [`PolicyClient`] is itself an [`HttpClient`], so it can be handed to generated endpoint
//! code in place of the plain client. The layers wrap each other in this order:
//!
//! ```text
//! debounce → cache → retry → throttle → batch → inner client
//! ```
//!
//! Every layer is optional and pass-through when disabled, so a client with nothing enabled
//! behaves exactly like the inner client.
//!
//! ```rust
//! use reqpolicy::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = Arc::new(|req: RequestOptions| async move {
//!     Ok::<_, RequestError>(HttpResponse::new(req, 200, ResponseBody::from("pong")))
//! });
//! let client = PolicyClient::builder(InterceptorClient::new(transport))
//!     .with_cache(CacheConfig::enabled().with_ttl(Duration::from_secs(30)))
//!     .with_retry(RetryConfig::enabled())
//!     .build();
//!
//! let res = client.get("/ping").await.unwrap();
//! assert_eq!(res.status, 200);
//! # }
//! ```

use crate::batch::{BatchConfig, BatchExecutor, RequestBatcher};
use crate::cache::{default_cache_key, CacheConfig, RequestCache};
use crate::cancellation::CancellationToken;
use crate::client::HttpClient;
use crate::config::PolicyConfig;
use crate::debounce::{DebounceConfig, DebounceManager};
use crate::error::RequestError;
use crate::request::{HttpResponse, RequestOptions};
use crate::retry::{RequestRetry, RetryConfig};
use crate::telemetry::{emit, NullSink, PolicyEvent, RequestOutcome, TelemetrySink};
use crate::throttle::{RequestThrottler, ThrottleConfig};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower_service::Service;

struct PolicyInner {
    client: Arc<dyn HttpClient>,
    cache: Option<RequestCache>,
    retry: Option<RequestRetry>,
    throttler: Option<RequestThrottler>,
    batcher: Option<RequestBatcher>,
    batch_executor: Arc<dyn BatchExecutor>,
    debouncer: Option<DebounceManager>,
    cancellation: bool,
    sink: Arc<dyn TelemetrySink>,
}

/// [`HttpClient`] applying the configured request policies. Clones share all policy state.
#[derive(Clone)]
pub struct PolicyClient {
    inner: Arc<PolicyInner>,
}

impl std::fmt::Debug for PolicyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyClient")
            .field("cache", &self.inner.cache)
            .field("retry", &self.inner.retry)
            .field("throttler", &self.inner.throttler)
            .field("batcher", &self.inner.batcher)
            .field("debouncer", &self.inner.debouncer)
            .field("cancellation", &self.inner.cancellation)
            .finish()
    }
}

impl PolicyClient {
    pub fn builder<C: HttpClient + 'static>(client: C) -> PolicyClientBuilder {
        PolicyClientBuilder::new(Arc::new(client))
    }

    /// Client with the policies `config` enables.
    pub fn from_config<C: HttpClient + 'static>(client: C, config: PolicyConfig) -> Self {
        Self::builder(client).with_config(config).build()
    }

    pub fn cache(&self) -> Option<&RequestCache> {
        self.inner.cache.as_ref()
    }

    pub fn retry(&self) -> Option<&RequestRetry> {
        self.inner.retry.as_ref()
    }

    pub fn throttler(&self) -> Option<&RequestThrottler> {
        self.inner.throttler.as_ref()
    }

    pub fn batcher(&self) -> Option<&RequestBatcher> {
        self.inner.batcher.as_ref()
    }

    pub fn debouncer(&self) -> Option<&DebounceManager> {
        self.inner.debouncer.as_ref()
    }

    /// Reject everything this client still holds back: debounced calls, queued throttled
    /// calls and pending batches. In-flight requests are left alone.
    pub fn cancel_pending(&self) -> usize {
        let debounced = self.inner.debouncer.as_ref().map_or(0, DebounceManager::cancel_all);
        let queued = self.inner.throttler.as_ref().map_or(0, RequestThrottler::clear_queue);
        let batched = self.inner.batcher.as_ref().map_or(0, RequestBatcher::cancel_all);
        debounced + queued + batched
    }

    async fn run(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        let mut options = options;
        let tracked = (self.inner.cancellation && options.signal.is_none()).then(CancellationToken::tracked);
        if let Some(token) = &tracked {
            options = options.with_signal(token.signal());
        }

        if let Some(hit) = self.inner.cache.as_ref().and_then(|c| c.get(&options)) {
            return Ok(hit);
        }

        let response = match &self.inner.retry {
            Some(retry) => {
                retry
                    .execute(options.method, |_attempt| self.throttled(options.clone()))
                    .await?
            }
            None => self.throttled(options.clone()).await?,
        };

        if let Some(cache) = &self.inner.cache {
            cache.set(&options, &response);
        }
        Ok(response)
    }

    async fn throttled(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        match &self.inner.throttler {
            Some(throttler) => {
                let signal = options.signal.clone();
                throttler.throttle_with_signal(signal, || self.dispatch(options)).await
            }
            None => self.dispatch(options).await,
        }
    }

    async fn dispatch(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        match &self.inner.batcher {
            Some(batcher) => batcher.add(options, self.inner.batch_executor.clone()).await,
            None => self.inner.client.request(options).await,
        }
    }
}

#[async_trait]
impl HttpClient for PolicyClient {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        let started = Instant::now();
        let result = match &self.inner.debouncer {
            Some(debouncer) if debouncer.config().enabled => {
                let key = debounce_key(&options);
                let this = self.clone();
                debouncer
                    .debounce(key, move |signal| async move {
                        let options = match options.signal {
                            Some(_) => options,
                            None => options.with_signal(signal),
                        };
                        this.run(options).await
                    })
                    .await
            }
            _ => self.run(options).await,
        };

        let duration = started.elapsed();
        let outcome = match &result {
            Ok(response) => RequestOutcome::Success { status: response.status, duration },
            Err(err) => {
                tracing::debug!(error = %err, "request failed");
                RequestOutcome::Failure { status: err.status(), duration }
            }
        };
        emit(&self.inner.sink, PolicyEvent::Request(outcome));
        result
    }
}

impl Service<RequestOptions> for PolicyClient {
    type Response = HttpResponse;
    type Error = RequestError;
    type Future = BoxFuture<'static, Result<HttpResponse, RequestError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestOptions) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.request(req).await })
    }
}

/// Debounce key: the cache key, plus the serialized body for requests that carry one.
fn debounce_key(options: &RequestOptions) -> String {
    let key = default_cache_key(options);
    match &options.data {
        Some(data) => format!("{key}#{data}"),
        None => key,
    }
}

/// Runs every request of a batch through the inner client, concurrently. Each caller gets
/// its own result, so one member's failure or cancellation never reaches the others.
struct FanOutExecutor {
    client: Arc<dyn HttpClient>,
}

#[async_trait]
impl BatchExecutor for FanOutExecutor {
    async fn execute(&self, requests: Vec<RequestOptions>) -> Result<Vec<HttpResponse>, RequestError> {
        self.execute_each(requests).await.into_iter().collect()
    }

    async fn execute_each(&self, requests: Vec<RequestOptions>) -> Vec<Result<HttpResponse, RequestError>> {
        let calls = requests.into_iter().map(|request| self.client.request(request));
        futures::future::join_all(calls).await
    }
}

/// Builder for [`PolicyClient`]. Mirrors the generator flags `--with-cache` … `--with-debounce`.
pub struct PolicyClientBuilder {
    client: Arc<dyn HttpClient>,
    config: PolicyConfig,
    cache: Option<RequestCache>,
    retry: Option<RequestRetry>,
    batch_executor: Option<Arc<dyn BatchExecutor>>,
    sink: Arc<dyn TelemetrySink>,
}

impl PolicyClientBuilder {
    fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            config: PolicyConfig::default(),
            cache: None,
            retry: None,
            batch_executor: None,
            sink: Arc::new(NullSink),
        }
    }

    /// Take every section of `config`.
    pub fn with_config(mut self, config: PolicyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Use a ready-made cache (custom clock, shared with another client).
    pub fn with_cache_policy(mut self, cache: RequestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Use a ready-made retry policy (custom sleeper or jitter).
    pub fn with_retry_policy(mut self, retry: RequestRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_throttling(mut self, config: ThrottleConfig) -> Self {
        self.config.throttle = config;
        self
    }

    pub fn with_batching(mut self, config: BatchConfig) -> Self {
        self.config.batch = config;
        self
    }

    /// Executor for flushed batches. Defaults to sending each request through the inner
    /// client concurrently.
    pub fn with_batch_executor(mut self, executor: Arc<dyn BatchExecutor>) -> Self {
        self.batch_executor = Some(executor);
        self
    }

    pub fn with_debounce(mut self, config: DebounceConfig) -> Self {
        self.config.debounce = config;
        self
    }

    /// Give every request without a caller signal a tracked token, so
    /// [`cancel_all_requests`](crate::cancellation::cancel_all_requests) aborts it.
    pub fn with_cancellation(mut self, enabled: bool) -> Self {
        self.config.cancellation = enabled;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> PolicyClient {
        let PolicyConfig { cache, retry, throttle, batch, debounce, cancellation } = self.config;
        let sink = self.sink;

        let cache = self
            .cache
            .or_else(|| cache.enabled.then(|| RequestCache::new(cache).with_sink(sink.clone())));
        let retry = self
            .retry
            .or_else(|| retry.enabled.then(|| RequestRetry::new(retry).with_sink(sink.clone())));
        let throttler = throttle
            .enabled
            .then(|| RequestThrottler::new(throttle).with_sink(sink.clone()));
        let batcher = batch.enabled.then(|| RequestBatcher::new(batch).with_sink(sink.clone()));
        let debouncer = debounce
            .enabled
            .then(|| DebounceManager::new(debounce).with_sink(sink.clone()));
        let batch_executor = self
            .batch_executor
            .unwrap_or_else(|| Arc::new(FanOutExecutor { client: self.client.clone() }));

        tracing::debug!(
            cache = cache.is_some(),
            retry = retry.is_some(),
            throttle = throttler.is_some(),
            batch = batcher.is_some(),
            debounce = debouncer.is_some(),
            cancellation,
            "policy client built"
        );

        PolicyClient {
            inner: Arc::new(PolicyInner {
                client: self.client,
                cache,
                retry,
                throttler,
                batcher,
                batch_executor,
                debouncer,
                cancellation,
                sink,
            }),
        }
    }
}
