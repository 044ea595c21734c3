//! Request batching.
//!
//! [`RequestBatcher::add`] groups concurrent requests that share a batch key (by default
//! `METHOD:path`, query string ignored) and hands them to a [`BatchExecutor`] in one call.
//!
//! A batch flushes when:
//! - it reaches `max_batch_size` (immediately, inside `add`),
//! - its age since the first member reaches `max_wait_time` (immediately, inside `add`),
//! - or its coalescing timer fires. The timer restarts on every new member and waits
//!   `min(debounce_time, max_wait_time - age)`.
//!
//! Responses are matched to callers by position. An executor that only implements
//! [`BatchExecutor::execute`] is all-or-nothing: if it returns a different number of responses,
//! or fails, every caller of that flush gets the same error. Executors that can tell members
//! apart override [`BatchExecutor::execute_each`] and hand each caller its own result. When
//! batching is disabled the executor is called with a single request.

use crate::config::{serde_millis, DynamicConfig};
use crate::error::RequestError;
use crate::request::{HttpResponse, RequestOptions};
use crate::telemetry::{emit, BatchEvent, NullSink, PolicyEvent, TelemetrySink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Batch key function.
pub type BatchKeyFn = Arc<dyn Fn(&RequestOptions) -> String + Send + Sync>;

/// Executes a group of requests in one downstream call.
///
/// Must return exactly one response per request, in request order.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, requests: Vec<RequestOptions>) -> Result<Vec<HttpResponse>, RequestError>;

    /// One result per request, in request order.
    ///
    /// The default runs [`execute`](Self::execute) and gives every member the same error when
    /// it fails or returns the wrong number of responses.
    async fn execute_each(&self, requests: Vec<RequestOptions>) -> Vec<Result<HttpResponse, RequestError>> {
        let size = requests.len();
        match self.execute(requests).await {
            Ok(responses) if responses.len() == size => responses.into_iter().map(Ok).collect(),
            Ok(responses) => {
                let actual = responses.len();
                tracing::warn!(expected = size, actual, "batch response count mismatch");
                let err = RequestError::BatchSizeMismatch { expected: size, actual };
                (0..size).map(|_| Err(err.clone())).collect()
            }
            Err(err) => {
                tracing::debug!(size, error = %err, "batch executor failed");
                (0..size).map(|_| Err(err.clone())).collect()
            }
        }
    }
}

#[async_trait]
impl<F, Fut> BatchExecutor for F
where
    F: Fn(Vec<RequestOptions>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<HttpResponse>, RequestError>> + Send + 'static,
{
    async fn execute(&self, requests: Vec<RequestOptions>) -> Result<Vec<HttpResponse>, RequestError> {
        (self)(requests).await
    }
}

/// Batching settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    #[serde(with = "serde_millis")]
    pub max_wait_time: Duration,
    #[serde(with = "serde_millis")]
    pub debounce_time: Duration,
    #[serde(skip)]
    pub key_fn: Option<BatchKeyFn>,
}

impl BatchConfig {
    /// Enabled with batches of up to 10, 50ms max wait and 10ms coalescing.
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait;
        self
    }

    pub fn with_debounce_time(mut self, debounce: Duration) -> Self {
        self.debounce_time = debounce;
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestOptions) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 10,
            max_wait_time: Duration::from_millis(50),
            debounce_time: Duration::from_millis(10),
            key_fn: None,
        }
    }
}

impl std::fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConfig")
            .field("enabled", &self.enabled)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_wait_time", &self.max_wait_time)
            .field("debounce_time", &self.debounce_time)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Default batch key: `METHOD:path` without the query string.
pub fn default_batch_key(request: &RequestOptions) -> String {
    format!("{}:{}", request.method, request.path())
}

type Reply = oneshot::Sender<Result<HttpResponse, RequestError>>;

struct Member {
    request: RequestOptions,
    reply: Reply,
}

struct Batch {
    id: u64,
    members: Vec<Member>,
    executor: Arc<dyn BatchExecutor>,
    created_at: Instant,
    timer: Option<JoinHandle<()>>,
    /// Bumped each time the timer is re-armed; older timers leave the batch alone.
    timer_gen: u64,
}

#[derive(Default)]
struct BatchState {
    batches: HashMap<String, Batch>,
    next_id: u64,
}

struct Inner {
    config: DynamicConfig<BatchConfig>,
    state: Mutex<BatchState>,
    sink: Arc<dyn TelemetrySink>,
}

/// Groups concurrent requests by key. Clones share pending batches.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBatcher")
            .field("config", &self.inner.config.get())
            .field("pending_batches", &self.pending_batches())
            .finish()
    }
}

impl RequestBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: DynamicConfig::new(config),
                state: Mutex::new(BatchState::default()),
                sink: Arc::new(NullSink),
            }),
        }
    }

    /// Report flushes to `sink`. Call before the batcher is shared.
    pub fn with_sink(self, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: self.inner.config.clone(),
                state: Mutex::new(BatchState::default()),
                sink,
            }),
        }
    }

    /// Update settings. Turning batching off rejects every pending batch.
    pub fn configure(&self, f: impl FnOnce(&mut BatchConfig)) {
        let (previous, next) = self.inner.config.modify(f);
        if previous.enabled && !next.enabled {
            self.cancel_all();
        }
    }

    pub fn config(&self) -> Arc<BatchConfig> {
        self.inner.config.get()
    }

    /// Key under which `request` is grouped.
    pub fn key_for(&self, request: &RequestOptions) -> String {
        match &self.inner.config.get().key_fn {
            Some(f) => f(request),
            None => default_batch_key(request),
        }
    }

    /// Queue `request` into its batch and wait for its response.
    ///
    /// The executor of the first member is the one used for the whole batch.
    pub async fn add(
        &self,
        request: RequestOptions,
        executor: Arc<dyn BatchExecutor>,
    ) -> Result<HttpResponse, RequestError> {
        let cfg = self.inner.config.get();
        if !cfg.enabled {
            let mut results = executor.execute_each(vec![request]).await;
            if results.len() != 1 {
                return Err(RequestError::BatchSizeMismatch { expected: 1, actual: results.len() });
            }
            return results
                .pop()
                .unwrap_or(Err(RequestError::BatchSizeMismatch { expected: 1, actual: 0 }));
        }

        let key = self.key_for(&request);
        let (reply, response) = oneshot::channel();
        let now = Instant::now();

        let ready = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let next_id = &mut state.next_id;
            let batch = state.batches.entry(key.clone()).or_insert_with(|| {
                let id = *next_id;
                *next_id = next_id.wrapping_add(1);
                Batch { id, members: Vec::new(), executor, created_at: now, timer: None, timer_gen: 0 }
            });
            batch.members.push(Member { request, reply });
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }

            let elapsed = now.saturating_duration_since(batch.created_at);
            if batch.members.len() >= cfg.max_batch_size.max(1) || elapsed >= cfg.max_wait_time {
                state.batches.remove(&key)
            } else {
                let delay = cfg.debounce_time.min(cfg.max_wait_time - elapsed);
                batch.timer_gen = batch.timer_gen.wrapping_add(1);
                batch.timer = Some(self.spawn_timer(key.clone(), batch.id, batch.timer_gen, delay));
                tracing::debug!(key = %key, size = batch.members.len(), delay_ms = delay.as_millis() as u64, "request added to batch");
                None
            }
        };

        if let Some(batch) = ready {
            let this = self.clone();
            tokio::spawn(async move { this.flush(key, batch).await });
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::BatchingDisabled),
        }
    }

    fn spawn_timer(&self, key: String, id: u64, gen: u64, delay: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let batch = {
                let mut state = this.inner.state.lock();
                match state.batches.get(&key) {
                    Some(batch) if batch.id == id && batch.timer_gen == gen => state.batches.remove(&key),
                    _ => None,
                }
            };
            if let Some(mut batch) = batch {
                // this task's own handle; drop it rather than abort it
                drop(batch.timer.take());
                this.flush(key, batch).await;
            }
        })
    }

    async fn flush(&self, key: String, batch: Batch) {
        let size = batch.members.len();
        let (requests, replies): (Vec<_>, Vec<_>) =
            batch.members.into_iter().map(|m| (m.request, m.reply)).unzip();
        tracing::debug!(key = %key, size, "flushing batch");

        let results = batch.executor.execute_each(requests).await;
        if results.len() != size {
            let actual = results.len();
            tracing::warn!(key = %key, expected = size, actual, "batch result count mismatch");
            let err = RequestError::BatchSizeMismatch { expected: size, actual };
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
            emit(&self.inner.sink, PolicyEvent::Batch(BatchEvent::Failed { key, size }));
            return;
        }

        let failed = results.iter().all(Result::is_err);
        for (reply, result) in replies.into_iter().zip(results) {
            let _ = reply.send(result);
        }
        let event = if failed { BatchEvent::Failed { key, size } } else { BatchEvent::Flushed { key, size } };
        emit(&self.inner.sink, PolicyEvent::Batch(event));
    }

    /// Reject every pending batch with [`RequestError::BatchingDisabled`].
    pub fn cancel_all(&self) -> usize {
        let batches: Vec<Batch> = {
            let mut state = self.inner.state.lock();
            state.batches.drain().map(|(_, batch)| batch).collect()
        };
        let mut rejected = 0;
        for mut batch in batches {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            for member in batch.members {
                rejected += 1;
                let _ = member.reply.send(Err(RequestError::BatchingDisabled));
            }
        }
        tracing::info!(rejected, "pending batches cancelled");
        rejected
    }

    /// Batches still collecting members.
    pub fn pending_batches(&self) -> usize {
        self.inner.state.lock().batches.len()
    }

    /// Requests waiting in any pending batch.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().batches.values().map(|b| b.members.len()).sum()
    }
}

impl Default for RequestBatcher {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}
