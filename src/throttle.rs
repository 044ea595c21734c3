//! Sliding-window request throttling.
//!
//! [`RequestThrottler`] admits at most `limit` requests per trailing `interval`. Requests over
//! the limit either fail fast ([`ThrottleStrategy::Error`]) or wait in a FIFO queue
//! ([`ThrottleStrategy::Queue`], the default) bounded by `max_queue_size`.
//!
//! Queue processing is timer driven. Each timer fire re-prunes the window, reads the live
//! `limit` (so `configure()` may change it mid-flight) and releases at most one waiter. When a
//! released request completes, processing runs again for the rest of the queue.
//!
//! ```rust
//! use reqpolicy::throttle::{RequestThrottler, ThrottleConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let throttler = RequestThrottler::new(
//!     ThrottleConfig::enabled().with_limit(2).with_interval(Duration::from_secs(1)),
//! );
//! let out = throttler.throttle(|| async { Ok::<_, reqpolicy::RequestError>(42) }).await;
//! assert_eq!(out.unwrap(), 42);
//! assert_eq!(throttler.in_window(), 1);
//! # }
//! ```

use crate::cancellation::CancelSignal;
use crate::config::{serde_millis, DynamicConfig};
use crate::error::RequestError;
use crate::request::{HttpResponse, RequestOptions};
use crate::telemetry::{emit, NullSink, PolicyEvent, TelemetrySink, ThrottleEvent};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

/// Shortest delay between two queue checks.
pub const MIN_RECHECK_DELAY: Duration = Duration::from_millis(10);

pub const QUEUE_CLEARED_REASON: &str = "Throttle queue cleared";

/// What to do with a request over the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleStrategy {
    /// Wait for a free slot.
    #[default]
    Queue,
    /// Reject immediately with [`RequestError::RateLimited`].
    Error,
}

/// Throttle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub limit: usize,
    #[serde(with = "serde_millis")]
    pub interval: Duration,
    pub strategy: ThrottleStrategy,
    pub max_queue_size: usize,
}

impl ThrottleConfig {
    /// Enabled with 60 requests per minute, queued.
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_strategy(mut self, strategy: ThrottleStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 60,
            interval: Duration::from_millis(60_000),
            strategy: ThrottleStrategy::Queue,
            max_queue_size: 100,
        }
    }
}

struct Waiter {
    permit: oneshot::Sender<Result<(), RequestError>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct ThrottleState {
    timestamps: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    timer: Option<JoinHandle<()>>,
    timer_gen: u64,
}

impl ThrottleState {
    fn prune(&mut self, now: Instant, interval: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= interval {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Inner {
    config: DynamicConfig<ThrottleConfig>,
    state: Mutex<ThrottleState>,
    sink: Arc<dyn TelemetrySink>,
}

enum Admission {
    Run,
    Wait(oneshot::Receiver<Result<(), RequestError>>),
}

/// Rate limiter over a trailing time window. Clones share the window and the queue.
#[derive(Clone)]
pub struct RequestThrottler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestThrottler")
            .field("config", &self.inner.config.get())
            .field("in_window", &state.timestamps.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl RequestThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: DynamicConfig::new(config),
                state: Mutex::new(ThrottleState::default()),
                sink: Arc::new(NullSink),
            }),
        }
    }

    /// Report decisions to `sink`. Call before the throttler is shared.
    pub fn with_sink(self, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: self.inner.config.clone(),
                state: Mutex::new(ThrottleState::default()),
                sink,
            }),
        }
    }

    /// Update settings; queued requests are re-evaluated against the new limit.
    pub fn configure(&self, f: impl FnOnce(&mut ThrottleConfig)) {
        self.inner.config.modify(f);
        self.process_queue();
    }

    pub fn config(&self) -> Arc<ThrottleConfig> {
        self.inner.config.get()
    }

    /// Run `f` once the window has room for it.
    pub async fn throttle<F, Fut, T>(&self, f: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.throttle_with_signal(None, f).await
    }

    /// Like [`throttle`](Self::throttle), but a queued call leaves the queue as soon as
    /// `signal` fires, without taking a window slot.
    pub async fn throttle_with_signal<F, Fut, T>(&self, signal: Option<CancelSignal>, f: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let cfg = self.inner.config.get();
        if !cfg.enabled {
            return f().await;
        }
        if let Some(reason) = signal.as_ref().and_then(CancelSignal::reason) {
            return Err(RequestError::cancelled(reason));
        }

        match self.admit(&cfg)? {
            Admission::Run => f().await,
            Admission::Wait(permit) => {
                let granted = match signal {
                    Some(signal) => tokio::select! {
                        granted = permit => granted,
                        reason = signal.cancelled() => {
                            self.forget_cancelled();
                            tracing::debug!(reason = %reason, "queued request cancelled");
                            return Err(RequestError::cancelled(reason));
                        }
                    },
                    None => permit.await,
                };
                match granted {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(RequestError::cancelled(QUEUE_CLEARED_REASON)),
                }
                let _reprocess = Reprocess(self.clone());
                f().await
            }
        }
    }

    fn admit(&self, cfg: &ThrottleConfig) -> Result<Admission, RequestError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.prune(now, cfg.interval);
        state.queue.retain(|waiter| !waiter.permit.is_closed());

        if state.queue.is_empty() && state.timestamps.len() < cfg.limit {
            state.timestamps.push_back(now);
            return Ok(Admission::Run);
        }

        if cfg.strategy == ThrottleStrategy::Error {
            drop(state);
            tracing::warn!(limit = cfg.limit, interval_ms = cfg.interval.as_millis() as u64, "rate limit exceeded");
            emit(&self.inner.sink, PolicyEvent::Throttle(ThrottleEvent::Rejected { queue_full: false }));
            return Err(RequestError::RateLimited { limit: cfg.limit, interval: cfg.interval });
        }

        if state.queue.len() >= cfg.max_queue_size {
            drop(state);
            tracing::warn!(max_queue_size = cfg.max_queue_size, "throttle queue full");
            emit(&self.inner.sink, PolicyEvent::Throttle(ThrottleEvent::Rejected { queue_full: true }));
            return Err(RequestError::QueueFull { max_queue_size: cfg.max_queue_size });
        }

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter { permit: tx, enqueued_at: now });
        let queue_len = state.queue.len();
        self.arm_timer(&mut state, cfg, now);
        drop(state);

        tracing::debug!(queue_len, "request queued by throttler");
        emit(&self.inner.sink, PolicyEvent::Throttle(ThrottleEvent::Queued { queue_len }));
        Ok(Admission::Wait(rx))
    }

    /// Drop waiters whose caller has gone away.
    fn forget_cancelled(&self) {
        let mut state = self.inner.state.lock();
        state.queue.retain(|waiter| !waiter.permit.is_closed());
    }

    /// Arm the recheck timer unless one is already pending.
    fn arm_timer(&self, state: &mut ThrottleState, cfg: &ThrottleConfig, now: Instant) {
        if state.timer.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime; throttle queue will not be processed");
            return;
        };
        let delay = if state.timestamps.len() < cfg.limit {
            MIN_RECHECK_DELAY
        } else {
            state
                .timestamps
                .front()
                .map(|oldest| (*oldest + cfg.interval).saturating_duration_since(now))
                .unwrap_or_default()
                .max(MIN_RECHECK_DELAY)
        };

        state.timer_gen = state.timer_gen.wrapping_add(1);
        let gen = state.timer_gen;
        let this = self.clone();
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = this.inner.state.lock();
                if state.timer_gen == gen {
                    state.timer = None;
                }
            }
            this.process_queue();
        }));
    }

    /// Release the next waiter if the window has room, then keep the timer armed while
    /// requests are still waiting.
    fn process_queue(&self) {
        let cfg = self.inner.config.get();
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if state.queue.is_empty() {
            return;
        }

        if !cfg.enabled {
            let released: Vec<Waiter> = state.queue.drain(..).collect();
            drop(state);
            tracing::debug!(released = released.len(), "throttling disabled; releasing queue");
            for waiter in released {
                let _ = waiter.permit.send(Ok(()));
            }
            return;
        }

        state.prune(now, cfg.interval);
        let mut dequeued = None;
        if state.timestamps.len() < cfg.limit {
            while let Some(waiter) = state.queue.pop_front() {
                if waiter.permit.is_closed() {
                    continue;
                }
                state.timestamps.push_back(now);
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                if waiter.permit.send(Ok(())).is_ok() {
                    dequeued = Some(waited);
                    break;
                }
                state.timestamps.pop_back();
            }
        }
        if !state.queue.is_empty() {
            self.arm_timer(&mut state, &cfg, now);
        }
        drop(state);

        if let Some(waited) = dequeued {
            tracing::debug!(waited_ms = waited.as_millis() as u64, "throttled request dequeued");
            emit(&self.inner.sink, PolicyEvent::Throttle(ThrottleEvent::Dequeued { waited }));
        }
    }

    /// Reject every queued request with a cancellation error. Returns how many were rejected.
    pub fn clear_queue(&self) -> usize {
        let (waiters, timer) = {
            let mut state = self.inner.state.lock();
            state.timer_gen = state.timer_gen.wrapping_add(1);
            (state.queue.drain(..).collect::<Vec<_>>(), state.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        let cleared = waiters.len();
        for waiter in waiters {
            let _ = waiter.permit.send(Err(RequestError::cancelled(QUEUE_CLEARED_REASON)));
        }
        tracing::info!(cleared, "throttle queue cleared");
        cleared
    }

    /// Requests waiting for a slot.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Requests admitted within the trailing interval.
    pub fn in_window(&self) -> usize {
        let interval = self.inner.config.get().interval;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.prune(now, interval);
        state.timestamps.len()
    }
}

impl Default for RequestThrottler {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

/// Re-runs queue processing when a released request finishes, success or failure.
struct Reprocess(RequestThrottler);

impl Drop for Reprocess {
    fn drop(&mut self) {
        self.0.process_queue();
    }
}

/// Tower layer that throttles every call through a shared [`RequestThrottler`].
#[derive(Clone, Debug)]
pub struct ThrottleLayer {
    throttler: RequestThrottler,
}

impl ThrottleLayer {
    pub fn new(throttler: RequestThrottler) -> Self {
        Self { throttler }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService { inner: service, throttler: self.throttler.clone() }
    }
}

/// Service produced by [`ThrottleLayer`].
#[derive(Clone, Debug)]
pub struct ThrottleService<S> {
    inner: S,
    throttler: RequestThrottler,
}

impl<S> Service<RequestOptions> for ThrottleService<S>
where
    S: Service<RequestOptions, Response = HttpResponse, Error = RequestError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = HttpResponse;
    type Error = RequestError;
    type Future = BoxFuture<'static, Result<HttpResponse, RequestError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestOptions) -> Self::Future {
        let throttler = self.throttler.clone();
        let mut inner = self.inner.clone();
        let signal = req.signal.clone();
        Box::pin(async move { throttler.throttle_with_signal(signal, move || inner.call(req)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<Result<usize, RequestError>> {
        let counter = counter.clone();
        move || futures::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn disabled_passes_through() {
        let throttler = RequestThrottler::new(ThrottleConfig::default().with_limit(0));
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            throttler.throttle(counting(&calls)).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(throttler.in_window(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_strategy_rejects_without_running() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled()
                .with_limit(2)
                .with_interval(Duration::from_secs(1))
                .with_strategy(ThrottleStrategy::Error),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        throttler.throttle(counting(&calls)).await.unwrap();
        throttler.throttle(counting(&calls)).await.unwrap();

        let err = throttler.throttle(counting(&calls)).await.unwrap_err();
        assert!(matches!(err, RequestError::RateLimited { limit: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        throttler.throttle(counting(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_defers_until_window_advances() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled().with_limit(2).with_interval(Duration::from_millis(1000)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        throttler.throttle(counting(&calls)).await.unwrap();
        throttler.throttle(counting(&calls)).await.unwrap();

        let t = throttler.clone();
        let c = calls.clone();
        let queued = tokio::spawn(async move { t.throttle(counting(&c)).await });
        tokio::task::yield_now().await;
        assert_eq!(throttler.queue_len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(queued.await.unwrap().unwrap(), 2);
        assert_eq!(throttler.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_run_in_fifo_order() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled().with_limit(1).with_interval(Duration::from_millis(100)),
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        throttler.throttle(|| async { Ok::<_, RequestError>(()) }).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let t = throttler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                t.throttle(|| async move {
                    order.lock().push(i);
                    Ok::<_, RequestError>(())
                })
                .await
            }));
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled()
                .with_limit(1)
                .with_interval(Duration::from_secs(10))
                .with_max_queue_size(1),
        );
        throttler.throttle(|| async { Ok::<_, RequestError>(()) }).await.unwrap();

        let t = throttler.clone();
        let _waiting = tokio::spawn(async move { t.throttle(|| async { Ok::<_, RequestError>(()) }).await });
        tokio::task::yield_now().await;

        let err = throttler.throttle(|| async { Ok::<_, RequestError>(()) }).await.unwrap_err();
        assert!(matches!(err, RequestError::QueueFull { max_queue_size: 1 }));
        assert!(err.is_rate_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_cancels_waiters() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled().with_limit(1).with_interval(Duration::from_secs(10)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        throttler.throttle(counting(&calls)).await.unwrap();

        let t = throttler.clone();
        let c = calls.clone();
        let waiting = tokio::spawn(async move { t.throttle(counting(&c)).await });
        tokio::task::yield_now().await;

        assert_eq!(throttler.clear_queue(), 1);
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_limit_releases_waiters() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled().with_limit(1).with_interval(Duration::from_secs(60)),
        );
        throttler.throttle(|| async { Ok::<_, RequestError>(()) }).await.unwrap();

        let t = throttler.clone();
        let waiting = tokio::spawn(async move { t.throttle(|| async { Ok::<_, RequestError>(7) }).await });
        tokio::task::yield_now().await;
        assert_eq!(throttler.queue_len(), 1);

        throttler.configure(|c| c.limit = 5);
        assert_eq!(waiting.await.unwrap().unwrap(), 7);
        assert_eq!(throttler.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_the_queue_at_once() {
        use crate::cancellation::CancellationToken;

        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled()
                .with_limit(1)
                .with_interval(Duration::from_secs(60))
                .with_max_queue_size(1),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        throttler.throttle(counting(&calls)).await.unwrap();

        let token = CancellationToken::new();
        let t = throttler.clone();
        let c = calls.clone();
        let signal = token.signal();
        let waiting = tokio::spawn(async move { t.throttle_with_signal(Some(signal), counting(&c)).await });
        tokio::task::yield_now().await;
        assert_eq!(throttler.queue_len(), 1);

        let start = Instant::now();
        token.cancel("user left");
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.cancellation_reason(), Some("user left"));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttler.queue_len(), 0);

        // the freed queue seat is usable again
        let t = throttler.clone();
        let c = calls.clone();
        let next = tokio::spawn(async move { t.throttle(counting(&c)).await });
        tokio::task::yield_now().await;
        assert_eq!(throttler.queue_len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        next.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "the cancelled call never ran");
        assert_eq!(throttler.in_window(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_signal_is_rejected_before_admission() {
        use crate::cancellation::CancellationToken;

        let throttler = RequestThrottler::new(ThrottleConfig::enabled().with_limit(1));
        let token = CancellationToken::new();
        token.cancel("gone");
        let calls = Arc::new(AtomicUsize::new(0));
        let err = throttler.throttle_with_signal(Some(token.signal()), counting(&calls)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(throttler.in_window(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_still_frees_the_queue() {
        let throttler = RequestThrottler::new(
            ThrottleConfig::enabled().with_limit(1).with_interval(Duration::from_millis(50)),
        );
        throttler.throttle(|| async { Ok::<_, RequestError>(()) }).await.unwrap();

        let t1 = throttler.clone();
        let first = tokio::spawn(async move {
            t1.throttle(|| async { Err::<(), _>(RequestError::Configuration("boom".into())) }).await
        });
        tokio::task::yield_now().await;
        let t2 = throttler.clone();
        let second = tokio::spawn(async move { t2.throttle(|| async { Ok::<_, RequestError>("ok") }).await });

        assert!(first.await.unwrap().is_err());
        assert_eq!(second.await.unwrap().unwrap(), "ok");
    }
}
