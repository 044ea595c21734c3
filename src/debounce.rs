//! Debouncing of rapid, repeated requests.
//!
//! [`DebounceManager::debounce`] delays a request until calls for the same key stop arriving
//! for `delay`. Only the last call of a run executes; every earlier caller is rejected with
//! [`RequestError::Cancelled`].
//!
//! Per key:
//! - at most one pending entry exists; a new call removes the previous entry and its timers
//!   before installing its own;
//! - with `cancel_pending`, the previous entry's token is cancelled, and so is the token of a
//!   request of that key that already fired and is still in flight;
//! - `max_wait` is measured from the first call of the current run, so continuous calls
//!   cannot defer execution forever.
//!
//! The fired request receives the entry's [`CancelSignal`]; it is raced against that signal so
//! a cancelled request always rejects even if the request function ignores the signal.
//!
//! A process-wide [`default_manager`] backs [`debounce_request`] and
//! [`cancel_all_debounced_requests`]. It is created lazily and owns nothing but its timers.

use crate::cancellation::{CancelSignal, CancellationToken};
use crate::config::{serde_millis, serde_millis_opt, DynamicConfig};
use crate::error::RequestError;
use crate::telemetry::{emit, DebounceEvent, NullSink, PolicyEvent, TelemetrySink};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SUPERSEDED_REASON: &str = "Debounced request superseded by a newer call";
pub const REPLACED_REASON: &str = "Debounced request replaced by a newer call";
pub const CANCELLED_REASON: &str = "Debounced request cancelled";
pub const CANCELLED_ALL_REASON: &str = "All debounced requests cancelled";

/// Debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebounceConfig {
    pub enabled: bool,
    #[serde(with = "serde_millis")]
    pub delay: Duration,
    #[serde(with = "serde_millis_opt", skip_serializing_if = "Option::is_none")]
    pub max_wait: Option<Duration>,
    pub cancel_pending: bool,
}

impl DebounceConfig {
    /// Enabled with a 300ms delay, cancelling superseded calls.
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_cancel_pending(mut self, cancel_pending: bool) -> Self {
        self.cancel_pending = cancel_pending;
        self
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_millis(300),
            max_wait: None,
            cancel_pending: true,
        }
    }
}

type Job = Box<dyn FnOnce(CancelSignal) -> BoxFuture<'static, ()> + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Delay,
    MaxWait,
}

struct Entry {
    id: u64,
    token: CancellationToken,
    started_at: Instant,
    timer: Option<JoinHandle<()>>,
    max_wait_timer: Option<JoinHandle<()>>,
    job: Job,
}

impl Entry {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.max_wait_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<String, Entry>,
    in_flight: HashMap<String, Vec<(u64, CancellationToken)>>,
    next_id: u64,
}

impl DebounceState {
    fn finish_in_flight(&mut self, key: &str, id: u64) {
        if let Some(running) = self.in_flight.get_mut(key) {
            running.retain(|(running_id, _)| *running_id != id);
            if running.is_empty() {
                self.in_flight.remove(key);
            }
        }
    }
}

struct Inner {
    config: DynamicConfig<DebounceConfig>,
    state: Mutex<DebounceState>,
    sink: Arc<dyn TelemetrySink>,
}

/// Keyed debouncer. Clones share pending entries.
#[derive(Clone)]
pub struct DebounceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DebounceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceManager")
            .field("config", &self.inner.config.get())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl DebounceManager {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: DynamicConfig::new(config),
                state: Mutex::new(DebounceState::default()),
                sink: Arc::new(NullSink),
            }),
        }
    }

    /// Report scheduling decisions to `sink`. Call before the manager is shared.
    pub fn with_sink(self, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: self.inner.config.clone(),
                state: Mutex::new(DebounceState::default()),
                sink,
            }),
        }
    }

    /// Update settings. Pending timers keep the delay they were armed with.
    pub fn configure(&self, f: impl FnOnce(&mut DebounceConfig)) {
        self.inner.config.modify(f);
    }

    pub fn config(&self) -> Arc<DebounceConfig> {
        self.inner.config.get()
    }

    /// Run `f` once calls for `key` settle.
    pub async fn debounce<F, Fut, T>(&self, key: impl Into<String>, f: F) -> Result<T, RequestError>
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
        T: Send + 'static,
    {
        let cfg = self.inner.config.get();
        self.debounce_with(key.into(), &cfg, f).await
    }

    async fn debounce_with<F, Fut, T>(
        &self,
        key: String,
        cfg: &DebounceConfig,
        f: F,
    ) -> Result<T, RequestError>
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
        T: Send + 'static,
    {
        if !cfg.enabled {
            return f(CancelSignal::never()).await;
        }

        let (reply, outcome) = oneshot::channel();
        let token = CancellationToken::new();
        let job: Job = Box::new(move |signal: CancelSignal| {
            Box::pin(async move {
                let _ = reply.send(run_observing(signal, f).await);
            })
        });
        self.schedule(key, cfg, token.clone(), job);

        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::cancelled(
                token.cancellation_reason().unwrap_or_else(|| REPLACED_REASON.to_string()),
            )),
        }
    }

    fn schedule(&self, key: String, cfg: &DebounceConfig, token: CancellationToken, job: Job) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);

        let mut started_at = now;
        let previous = state.pending.remove(&key);
        if let Some(prev) = &previous {
            started_at = prev.started_at;
        }
        let in_flight = if cfg.cancel_pending { state.in_flight.remove(&key) } else { None };

        let timer = self.spawn_timer(key.clone(), id, cfg.delay, TimerKind::Delay);
        let max_wait_timer = cfg.max_wait.and_then(|max_wait| {
            let remaining = max_wait.saturating_sub(now.saturating_duration_since(started_at));
            (remaining < cfg.delay)
                .then(|| self.spawn_timer(key.clone(), id, remaining, TimerKind::MaxWait))
        });
        state.pending.insert(
            key.clone(),
            Entry {
                id,
                token,
                started_at,
                timer: Some(timer),
                max_wait_timer,
                job,
            },
        );
        drop(state);

        if let Some(mut prev) = previous {
            prev.abort_timers();
            if cfg.cancel_pending {
                prev.token.cancel(SUPERSEDED_REASON);
            }
            tracing::debug!(key = %key, "debounced request superseded");
            emit(&self.inner.sink, PolicyEvent::Debounce(DebounceEvent::Superseded { key: key.clone() }));
        }
        for (_, running) in in_flight.into_iter().flatten() {
            running.cancel(SUPERSEDED_REASON);
        }
        tracing::debug!(key = %key, delay_ms = cfg.delay.as_millis() as u64, "debounced request scheduled");
        emit(&self.inner.sink, PolicyEvent::Debounce(DebounceEvent::Scheduled { key }));
    }

    fn spawn_timer(&self, key: String, id: u64, delay: Duration, kind: TimerKind) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(key, id, kind).await;
        })
    }

    async fn fire(&self, key: String, id: u64, kind: TimerKind) {
        let entry = {
            let mut state = self.inner.state.lock();
            match state.pending.get(&key) {
                Some(entry) if entry.id == id => {}
                _ => return,
            }
            let Some(entry) = state.pending.remove(&key) else { return };
            state.in_flight.entry(key.clone()).or_default().push((id, entry.token.clone()));
            entry
        };

        let Entry { token, timer, max_wait_timer, job, .. } = entry;
        // the handle of the running timer is dropped, never aborted
        let (own, other) = match kind {
            TimerKind::Delay => (timer, max_wait_timer),
            TimerKind::MaxWait => (max_wait_timer, timer),
        };
        drop(own);
        if let Some(other) = other {
            other.abort();
        }

        tracing::debug!(key = %key, forced = (kind == TimerKind::MaxWait), "debounced request fired");
        emit(&self.inner.sink, PolicyEvent::Debounce(DebounceEvent::Fired { key: key.clone() }));
        job(token.signal()).await;
        self.inner.state.lock().finish_in_flight(&key, id);
    }

    /// Cancel the pending entry for `key`. Returns `false` when nothing was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let Some(mut entry) = self.inner.state.lock().pending.remove(key) else {
            return false;
        };
        entry.abort_timers();
        entry.token.cancel(CANCELLED_REASON);
        tracing::debug!(key, "debounced request cancelled");
        true
    }

    /// Cancel every pending entry and every request still in flight. No request function runs.
    ///
    /// Returns how many pending entries were cancelled.
    pub fn cancel_all(&self) -> usize {
        let (pending, in_flight) = {
            let mut state = self.inner.state.lock();
            let pending: Vec<Entry> = state.pending.drain().map(|(_, e)| e).collect();
            let in_flight: Vec<CancellationToken> =
                state.in_flight.drain().flat_map(|(_, running)| running).map(|(_, t)| t).collect();
            (pending, in_flight)
        };
        let cancelled = pending.len();
        for mut entry in pending {
            entry.abort_timers();
            entry.token.cancel(CANCELLED_ALL_REASON);
        }
        for token in in_flight {
            token.cancel(CANCELLED_ALL_REASON);
        }
        tracing::info!(cancelled, "all debounced requests cancelled");
        cancelled
    }

    /// Run `f` for `key` right away, replacing its pending entry.
    ///
    /// `f` receives the entry's signal. The caller whose entry was replaced is rejected with
    /// [`RequestError::Cancelled`]. Returns `None` when nothing was pending for `key`.
    pub async fn flush<F, Fut, T>(&self, key: &str, f: F) -> Option<Result<T, RequestError>>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut entry = {
            let mut state = self.inner.state.lock();
            let entry = state.pending.remove(key)?;
            state.in_flight.entry(key.to_string()).or_default().push((entry.id, entry.token.clone()));
            entry
        };
        entry.abort_timers();
        let Entry { id, token, job, .. } = entry;
        drop(job);
        tracing::debug!(key, "debounced request flushed");

        let out = run_observing(token.signal(), f).await;
        self.inner.state.lock().finish_in_flight(key, id);
        Some(out)
    }

    /// Keys waiting for their timer.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }
}

impl Default for DebounceManager {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}

/// Run `f(signal)`, rejecting as soon as the signal fires.
async fn run_observing<F, Fut, T>(signal: CancelSignal, f: F) -> Result<T, RequestError>
where
    F: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let watcher = signal.clone();
    tokio::select! {
        out = f(signal) => out,
        reason = watcher.cancelled() => Err(RequestError::cancelled(reason)),
    }
}

/// Shared manager behind [`debounce_request`] and [`cancel_all_debounced_requests`].
pub fn default_manager() -> &'static DebounceManager {
    static DEFAULT: OnceLock<DebounceManager> = OnceLock::new();
    DEFAULT.get_or_init(|| DebounceManager::new(DebounceConfig::enabled()))
}

/// Cancel every run tracked by the default manager.
pub fn cancel_all_debounced_requests() -> usize {
    default_manager().cancel_all()
}

/// Per-wrapper options for [`debounce_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
    pub max_wait: Option<Duration>,
    pub cancel_pending: bool,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self { max_wait: None, cancel_pending: true }
    }
}

type DebouncedCall<A, T> =
    Arc<dyn Fn(A, CancelSignal) -> BoxFuture<'static, Result<T, RequestError>> + Send + Sync>;

/// Debounced wrapper returned by [`debounce_request`].
///
/// Calls are keyed by `name:JSON(args)`, so only calls with equal arguments coalesce.
pub struct DebouncedFn<A, T> {
    name: String,
    config: DebounceConfig,
    call: DebouncedCall<A, T>,
    manager: DebounceManager,
}

impl<A, T> Clone for DebouncedFn<A, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            call: self.call.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl<A, T> std::fmt::Debug for DebouncedFn<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedFn")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl<A, T> DebouncedFn<A, T>
where
    A: Serialize + Send + 'static,
    T: Send + 'static,
{
    /// Debounce key for `args`.
    pub fn key_for(&self, args: &A) -> Result<String, RequestError> {
        let encoded = serde_json::to_string(args).map_err(|e| {
            RequestError::Configuration(format!("debounce arguments are not serializable: {e}"))
        })?;
        Ok(format!("{}:{}", self.name, encoded))
    }

    pub async fn call(&self, args: A) -> Result<T, RequestError> {
        let key = self.key_for(&args)?;
        let call = self.call.clone();
        self.manager.debounce_with(key, &self.config, move |signal| call(args, signal)).await
    }

    /// Cancel the pending call for `args`, if any.
    pub fn cancel(&self, args: &A) -> Result<bool, RequestError> {
        Ok(self.manager.cancel(&self.key_for(args)?))
    }
}

/// Wrap `f` so calls with equal arguments within `delay` run only once.
///
/// Uses the process-wide [`default_manager`].
pub fn debounce_request<A, T, F, Fut>(
    name: impl Into<String>,
    f: F,
    delay: Duration,
    options: DebounceOptions,
) -> DebouncedFn<A, T>
where
    F: Fn(A, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
{
    let call: DebouncedCall<A, T> = Arc::new(move |args, signal| Box::pin(f(args, signal)));
    DebouncedFn {
        name: name.into(),
        config: DebounceConfig {
            enabled: true,
            delay,
            max_wait: options.max_wait,
            cancel_pending: options.cancel_pending,
        },
        call,
        manager: default_manager().clone(),
    }
}
