//! Telemetry for request policies.
//!
//! Every controller can be given a [`TelemetrySink`]; it reports what it decided as a
//! [`PolicyEvent`]. Sinks are synchronous and must not block: policies call them while
//! deciding what to do with a request.
//!
//! - [`LogSink`] forwards events to `tracing`.
//! - [`MemorySink`] keeps the most recent events in memory (tests, debugging).
//! - [`NullSink`] drops everything and is the default.
//!
//! ```rust
//! use reqpolicy::telemetry::{MemorySink, PolicyEvent, CacheEvent, TelemetrySink};
//!
//! let sink = MemorySink::with_capacity(8);
//! sink.emit(&PolicyEvent::Cache(CacheEvent::Hit { key: "GET:/pets".into() }));
//! assert_eq!(sink.len(), 1);
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Consumer of policy events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &PolicyEvent);
}

/// Best-effort emit through a shared sink.
pub fn emit(sink: &Arc<dyn TelemetrySink>, event: PolicyEvent) {
    sink.emit(&event);
}

/// Events emitted by the request policies.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Cache(CacheEvent),
    Throttle(ThrottleEvent),
    Retry(RetryEvent),
    Batch(BatchEvent),
    Debounce(DebounceEvent),
    /// Final outcome of a request seen by a [`PolicyClient`](crate::stack::PolicyClient).
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
    Stored { key: String },
    Evicted { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// The request waits for a free slot.
    Queued { queue_len: usize },
    /// A queued request got its slot.
    Dequeued { waited: Duration },
    /// The request was refused (rate limit or full queue).
    Rejected { queue_full: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to be made after `delay`.
    Attempt { retry: u32, delay: Duration },
    /// Retrying stopped with a failure after `attempts` calls.
    GaveUp { attempts: u32, status: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Flushed { key: String, size: usize },
    Failed { key: String, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceEvent {
    Scheduled { key: String },
    Superseded { key: String },
    Fired { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { status: u16, duration: Duration },
    Failure { status: Option<u16>, duration: Duration },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Cache(CacheEvent::Hit { key }) => write!(f, "cache hit {key}"),
            PolicyEvent::Cache(CacheEvent::Miss { key }) => write!(f, "cache miss {key}"),
            PolicyEvent::Cache(CacheEvent::Stored { key }) => write!(f, "cache stored {key}"),
            PolicyEvent::Cache(CacheEvent::Evicted { key }) => write!(f, "cache evicted {key}"),
            PolicyEvent::Throttle(ThrottleEvent::Queued { queue_len }) => {
                write!(f, "throttle queued (queue length {queue_len})")
            }
            PolicyEvent::Throttle(ThrottleEvent::Dequeued { waited }) => {
                write!(f, "throttle dequeued after {waited:?}")
            }
            PolicyEvent::Throttle(ThrottleEvent::Rejected { queue_full }) => {
                if *queue_full {
                    write!(f, "throttle rejected: queue full")
                } else {
                    write!(f, "throttle rejected: rate limit")
                }
            }
            PolicyEvent::Retry(RetryEvent::Attempt { retry, delay }) => {
                write!(f, "retry #{retry} in {delay:?}")
            }
            PolicyEvent::Retry(RetryEvent::GaveUp { attempts, status }) => match status {
                Some(s) => write!(f, "retry gave up after {attempts} attempts (status {s})"),
                None => write!(f, "retry gave up after {attempts} attempts"),
            },
            PolicyEvent::Batch(BatchEvent::Flushed { key, size }) => {
                write!(f, "batch {key} flushed {size} requests")
            }
            PolicyEvent::Batch(BatchEvent::Failed { key, size }) => {
                write!(f, "batch {key} failed for {size} requests")
            }
            PolicyEvent::Debounce(DebounceEvent::Scheduled { key }) => {
                write!(f, "debounce scheduled {key}")
            }
            PolicyEvent::Debounce(DebounceEvent::Superseded { key }) => {
                write!(f, "debounce superseded {key}")
            }
            PolicyEvent::Debounce(DebounceEvent::Fired { key }) => write!(f, "debounce fired {key}"),
            PolicyEvent::Request(RequestOutcome::Success { status, duration }) => {
                write!(f, "request succeeded with {status} in {duration:?}")
            }
            PolicyEvent::Request(RequestOutcome::Failure { status, duration }) => match status {
                Some(s) => write!(f, "request failed with {s} in {duration:?}"),
                None => write!(f, "request failed in {duration:?}"),
            },
        }
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &PolicyEvent) {}
}

/// Logs every event through `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: &PolicyEvent) {
        tracing::info!(event = %event, "policy_event");
    }
}

/// Keeps the most recent `capacity` events. Clones share storage.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))), capacity }
    }

    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &PolicyEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}
