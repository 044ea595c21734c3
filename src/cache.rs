//! Response cache keyed by request identity.
//!
//! Pure key → value store with a TTL and a capacity bound; it owns no timers.
//!
//! Semantics:
//! - The key is `METHOD:url` followed by the query params in sorted order, unless a custom key
//!   function is configured.
//! - `get` misses when caching is disabled, the method is not cacheable, the key is absent, or
//!   the entry is older than `ttl` (the stale entry is evicted on the way).
//! - `set` silently ignores responses with `status >= 400` and non-cacheable methods.
//! - When a new key arrives at capacity, the entry with the oldest insertion time is evicted
//!   (insertion order, not access order). The scan is linear in the number of entries.
//! - `clear_pattern` matches against the cache key, not the raw URL.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{serde_millis, DynamicConfig};
use crate::request::{HttpResponse, Method, RequestOptions};
use crate::telemetry::{emit, CacheEvent, NullSink, PolicyEvent, TelemetrySink};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Custom cache key function.
pub type CacheKeyFn = Arc<dyn Fn(&RequestOptions) -> String + Send + Sync>;

/// Cache settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "serde_millis")]
    pub ttl: Duration,
    pub max_entries: usize,
    pub cacheable_methods: BTreeSet<Method>,
    #[serde(skip)]
    pub key_fn: Option<CacheKeyFn>,
}

impl CacheConfig {
    /// Enabled with a 60s TTL and 100 entries.
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.cacheable_methods = methods.into_iter().collect();
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

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_millis(60_000),
            max_entries: 100,
            cacheable_methods: BTreeSet::from([Method::Get]),
            key_fn: None,
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("cacheable_methods", &self.cacheable_methods)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// What `clear_pattern` matches keys against.
#[derive(Debug, Clone)]
pub enum CachePattern {
    /// Literal substring.
    Literal(String),
    Regex(Regex),
}

impl CachePattern {
    fn matches(&self, key: &str) -> bool {
        match self {
            CachePattern::Literal(s) => key.contains(s.as_str()),
            CachePattern::Regex(re) => re.is_match(key),
        }
    }
}

impl From<&str> for CachePattern {
    fn from(value: &str) -> Self {
        CachePattern::Literal(value.to_string())
    }
}

impl From<String> for CachePattern {
    fn from(value: String) -> Self {
        CachePattern::Literal(value)
    }
}

impl From<Regex> for CachePattern {
    fn from(value: Regex) -> Self {
        CachePattern::Regex(value)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: HttpResponse,
    timestamp: u64,
}

/// Default cache key: `METHOD:url`, then sorted query params.
pub fn default_cache_key(request: &RequestOptions) -> String {
    let mut key = format!("{}:{}", request.method, request.url);
    if !request.params.is_empty() {
        key.push(if request.url.contains('?') { '&' } else { '?' });
        key.push_str(&request.query_string());
    }
    key
}

/// In-memory response cache. Clones share entries and settings.
#[derive(Clone)]
pub struct RequestCache {
    config: DynamicConfig<CacheConfig>,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("config", &self.config.get())
            .field("entries", &self.len())
            .finish()
    }
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: DynamicConfig::new(config),
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Update settings in place.
    pub fn configure(&self, f: impl FnOnce(&mut CacheConfig)) {
        self.config.modify(f);
    }

    pub fn config(&self) -> Arc<CacheConfig> {
        self.config.get()
    }

    /// Key under which `request` is stored.
    pub fn key_for(&self, request: &RequestOptions) -> String {
        match &self.config.get().key_fn {
            Some(f) => f(request),
            None => default_cache_key(request),
        }
    }

    fn accepts(cfg: &CacheConfig, request: &RequestOptions) -> bool {
        cfg.enabled && cfg.cacheable_methods.contains(&request.method)
    }

    /// Cached response for `request`, if fresh.
    pub fn get(&self, request: &RequestOptions) -> Option<HttpResponse> {
        let cfg = self.config.get();
        if !Self::accepts(&cfg, request) {
            return None;
        }
        let key = self.key_for(request);
        let now = self.clock.now_millis();
        let ttl = u64::try_from(cfg.ttl.as_millis()).unwrap_or(u64::MAX);

        let mut entries = self.entries.lock();
        let expired = entries.get(&key).map(|entry| now.saturating_sub(entry.timestamp) > ttl);
        let hit = match expired {
            Some(false) => entries.get(&key).map(|entry| entry.response.clone()),
            Some(true) => {
                entries.remove(&key);
                tracing::debug!(key = %key, "cache entry expired");
                None
            }
            None => None,
        };
        drop(entries);

        match &hit {
            Some(_) => {
                tracing::debug!(key = %key, "cache hit");
                emit(&self.sink, PolicyEvent::Cache(CacheEvent::Hit { key }));
            }
            None => emit(&self.sink, PolicyEvent::Cache(CacheEvent::Miss { key })),
        }
        hit
    }

    /// Store `response` for `request`. Ignores error responses and non-cacheable methods.
    pub fn set(&self, request: &RequestOptions, response: &HttpResponse) {
        let cfg = self.config.get();
        if !Self::accepts(&cfg, request) || !response.is_success() || cfg.max_entries == 0 {
            return;
        }
        let key = self.key_for(request);
        let mut stored = response.clone();
        stored.config.signal = None;

        let mut entries = self.entries.lock();
        let mut evicted = None;
        if !entries.contains_key(&key) && entries.len() >= cfg.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        entries.insert(key.clone(), CacheEntry { response: stored, timestamp: self.clock.now_millis() });
        drop(entries);

        if let Some(oldest) = evicted {
            tracing::debug!(key = %oldest, "cache evicted oldest entry");
            emit(&self.sink, PolicyEvent::Cache(CacheEvent::Evicted { key: oldest }));
        }
        emit(&self.sink, PolicyEvent::Cache(CacheEvent::Stored { key }));
    }

    /// Drop the entry for `request`, if any.
    pub fn invalidate(&self, request: &RequestOptions) -> bool {
        let key = self.key_for(request);
        self.entries.lock().remove(&key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every entry whose key matches. Returns the number removed.
    pub fn clear_pattern(&self, pattern: impl Into<CachePattern>) -> usize {
        let pattern = pattern.into();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        before - entries.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let ttl = u64::try_from(self.config.get().ttl.as_millis()).unwrap_or(u64::MAX);
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.timestamp) <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
