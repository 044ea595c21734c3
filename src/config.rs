//! Live-updatable configuration shared by all request policies.
//!
//! Every controller keeps its settings in a [`DynamicConfig`], so `configure()` can change them
//! while timers are pending: a timer always reads the current snapshot when it fires instead of
//! the value captured when it was armed.
//!
//! [`PolicyConfig`] aggregates the per-policy settings and loads them from JSON, one section per
//! policy:
//!
//! ```rust
//! use reqpolicy::config::PolicyConfig;
//!
//! let cfg = PolicyConfig::from_json_str(r#"{
//!     "cache": { "enabled": true, "ttl": 50, "maxEntries": 10 },
//!     "throttle": { "enabled": true, "limit": 5, "interval": 1000 }
//! }"#).unwrap();
//! assert!(cfg.cache.enabled);
//! assert_eq!(cfg.throttle.limit, 5);
//! assert!(!cfg.retry.enabled);
//! ```

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::debounce::DebounceConfig;
use crate::error::RequestError;
use crate::retry::RetryConfig;
use crate::throttle::ThrottleConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap lock-free reads and atomic replacement of shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Apply an in-place edit to a copy of the current value and publish it.
    ///
    /// Returns the previous and the new snapshot.
    pub fn modify<F>(&self, f: F) -> (Arc<T>, Arc<T>)
    where
        F: FnOnce(&mut T),
        T: Clone,
    {
        let previous = self.inner.load_full();
        let mut next = T::clone(&previous);
        f(&mut next);
        let next = Arc::new(next);
        self.inner.store(next.clone());
        (previous, next)
    }
}

/// Settings for every policy a [`PolicyClient`](crate::stack::PolicyClient) can wire in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub throttle: ThrottleConfig,
    pub batch: BatchConfig,
    pub debounce: DebounceConfig,
    /// Give every request a tracked cancellation token.
    pub cancellation: bool,
}

impl PolicyConfig {
    /// Every policy enabled with its documented defaults.
    pub fn all_enabled() -> Self {
        Self {
            cache: CacheConfig::enabled(),
            retry: RetryConfig::enabled(),
            throttle: ThrottleConfig::enabled(),
            batch: BatchConfig::enabled(),
            debounce: DebounceConfig::enabled(),
            cancellation: true,
        }
    }

    /// Parse from JSON; missing sections keep their (disabled) defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, RequestError> {
        serde_json::from_str(raw)
            .map_err(|e| RequestError::Configuration(format!("invalid policy config: {e}")))
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde adapter storing an `Option<Duration>` as integer milliseconds.
pub mod serde_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_set_modify() {
        let cfg = DynamicConfig::new(1);
        assert_eq!(*cfg.get(), 1);
        cfg.set(2);
        assert_eq!(*cfg.get(), 2);
        let (before, after) = cfg.modify(|v| *v += 3);
        assert_eq!((*before, *after), (2, 5));
        assert_eq!(*cfg.get(), 5);
    }

    #[test]
    fn clones_share_updates() {
        let a = DynamicConfig::new(String::from("a"));
        let b = a.clone();
        b.set("b".into());
        assert_eq!(a.get().as_str(), "b");
    }

    #[test]
    fn policy_config_defaults_are_pass_through() {
        let cfg = PolicyConfig::default();
        assert!(!cfg.cache.enabled);
        assert!(!cfg.retry.enabled);
        assert!(!cfg.throttle.enabled);
        assert!(!cfg.batch.enabled);
        assert!(!cfg.debounce.enabled);
        assert!(!cfg.cancellation);
    }

    #[test]
    fn policy_config_reads_generator_defaults() {
        let cfg = PolicyConfig::all_enabled();
        assert_eq!(cfg.cache.ttl, Duration::from_millis(60_000));
        assert_eq!(cfg.cache.max_entries, 100);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.throttle.limit, 60);
        assert_eq!(cfg.debounce.delay, Duration::from_millis(300));
        assert!(cfg.debounce.cancel_pending);
    }

    #[test]
    fn json_round_trip_keeps_durations_in_millis() {
        let cfg = PolicyConfig::from_json_str(
            r#"{ "debounce": { "enabled": true, "delay": 120, "maxWait": 400 }, "cancellation": true }"#,
        )
        .unwrap();
        assert_eq!(cfg.debounce.delay, Duration::from_millis(120));
        assert_eq!(cfg.debounce.max_wait, Some(Duration::from_millis(400)));
        assert!(cfg.cancellation);

        let encoded = serde_json::to_value(&cfg).unwrap();
        assert_eq!(encoded["debounce"]["delay"], 120);
    }

    #[test]
    fn invalid_json_is_configuration_error() {
        let err = PolicyConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, RequestError::Configuration(_)));
    }
}
