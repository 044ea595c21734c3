//! Exponential backoff with proportional jitter for request retries.
//!
//! Retry-count semantics: `retry_count` is the number of retries already made, so the first
//! retry (`retry_count = 0`) waits `base`, the second `2 * base`, then `4 * base`, and so on.
//! Jitter adds a random extra of up to `ratio * delay` on top, so it never shortens a delay
//! and consecutive delays stay strictly increasing for ratios below `1.0`.
//!
//! ```rust
//! use std::time::Duration;
//! use reqpolicy::backoff::{Backoff, Jitter};
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100)).with_jitter(Jitter::None);
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(800));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use rand::{rng, Rng};
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Default share of the delay added as random jitter.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Exact backoff delay.
    None,
    /// Adds a uniform random extra in `[0, ratio * delay]`.
    Proportional(f64),
}

impl Jitter {
    /// Up to 20% extra delay.
    pub fn standard() -> Self {
        Jitter::Proportional(DEFAULT_JITTER_RATIO)
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => {
                let millis = as_millis_saturated(delay);
                let ceiling = (millis as f64 * ratio.clamp(0.0, 1.0)).floor() as u64;
                if ceiling == 0 {
                    return delay;
                }
                let extra = rng.random_range(0..=ceiling);
                delay.saturating_add(Duration::from_millis(extra)).min(MAX_BACKOFF)
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::standard()
    }
}

/// Exponential backoff: `base * 2^retry_count`, optionally capped, then jittered.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    jitter: Jitter,
}

impl Backoff {
    /// Exponential backoff starting at `base`, with the standard jitter.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None, jitter: Jitter::standard() }
    }

    /// Cap the un-jittered delay.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the retry following `retry_count` earlier retries, without jitter.
    pub fn raw_delay(&self, retry_count: u32) -> Duration {
        let multiplier = 2u128.saturating_pow(retry_count);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        self.max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
    }

    /// Delay before the retry following `retry_count` earlier retries, jitter applied.
    pub fn delay(&self, retry_count: u32) -> Duration {
        self.jitter.apply(self.raw_delay(retry_count))
    }
}

fn as_millis_saturated(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
