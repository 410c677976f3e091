//! Backoff policies.
//!
//! A [`Backoff`] maps the number of retries already attempted to the delay
//! before the next one. The first failure is attempt 0.

use std::{fmt, time::Duration};

use rand::Rng;
use snafu::ensure;

use crate::error::{ConfigSnafu, Result};

/// Default initial delay of [`ExponentialBackoff`] (100 ms).
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Default delay cap of [`ExponentialBackoff`] (10 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Default growth factor of [`ExponentialBackoff`].
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter factor of [`ExponentialBackoff`] (±25%).
const DEFAULT_JITTER: f64 = 0.25;

/// Computes retry delays.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Returns the delay before the next retry, given how many retries were
    /// already attempted.
    fn delay(&self, retries_attempted: u32) -> Duration;
}

/// Retries without delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Immediate;

impl Backoff for Immediate {
    fn delay(&self, _retries_attempted: u32) -> Duration {
        Duration::ZERO
    }
}

/// Waits the same delay before every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Creates a fixed backoff.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn delay(&self, _retries_attempted: u32) -> Duration {
        self.delay
    }
}

/// Exponentially growing delay with jitter.
///
/// `delay(n) = min(initial * multiplier^n, max)`, then jittered by ±`jitter`
/// and capped at `max` again.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use lodestar_sdk::{Backoff, ExponentialBackoff};
///
/// let backoff = ExponentialBackoff::builder()
///     .initial_delay(Duration::from_millis(50))
///     .max_delay(Duration::from_secs(1))
///     .jitter(0.0)
///     .build()
///     .unwrap();
/// assert_eq!(backoff.delay(0), Duration::from_millis(50));
/// assert_eq!(backoff.delay(2), Duration::from_millis(200));
/// assert_eq!(backoff.delay(10), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

#[bon::bon]
impl ExponentialBackoff {
    /// Creates an exponential backoff with validation.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`](crate::DiscoveryError::Config) if:
    /// - `initial_delay` is zero or exceeds `max_delay`
    /// - `multiplier` is below 1.0 or not finite
    /// - `jitter` is outside 0.0-1.0
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_INITIAL_DELAY)] initial_delay: Duration,
        #[builder(default = DEFAULT_MAX_DELAY)] max_delay: Duration,
        #[builder(default = DEFAULT_MULTIPLIER)] multiplier: f64,
        #[builder(default = DEFAULT_JITTER)] jitter: f64,
    ) -> Result<Self> {
        ensure!(!initial_delay.is_zero(), ConfigSnafu { message: "initial delay cannot be zero" });
        ensure!(
            initial_delay <= max_delay,
            ConfigSnafu { message: "initial delay cannot exceed max delay" }
        );
        ensure!(
            multiplier.is_finite() && multiplier >= 1.0,
            ConfigSnafu { message: format!("multiplier must be >= 1.0, got {multiplier}") }
        );
        ensure!(
            (0.0..=1.0).contains(&jitter),
            ConfigSnafu { message: format!("jitter must be within 0.0-1.0, got {jitter}") }
        );
        Ok(Self { initial_delay, max_delay, multiplier, jitter })
    }

    /// Returns the delay before jitter.
    #[must_use]
    pub fn base_delay(&self, retries_attempted: u32) -> Duration {
        let exponent = i32::try_from(retries_attempted).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Returns the initial delay.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retries_attempted: u32) -> Duration {
        apply_jitter(self.base_delay(retries_attempted), self.jitter).min(self.max_delay)
    }
}

/// Backoff computed by a closure.
pub struct FnBackoff<F> {
    f: F,
}

impl<F> fmt::Debug for FnBackoff<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBackoff").finish_non_exhaustive()
    }
}

impl<F> Backoff for FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, retries_attempted: u32) -> Duration {
        (self.f)(retries_attempted)
    }
}

/// Wraps a closure as a [`Backoff`].
pub fn backoff_fn<F>(f: F) -> FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    FnBackoff { f }
}

/// Randomizes `dur` within `[dur * (1 - factor), dur * (1 + factor)]`.
///
/// Factors at or below zero leave the duration unchanged; factors above one
/// are clamped to one.
pub(crate) fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .jitter(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_immediate_is_always_zero() {
        for n in [0, 1, 10, u32::MAX] {
            assert_eq!(Immediate.delay(n), Duration::ZERO);
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::new(Duration::from_millis(250));
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_defaults() {
        let backoff = ExponentialBackoff::builder().build().unwrap();
        assert_eq!(backoff, ExponentialBackoff::default());
        assert_eq!(backoff.initial_delay(), DEFAULT_INITIAL_DELAY);
        assert_eq!(backoff.max_delay(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_exponential_validation() {
        assert!(ExponentialBackoff::builder().initial_delay(Duration::ZERO).build().is_err());
        assert!(
            ExponentialBackoff::builder()
                .initial_delay(Duration::from_secs(5))
                .max_delay(Duration::from_secs(1))
                .build()
                .is_err()
        );
        assert!(ExponentialBackoff::builder().multiplier(0.5).build().is_err());
        assert!(ExponentialBackoff::builder().multiplier(f64::NAN).build().is_err());
        assert!(ExponentialBackoff::builder().jitter(1.5).build().is_err());
    }

    #[test]
    fn test_backoff_fn() {
        let backoff = backoff_fn(|n| Duration::from_millis(u64::from(n) * 10));
        assert_eq!(backoff.delay(3), Duration::from_millis(30));
    }

    #[test]
    fn test_apply_jitter_zero_factor() {
        let dur = Duration::from_millis(100);
        assert_eq!(apply_jitter(dur, 0.0), dur);
    }

    #[test]
    fn test_apply_jitter_within_bounds() {
        let dur = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered_ms = apply_jitter(dur, 0.25).as_millis();
            assert!((750..=1250).contains(&jittered_ms), "jittered {jittered_ms}ms out of bounds");
        }
    }
}
