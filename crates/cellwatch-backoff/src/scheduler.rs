//! The retry scheduler used by connection attempt loops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{ExponentialBackoff, IntervalFunction, JitteredBackoff};
use crate::BackoffError;

/// No retry ever sleeps for less than this.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Computes backoff delays from an attempt index and a fixed policy.
///
/// A scheduler holds no mutable state; cloning it is cheap and two clones
/// produce delays from the same distribution.
#[derive(Clone)]
pub struct RetryScheduler {
    interval: Arc<dyn IntervalFunction>,
    floor: Duration,
    ceiling: Duration,
}

impl RetryScheduler {
    /// Builds the standard exponential-with-jitter scheduler.
    ///
    /// Returns an error when the policy is inconsistent: a multiplier below
    /// one, a jitter factor outside `0.0..=1.0`, or a maximum delay shorter
    /// than the initial delay.
    pub fn exponential(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
    ) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(BackoffError::InvalidJitter(jitter_factor));
        }
        if max_delay < initial_delay {
            return Err(BackoffError::InvertedBounds {
                initial: initial_delay,
                max: max_delay,
            });
        }

        let base = ExponentialBackoff::new(initial_delay, max_delay).multiplier(multiplier);
        let ceiling = Duration::try_from_secs_f64(max_delay.as_secs_f64() * (1.0 + jitter_factor))
            .unwrap_or(Duration::MAX)
            .max(MIN_RETRY_DELAY);
        Ok(Self {
            interval: Arc::new(JitteredBackoff::new(base, jitter_factor)),
            floor: MIN_RETRY_DELAY,
            ceiling,
        })
    }

    /// Wraps an arbitrary interval function. Delays are still floored at
    /// [`MIN_RETRY_DELAY`] but have no upper bound.
    pub fn custom<I>(interval: I) -> Self
    where
        I: IntervalFunction + 'static,
    {
        Self {
            interval: Arc::new(interval),
            floor: MIN_RETRY_DELAY,
            ceiling: Duration::MAX,
        }
    }

    /// Delay to sleep after the failed attempt with index `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.interval
            .next_interval(attempt)
            .clamp(self.floor, self.ceiling)
    }

    /// The smallest delay this scheduler can return.
    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// The largest delay this scheduler can return.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("floor", &self.floor)
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}
