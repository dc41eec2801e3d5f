use std::time::Duration;

/// Abstraction for computing the delay before a retry attempt.
///
/// Implementations must be pure with respect to the attempt index: the same
/// policy asked for the same attempt yields a delay drawn from the same
/// distribution, with no state carried between calls.
pub trait IntervalFunction: Send + Sync {
    /// Computes the delay before the next attempt.
    ///
    /// `attempt` is 0-indexed: the sleep after the first failed attempt is
    /// `next_interval(0)`.
    fn next_interval(&self, attempt: u32) -> Duration;
}

/// Returns the same delay for every attempt.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    duration: Duration,
}

impl FixedInterval {
    /// Creates a fixed interval.
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl IntervalFunction for FixedInterval {
    fn next_interval(&self, _attempt: u32) -> Duration {
        self.duration
    }
}

/// Exponential growth capped at a maximum, without randomization.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff doubling from `initial_interval` up to `max_interval`.
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: 2.0,
            max_interval,
        }
    }

    /// Sets the growth factor applied per attempt.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// The un-jittered delay for `attempt`, capped at the maximum.
    pub fn capped(&self, attempt: u32) -> Duration {
        capped_exponential(
            self.initial_interval,
            self.multiplier,
            self.max_interval,
            attempt,
        )
    }
}

impl IntervalFunction for ExponentialBackoff {
    fn next_interval(&self, attempt: u32) -> Duration {
        self.capped(attempt)
    }
}

/// Exponential backoff plus additive uniform jitter.
///
/// The delay for attempt `k` is `min(initial * multiplier^k, max) + j` where
/// `j` is drawn uniformly from `[0, jitter_factor * min(...)]`. The result is
/// therefore bounded by `max * (1 + jitter_factor)`.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    base: ExponentialBackoff,
    jitter_factor: f64,
}

impl JitteredBackoff {
    /// Creates a jittered backoff. `jitter_factor` is clamped to `0.0..=1.0`.
    pub fn new(base: ExponentialBackoff, jitter_factor: f64) -> Self {
        Self {
            base,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Returns the configured jitter factor.
    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    fn jitter(&self, capped: Duration) -> Duration {
        use rand::Rng;

        let spread = capped.as_secs_f64() * self.jitter_factor;
        if spread <= 0.0 {
            return Duration::ZERO;
        }
        let drawn = rand::rng().random_range(0.0..=spread);
        Duration::from_secs_f64(drawn)
    }
}

impl IntervalFunction for JitteredBackoff {
    fn next_interval(&self, attempt: u32) -> Duration {
        let capped = self.base.capped(attempt);
        capped.saturating_add(self.jitter(capped))
    }
}

/// Closure-backed interval, mostly useful in tests.
pub struct FnInterval<F> {
    f: F,
}

impl<F> FnInterval<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    /// Creates a function-based interval.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> IntervalFunction for FnInterval<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn next_interval(&self, attempt: u32) -> Duration {
        (self.f)(attempt)
    }
}

fn capped_exponential(initial: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    // powi overflows to +inf for large exponents; clamp before building a Duration.
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let factor = multiplier.powi(exponent);
    let secs = initial.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}
