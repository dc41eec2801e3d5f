//! Retry delay scheduling for connection attempt loops.
//!
//! This crate provides the pure backoff computation used by
//! `cellwatch-publisher` when (re)establishing a broker session:
//!
//! - **IntervalFunction abstraction**: pluggable delay strategies
//!   - Fixed interval
//!   - Exponential backoff with configurable multiplier and cap
//!   - Exponential backoff with additive uniform jitter
//!   - Closure-based intervals
//! - **RetryScheduler**: the policy object the connection manager consults,
//!   flooring every delay at [`MIN_RETRY_DELAY`]
//!
//! # Examples
//!
//! ```
//! use cellwatch_backoff::RetryScheduler;
//! use std::time::Duration;
//!
//! let scheduler = RetryScheduler::exponential(
//!     Duration::from_secs(1),
//!     Duration::from_secs(60),
//!     2.0,
//!     0.1,
//! )
//! .expect("valid policy");
//!
//! let first = scheduler.delay(0);
//! assert!(first >= Duration::from_secs(1));
//! assert!(first <= Duration::from_millis(1100));
//! ```

mod backoff;
mod scheduler;

use std::time::Duration;

pub use backoff::{ExponentialBackoff, FixedInterval, FnInterval, IntervalFunction, JitteredBackoff};
pub use scheduler::{RetryScheduler, MIN_RETRY_DELAY};

/// Errors raised when a backoff policy is internally inconsistent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    /// The growth factor must be finite and at least 1.0.
    #[error("backoff multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    /// The jitter factor must lie in `0.0..=1.0`.
    #[error("jitter factor must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),

    /// The maximum delay is shorter than the initial delay.
    #[error("max retry delay {max:?} is shorter than initial delay {initial:?}")]
    InvertedBounds {
        /// Configured initial delay.
        initial: Duration,
        /// Configured maximum delay.
        max: Duration,
    },
}
