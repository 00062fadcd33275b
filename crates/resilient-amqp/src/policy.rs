//! Reconnection policies defining the delay between failed connect attempts.

use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff: `min(initial * multiplier^attempt, max_interval)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl ExponentialBackoff {
    /// Doubles from `initial` without a practical cap.
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max_interval: Duration::MAX,
        }
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Delay after the `attempt`-th consecutive failure (0-indexed).
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }
}

/// A user-supplied delay function.
pub type IntervalFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How long the supervisor waits before redialing after a failed attempt.
#[derive(Clone)]
pub enum ReconnectPolicy {
    /// Same delay after every failure.
    Fixed(Duration),

    /// Exponential backoff between attempts.
    Exponential(ExponentialBackoff),

    /// Custom backoff function receiving the failure counter.
    Custom(IntervalFn),
}

impl ReconnectPolicy {
    /// Create a fixed delay policy
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy::Fixed(delay)
    }

    /// Create a doubling backoff policy
    ///
    /// # Arguments
    /// * `initial_delay` - Delay after the first failure (e.g., 1s)
    /// * `max_delay` - Maximum delay cap (e.g., 10s)
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        ReconnectPolicy::Exponential(
            ExponentialBackoff::new(initial_delay)
                .multiplier(2.0)
                .max_interval(max_delay),
        )
    }

    /// Create a policy from a function of the failure counter
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        ReconnectPolicy::Custom(Arc::new(f))
    }

    /// Get the delay for a given failure counter value
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed(delay) => *delay,
            ReconnectPolicy::Exponential(backoff) => backoff.next_interval(attempt),
            ReconnectPolicy::Custom(f) => f(attempt),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // 1s, 2s, 4s, 8s, then 10s forever
        Self::exponential(Duration::from_secs(1), Duration::from_secs(10))
    }
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(delay) => write!(f, "ReconnectPolicy::Fixed({:?})", delay),
            Self::Exponential(backoff) => write!(f, "ReconnectPolicy::{:?}", backoff),
            Self::Custom(_) => write!(f, "ReconnectPolicy::Custom"),
        }
    }
}
