//! Capped exponential backoff.

use std::time::Duration;

/// Backoff schedule used for reconnection and degraded health retries.
///
/// Starts at `initial`, doubles per failure and never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay after a failure.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor applied per consecutive failure.
    pub multiplier: f64,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
        }
    }

    /// Return the next delay and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        delay
    }

    /// Peek at the delay the next failure will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Reset to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
