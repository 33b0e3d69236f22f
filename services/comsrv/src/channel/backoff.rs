//! Exponential backoff with jitter for reconnection

use rand::Rng;
use std::time::Duration;

/// Reconnect backoff: starts at 500 ms, doubles per failure, caps at 30 s,
/// with ±20% jitter on every delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.2,
            current: initial,
        }
    }

    /// Policy used for transport reconnection.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Next delay to wait. The undelayed base doubles monotonically up to
    /// the cap; jitter applies on top.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread)
    }

    /// Base delay the next call will start from, without jitter.
    pub fn current_base(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
