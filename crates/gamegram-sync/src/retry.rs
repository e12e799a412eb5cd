use std::time::Duration;

/// Linear, capped backoff for realtime reconnects.
///
/// Attempt `n` (1-based) waits `min(n * base, cap)`. Past `max_attempts`
/// the delay stays at the cap; retries never stop.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt > self.max_attempts {
            return self.max_delay;
        }
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_millis(3_000), 10)
    }
}
