use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1_000, max_delay_ms: 8_000 }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, base_delay_ms: 0, max_delay_ms: 0 }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
