use std::time::Duration;

/// Exponential backoff with an attempt cap.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts after which a failing task is no longer retried.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try, given how many attempts have been made so far.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.pow(exp))
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
