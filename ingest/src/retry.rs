use std::time::Duration;

/// `base * 2^attempt`, capped at `max`.
pub fn exponential_backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_rate_limit_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_backoff, attempt, self.max_backoff)
    }

    /// Waits at least as long as the server asked, never less than the backoff step.
    pub fn rate_limit_wait(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let step = self.backoff(attempt);
        hint.map(|hint| hint.max(step)).unwrap_or(step).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_rate_limit_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(3);
        assert_eq!(exponential_backoff(base, 0, max), Duration::from_millis(500));
        assert_eq!(exponential_backoff(base, 1, max), Duration::from_secs(1));
        assert_eq!(exponential_backoff(base, 2, max), Duration::from_secs(2));
        assert_eq!(exponential_backoff(base, 3, max), max);
        assert_eq!(exponential_backoff(base, 40, max), max);
    }

    #[test]
    fn rate_limit_wait_respects_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.rate_limit_wait(0, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        assert_eq!(policy.rate_limit_wait(2, None), Duration::from_secs(4));
        assert_eq!(
            policy.rate_limit_wait(0, Some(Duration::from_secs(3600))),
            policy.max_backoff
        );
    }
}
