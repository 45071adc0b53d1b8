use std::time;

/// Backoff policy for retrying notification deliveries that failed with a
/// retryable error.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient the initial interval is multiplied with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Attempts after which the delivery is dropped.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time to sleep before retry number `attempt` (0-based past attempts).
    ///
    /// A `preferred_interval` (e.g. parsed from a Retry-After header) takes
    /// precedence over the computed backoff but never exceeds the maximum.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match (preferred_interval, self.maximum_interval) {
            (Some(preferred), Some(maximum)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate, maximum), preferred),
                maximum,
            ),
            (Some(preferred), None) => std::cmp::max(candidate, preferred),
            (None, Some(maximum)) => std::cmp::min(candidate, maximum),
            (None, None) => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None, 5);

        assert_eq!(policy.retry_interval(0, None), time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(1, None), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(3, None), time::Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped_at_maximum_interval() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(4)),
            5,
        );

        assert_eq!(policy.retry_interval(5, None), time::Duration::from_secs(4));
    }

    #[test]
    fn preferred_interval_wins_but_respects_maximum() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(10)),
            5,
        );

        // Preferred interval beats a smaller computed backoff.
        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(5))),
            time::Duration::from_secs(5)
        );
        // But never exceeds the maximum.
        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(60))),
            time::Duration::from_secs(10)
        );
    }
}
