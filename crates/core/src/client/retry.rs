use std::time::Duration;

use super::clock::Clock;
use super::provider::ProviderError;
use crate::config::RetrySettings;

/// Exponential backoff value: `min(base_delay * 2^attempt, max_delay)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_secs(settings.retry_delay),
            Duration::from_secs(settings.max_delay),
        )
    }

    /// Same delays, one attempt.
    pub fn single_attempt(&self) -> Self {
        Self {
            max_retries: 0,
            ..*self
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before the retry that follows the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_after(&self, attempt: u32, error: &ProviderError) -> Duration {
        let delay = self.delay_for(attempt);
        match error.retry_after() {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }

    pub fn execute<T, F>(&self, clock: &dyn Clock, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T, ProviderError>,
    {
        self.execute_observed(clock, operation, |_, _, _| {})
    }

    /// Runs `operation` until it succeeds, fails fatally or the retry budget is
    /// spent. `on_retry(attempt, delay, error)` fires before each backoff wait.
    pub fn execute_observed<T, F, O>(
        &self,
        clock: &dyn Clock,
        mut operation: F,
        mut on_retry: O,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T, ProviderError>,
        O: FnMut(u32, Duration, &ProviderError),
    {
        let mut attempt = 0;
        loop {
            match operation(attempt) {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_after(attempt, &error);
                    on_retry(attempt, delay, &error);
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt + 1,
                    }
                }
            }
        }
    }
}
