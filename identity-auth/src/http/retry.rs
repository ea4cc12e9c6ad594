//! Backoff policy for idempotent identity provider calls.

use std::time::{Duration, SystemTime};

use reqwest_retry::{RetryDecision, RetryPolicy};

/// Exponential backoff bounded both by attempt count and by a time budget.
///
/// A retry is only scheduled if it would start before `request start + budget`,
/// so a caller never waits on retries much longer than one request timeout.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    budget: Duration,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(10),
            budget: Duration::from_secs(30),
        }
    }

    /// Limit the total time retries may add after the first attempt started.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    fn delay_for(&self, n_past_retries: u32) -> Duration {
        let factor = 2_u32.saturating_pow(n_past_retries);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl RetryPolicy for BackoffPolicy {
    fn should_retry(&self, request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        if n_past_retries >= self.max_retries {
            return RetryDecision::DoNotRetry;
        }

        let execute_after = SystemTime::now() + self.delay_for(n_past_retries);
        let deadline = request_start_time + self.budget;
        if execute_after > deadline {
            return RetryDecision::DoNotRetry;
        }
        RetryDecision::Retry { execute_after }
    }
}
