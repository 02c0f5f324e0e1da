//! # Retry
//!
//! Module providing a `RetryPolicy` struct shared by the two retry layers of the
//! engine: bounded batch-handler retries and the open-ended broker join loop.
use std::time;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// `initial_interval * attempt`
    Linear,
    /// `initial_interval * coefficient ^ (attempt - 1)`
    Exponential { coefficient: u32 },
}

#[derive(Clone, Debug)]
/// A retry policy to determine how many attempts are allowed and how long to wait between them.
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Total attempts allowed, first one included. `None` retries until told to stop.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff: Backoff, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff, initial_interval)
    }

    /// Determine the wait after the given (1-based) failed attempt.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let attempt = attempt.max(1);
        let candidate_interval = match self.backoff {
            Backoff::Linear => self.initial_interval.saturating_mul(attempt),
            Backoff::Exponential { coefficient } => self
                .initial_interval
                .saturating_mul(coefficient.saturating_pow(attempt - 1)),
        };

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Whether another attempt may follow the given number of attempts already made.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff: Backoff,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff: Backoff::Linear,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff: Backoff, initial_interval: time::Duration) -> Self {
        Self {
            backoff,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn unbounded(mut self) -> RetryPolicyBuilder {
        self.max_attempts = None;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}
