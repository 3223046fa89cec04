//! Retry logic with exponential backoff for retryable provider errors.

use crate::context::CancellationToken;
use crate::error::{FailureCause, ProviderError};
use std::time::Duration;

/// Configuration for retrying provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// A non-retryable error ended the operation
    Fatal { attempts: u32, error: ProviderError },
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: ProviderError },
    /// Cancellation interrupted the backoff
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

impl From<RetryError> for FailureCause {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Fatal { error, .. } => Self::Provider { error },
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted { attempts, last },
            RetryError::Cancelled { attempts } => Self::Cancelled { attempts },
        }
    }
}

/// Execute an operation with retry logic.
///
/// `operation` receives the 1-indexed attempt number. Retryable errors are
/// retried with exponential backoff until `policy.max_attempts` is reached;
/// `on_retry` is called before each wait with the attempt that failed, the
/// attempt budget, the error and the delay.
pub fn with_retry<T, F, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Result<T, ProviderError>,
    R: FnMut(u32, u32, &ProviderError, Duration),
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let error = match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(RetryError::Fatal {
                attempts: attempt,
                error,
            });
        }

        if attempt == max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        on_retry(attempt, max_attempts, &error, delay);

        if cancel.wait_timeout(delay) {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
    }

    // The loop always returns on its last iteration
    Err(RetryError::Cancelled { attempts: 0 })
}
