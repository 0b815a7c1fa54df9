//! Retry policy for cache reads.

use std::time::Duration;

use crate::api::ApiError;

/// Exponential backoff for failed reads. Writes never retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Automatic retries after the first failure
  pub max_retries: u32,
  /// Delay before the first retry; doubled for each following one
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (0-based): `min(base * 2^retry, max)`.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Whether a read that has already been retried `retries` times should
  /// try again after failing with `error`.
  pub fn should_retry(&self, retries: u32, error: &ApiError) -> bool {
    retries < self.max_retries && error.is_retryable()
  }
}
