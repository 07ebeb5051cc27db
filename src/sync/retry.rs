use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// Bounded exponential backoff with dead-lettering of permanent failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  pub base: Duration,
  pub max: Duration,
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      base: Duration::from_secs(config.backoff_base_secs),
      max: Duration::from_secs(config.backoff_max_secs),
      max_attempts: config.max_attempts.max(1),
    }
  }

  /// Delay before retrying after `attempts` failures: base * 2^(attempts-1), capped.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    self
      .base
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.max)
      .min(self.max)
  }

  pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(self.delay_for(attempts))
      .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64));
    now + delay
  }

  /// Only permanent rejections are abandoned; transient ones retry forever.
  pub fn should_dead_letter(&self, attempts: u32, error: &SyncError) -> bool {
    !error.is_transient() && attempts >= self.max_attempts
  }
}
