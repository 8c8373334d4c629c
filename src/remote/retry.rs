//! Retry with exponential backoff for remote calls.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::cache::RemoteError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
  /// Longest we are willing to sleep waiting for a rate limit reset
  pub rate_limit_wait_cap: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
      multiplier: 2.0,
      rate_limit_wait_cap: Duration::from_secs(15 * 60),
    }
  }
}

impl RetryPolicy {
  /// Policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let factor = self.multiplier.powi(exponent);
    let secs = self.base_delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
      self.max_delay
    } else {
      Duration::from_secs_f64(secs)
    }
  }

  fn delay_for(&self, err: &RemoteError, attempt: u32) -> Duration {
    match err {
      RemoteError::RateLimited { reset_at } => {
        let wait = (*reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        wait.min(self.rate_limit_wait_cap)
      }
      _ => self.backoff(attempt),
    }
  }

  /// Run `op` until it succeeds, fails permanently or runs out of attempts.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RemoteError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_transient() && attempt < self.max_attempts => {
          let delay = self.delay_for(&err, attempt);
          warn!(request = what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying remote request");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
