//! Age classification and tuning knobs for the resource cache.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;

/// Age-based classification of a cache entry relative to two thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
  /// Younger than the freshness window; served without any remote check.
  Fresh,
  /// Between the two windows; served, but eligible for a background resync.
  Stale,
  /// Older than the stale window; a refresh must be attempted first.
  Expired,
}

impl Freshness {
  pub fn classify(cached_at: DateTime<Utc>, now: DateTime<Utc>, options: &CacheOptions) -> Self {
    let age = now - cached_at;
    if age < options.freshness_window {
      Freshness::Fresh
    } else if age < options.stale_window {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }

  /// Whether an entry may be served without first trying the remote.
  pub fn is_servable(self) -> bool {
    !matches!(self, Freshness::Expired)
  }
}

/// Current time truncated to microseconds, the precision the durable store keeps.
pub fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(6)
}

/// Resource cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// Entries younger than this are fresh
  pub freshness_window: Duration,
  /// Entries older than this are expired
  pub stale_window: Duration,
  /// Bounded fan-out for batch reads and gap-fill fetches
  pub batch_size: usize,
  /// Treat every sync as a forced full sync
  pub force_full_sync: bool,
  /// Spawn a resync when a stale-but-usable entry is served
  pub background_refresh: bool,
  /// Promote a delta sync to a full sync once the last full sync is older than this
  pub full_resync_after: Option<Duration>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      freshness_window: Duration::hours(1),
      stale_window: Duration::hours(24),
      batch_size: 100,
      force_full_sync: false,
      background_refresh: true,
      full_resync_after: None,
    }
  }
}

impl CacheOptions {
  pub fn with_windows(mut self, freshness_window: Duration, stale_window: Duration) -> Self {
    self.freshness_window = freshness_window;
    self.stale_window = stale_window;
    self
  }

  pub fn with_background_refresh(mut self, enabled: bool) -> Self {
    self.background_refresh = enabled;
    self
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }
}
