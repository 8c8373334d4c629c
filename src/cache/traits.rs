//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::freshness::Freshness;

/// Trait for entities that can be mirrored.
///
/// Implementors must provide a unique cache key, a watermark (the remote
/// identifier or version used to spot records a time-based delta query missed)
/// and optionally an updated_at timestamp.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., issue number, release id)
  fn cache_key(&self) -> String;

  /// Remote identifier/version; the largest one seen becomes the high watermark.
  fn watermark(&self) -> u64;

  /// Last modification timestamp, if the remote tracks one.
  fn updated_at(&self) -> Option<DateTime<Utc>>;

  /// Entity type name, used as the durable store namespace (e.g., "issue")
  fn entity_type() -> &'static str;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched from the remote
  pub cached_at: DateTime<Utc>,
  /// Age classification at the time it was served
  pub freshness: Freshness,
}

impl<T> CacheResult<T> {
  /// Data served straight from the in-memory tier.
  pub fn from_memory(data: T, cached_at: DateTime<Utc>, freshness: Freshness) -> Self {
    Self {
      data,
      source: CacheSource::Memory,
      cached_at,
      freshness,
    }
  }

  /// Data promoted from the durable store.
  pub fn from_disk(data: T, cached_at: DateTime<Utc>, freshness: Freshness) -> Self {
    Self {
      data,
      source: CacheSource::Disk,
      cached_at,
      freshness,
    }
  }

  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at,
      freshness: Freshness::Fresh,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>, freshness: Freshness) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
      freshness,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
      freshness: self.freshness,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// In-process memory tier
  Memory,
  /// Durable on-disk snapshot
  Disk,
  /// Fresh data from network
  Network,
  /// Offline mode - network unavailable, serving whatever the store had
  Offline,
}
