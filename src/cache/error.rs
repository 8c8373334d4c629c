use thiserror::Error;

use super::storage::StoreError;

/// Unrecoverable cache failures. Everything recoverable degrades to stale data instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("{key} is not cached and does not exist remotely")]
  CacheMiss { key: String },

  #[error("remote unavailable for {key} and nothing cached: {reason}")]
  RemoteUnavailable { key: String, reason: String },

  #[error("delta sync failed ({delta}) and the full sync fallback failed too ({full})")]
  SyncConflict { delta: String, full: String },

  #[error("durable store error: {0}")]
  Store(String),
}

impl From<StoreError> for CacheError {
  fn from(err: StoreError) -> Self {
    CacheError::Store(err.to_string())
  }
}
