//! The remote collaborator the cache pulls records from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::traits::Cacheable;

/// Failure reported by a remote source.
///
/// The transient/permanent split drives both the retry policy and the
/// cache's choice between `CacheMiss` and `RemoteUnavailable`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  #[error("transient remote failure: {message}")]
  Transient { message: String },

  #[error("rate limited until {reset_at}")]
  RateLimited { reset_at: DateTime<Utc> },

  #[error("remote resource not found: {resource}")]
  NotFound { resource: String },

  #[error("remote request rejected: {message}")]
  Permanent { message: String },
}

impl RemoteError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::Permanent {
      message: message.into(),
    }
  }

  pub fn not_found(resource: impl Into<String>) -> Self {
    Self::NotFound {
      resource: resource.into(),
    }
  }

  /// Whether retrying the same request may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

/// Listing filter passed through to the remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
  /// "open", "closed" or "all"; remote default when None
  pub state: Option<String>,
  pub label: Option<String>,
  pub milestone: Option<String>,
}

impl ListFilter {
  /// Every record regardless of state, used by full syncs.
  pub fn all() -> Self {
    Self {
      state: Some("all".to_string()),
      ..Self::default()
    }
  }
}

/// A remote, paginated collection the cache mirrors.
///
/// Reads must be idempotent. `list_since` only needs to be approximately
/// correct; the cache compensates with a watermark gap-fill.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
  type Record: Cacheable;

  async fn list(&self, filter: &ListFilter) -> Result<Vec<Self::Record>, RemoteError>;

  /// Fetch one record by its cache key.
  async fn get(&self, key: &str) -> Result<Self::Record, RemoteError>;

  /// Records changed after `since`.
  async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Self::Record>, RemoteError>;

  /// Largest identifier currently known to the remote.
  ///
  /// Returns None for collections whose identifiers are not sequential; those
  /// skip the gap-fill step. For sequential collections the gap ids are
  /// fetched through `get(&id.to_string())`.
  async fn max_id(&self) -> Result<Option<u64>, RemoteError>;
}
