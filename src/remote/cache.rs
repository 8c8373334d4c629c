//! Caching implementations for GitHub types.

use chrono::{DateTime, Utc};

use crate::cache::Cacheable;

use super::types::{Issue, Milestone, Release};

impl Cacheable for Issue {
  fn cache_key(&self) -> String {
    self.number.to_string()
  }

  fn watermark(&self) -> u64 {
    self.number
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    Some(self.updated_at)
  }

  fn entity_type() -> &'static str {
    "issue"
  }
}

impl Cacheable for Milestone {
  fn cache_key(&self) -> String {
    self.number.to_string()
  }

  fn watermark(&self) -> u64 {
    self.number
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    Some(self.updated_at)
  }

  fn entity_type() -> &'static str {
    "milestone"
  }
}

impl Cacheable for Release {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn watermark(&self) -> u64 {
    self.id
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    // Releases have no updated_at; publishing is the last change we can see
    Some(self.published_at.unwrap_or(self.created_at))
  }

  fn entity_type() -> &'static str {
    "release"
  }
}
