//! Serde-deserializable types matching GitHub REST responses.
//!
//! Kept separate from the domain types so the mirrored records only carry what
//! the application needs.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::types::{Issue, ItemState, Milestone, MilestoneRef, Release};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLabel {
  pub name: String,
}

// ============================================================================
// Issues
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMilestoneRef {
  pub number: u64,
  pub title: String,
  pub due_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub number: u64,
  pub title: String,
  pub state: ItemState,
  #[serde(default)]
  pub labels: Vec<ApiLabel>,
  pub milestone: Option<ApiMilestoneRef>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub body: Option<String>,
  pub user: Option<ApiUser>,
  #[serde(default)]
  pub assignees: Vec<ApiUser>,
  pub html_url: String,
  // Present only on pull requests, which the issues endpoints also return
  pub pull_request: Option<serde_json::Value>,
}

impl ApiIssue {
  pub fn is_pull_request(&self) -> bool {
    self.pull_request.is_some()
  }

  pub fn into_issue(self) -> Issue {
    Issue {
      number: self.number,
      title: self.title,
      state: self.state,
      labels: self.labels.into_iter().map(|l| l.name).collect(),
      milestone: self.milestone.map(|m| MilestoneRef {
        number: m.number,
        title: m.title,
        due_on: m.due_on,
      }),
      created_at: self.created_at,
      updated_at: self.updated_at,
      body: self.body,
      author: self.user.map(|u| u.login),
      assignees: self.assignees.into_iter().map(|u| u.login).collect(),
      url: self.html_url,
    }
  }
}

// ============================================================================
// Milestones
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMilestone {
  pub number: u64,
  pub title: String,
  pub description: Option<String>,
  pub state: ItemState,
  pub due_on: Option<DateTime<Utc>>,
  #[serde(default)]
  pub open_issues: u64,
  #[serde(default)]
  pub closed_issues: u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub html_url: String,
}

impl From<ApiMilestone> for Milestone {
  fn from(m: ApiMilestone) -> Self {
    Milestone {
      number: m.number,
      title: m.title,
      description: m.description,
      state: m.state,
      due_on: m.due_on,
      open_issues: m.open_issues,
      closed_issues: m.closed_issues,
      created_at: m.created_at,
      updated_at: m.updated_at,
      url: m.html_url,
    }
  }
}

// ============================================================================
// Releases
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiRelease {
  pub id: u64,
  pub tag_name: String,
  pub name: Option<String>,
  #[serde(default)]
  pub draft: bool,
  #[serde(default)]
  pub prerelease: bool,
  pub created_at: DateTime<Utc>,
  pub published_at: Option<DateTime<Utc>>,
  pub body: Option<String>,
  pub html_url: String,
}

impl From<ApiRelease> for Release {
  fn from(r: ApiRelease) -> Self {
    Release {
      id: r.id,
      tag_name: r.tag_name,
      name: r.name,
      draft: r.draft,
      prerelease: r.prerelease,
      created_at: r.created_at,
      published_at: r.published_at,
      body: r.body,
      url: r.html_url,
    }
  }
}

// ============================================================================
// Rate limit endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiRateLimitResponse {
  pub rate: ApiRate,
}

#[derive(Debug, Deserialize)]
pub struct ApiRate {
  pub limit: u64,
  pub remaining: u64,
  /// Unix seconds
  pub reset: i64,
}
