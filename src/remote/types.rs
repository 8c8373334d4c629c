use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
  Open,
  Closed,
}

impl ItemState {
  pub fn as_str(self) -> &'static str {
    match self {
      ItemState::Open => "open",
      ItemState::Closed => "closed",
    }
  }
}

/// Milestone as referenced from an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneRef {
  pub number: u64,
  pub title: String,
  pub due_on: Option<DateTime<Utc>>,
}

/// Mirrored issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  pub number: u64,
  pub title: String,
  pub state: ItemState,
  #[serde(default)]
  pub labels: Vec<String>,
  pub milestone: Option<MilestoneRef>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub body: Option<String>,
  pub author: Option<String>,
  #[serde(default)]
  pub assignees: Vec<String>,
  pub url: String,
}

impl Issue {
  pub fn is_open(&self) -> bool {
    self.state == ItemState::Open
  }

  pub fn has_label(&self, label: &str) -> bool {
    self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
  pub number: u64,
  pub title: String,
  pub description: Option<String>,
  pub state: ItemState,
  pub due_on: Option<DateTime<Utc>>,
  pub open_issues: u64,
  pub closed_issues: u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
  pub id: u64,
  pub tag_name: String,
  pub name: Option<String>,
  pub draft: bool,
  pub prerelease: bool,
  pub created_at: DateTime<Utc>,
  pub published_at: Option<DateTime<Utc>>,
  pub body: Option<String>,
  pub url: String,
}

/// Local filter over mirrored issues
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
  pub state: Option<ItemState>,
  pub label: Option<String>,
  /// Milestone title
  pub milestone: Option<String>,
  pub limit: Option<usize>,
}

impl IssueFilter {
  pub fn open() -> Self {
    Self {
      state: Some(ItemState::Open),
      ..Self::default()
    }
  }

  pub fn matches(&self, issue: &Issue) -> bool {
    if self.state.is_some_and(|state| issue.state != state) {
      return false;
    }
    if let Some(label) = &self.label {
      if !issue.has_label(label) {
        return false;
      }
    }
    if let Some(milestone) = &self.milestone {
      let in_milestone = issue
        .milestone
        .as_ref()
        .is_some_and(|m| m.title.eq_ignore_ascii_case(milestone));
      if !in_milestone {
        return false;
      }
    }
    true
  }

  /// Filter, sort newest number first and truncate to the limit.
  pub fn apply(&self, issues: Vec<Issue>) -> Vec<Issue> {
    let mut matching: Vec<Issue> = issues.into_iter().filter(|i| self.matches(i)).collect();
    matching.sort_by(|a, b| b.number.cmp(&a.number));
    if let Some(limit) = self.limit {
      matching.truncate(limit);
    }
    matching
  }
}

/// Payload for creating an issue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewIssue {
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::mock::sample_issue;

  fn labelled(number: u64, label: &str, state: ItemState) -> Issue {
    let mut issue = sample_issue(number);
    issue.labels = vec![label.to_string()];
    issue.state = state;
    issue
  }

  #[test]
  fn test_filter_sorts_by_number_descending() {
    let issues = vec![sample_issue(2), sample_issue(9), sample_issue(5)];
    let numbers: Vec<u64> = IssueFilter::default()
      .apply(issues)
      .iter()
      .map(|i| i.number)
      .collect();
    assert_eq!(numbers, vec![9, 5, 2]);
  }

  #[test]
  fn test_filter_by_state_label_and_limit() {
    let issues = vec![
      labelled(1, "bug", ItemState::Open),
      labelled(2, "bug", ItemState::Closed),
      labelled(3, "Bug", ItemState::Open),
      labelled(4, "docs", ItemState::Open),
    ];
    let filter = IssueFilter {
      state: Some(ItemState::Open),
      label: Some("bug".to_string()),
      limit: Some(1),
      ..IssueFilter::default()
    };
    let result = filter.apply(issues);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].number, 3);
  }

  #[test]
  fn test_filter_by_milestone_title() {
    let mut in_milestone = sample_issue(1);
    in_milestone.milestone = Some(MilestoneRef {
      number: 1,
      title: "v1.0".to_string(),
      due_on: None,
    });
    let filter = IssueFilter {
      milestone: Some("V1.0".to_string()),
      ..IssueFilter::default()
    };
    assert!(filter.matches(&in_milestone));
    assert!(!filter.matches(&sample_issue(2)));
  }
}
