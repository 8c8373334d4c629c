//! Remote sources feeding the resource caches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::{Cacheable, ListFilter, RemoteError, RemoteSource};

use super::client::GitHubClient;
use super::types::{Issue, Milestone, Release};

fn parse_key(kind: &str, key: &str) -> Result<u64, RemoteError> {
  key
    .trim()
    .trim_start_matches('#')
    .parse()
    .map_err(|_| RemoteError::permanent(format!("invalid {} key {:?}", kind, key)))
}

/// Keep records changed after `since`, for endpoints without a server-side filter.
fn changed_since<T: Cacheable>(records: Vec<T>, since: DateTime<Utc>) -> Vec<T> {
  records
    .into_iter()
    .filter(|record| record.updated_at().map_or(true, |at| at > since))
    .collect()
}

pub struct IssueSource {
  client: GitHubClient,
}

impl IssueSource {
  pub fn new(client: GitHubClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl RemoteSource for IssueSource {
  type Record = Issue;

  async fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>, RemoteError> {
    self.client.list_issues(filter).await
  }

  async fn get(&self, key: &str) -> Result<Issue, RemoteError> {
    self.client.get_issue(parse_key("issue", key)?).await
  }

  async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Issue>, RemoteError> {
    self.client.list_issues_since(since).await
  }

  async fn max_id(&self) -> Result<Option<u64>, RemoteError> {
    self.client.latest_issue_number().await
  }
}

pub struct MilestoneSource {
  client: GitHubClient,
}

impl MilestoneSource {
  pub fn new(client: GitHubClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl RemoteSource for MilestoneSource {
  type Record = Milestone;

  async fn list(&self, filter: &ListFilter) -> Result<Vec<Milestone>, RemoteError> {
    let state = filter.state.as_deref().unwrap_or("open");
    self.client.list_milestones(state).await
  }

  async fn get(&self, key: &str) -> Result<Milestone, RemoteError> {
    self.client.get_milestone(parse_key("milestone", key)?).await
  }

  async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Milestone>, RemoteError> {
    let all = self.client.list_milestones("all").await?;
    Ok(changed_since(all, since))
  }

  async fn max_id(&self) -> Result<Option<u64>, RemoteError> {
    // No sequential ids to gap-fill
    Ok(None)
  }
}

pub struct ReleaseSource {
  client: GitHubClient,
}

impl ReleaseSource {
  pub fn new(client: GitHubClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl RemoteSource for ReleaseSource {
  type Record = Release;

  async fn list(&self, _filter: &ListFilter) -> Result<Vec<Release>, RemoteError> {
    self.client.list_releases().await
  }

  async fn get(&self, key: &str) -> Result<Release, RemoteError> {
    self.client.get_release(parse_key("release", key)?).await
  }

  async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Release>, RemoteError> {
    let all = self.client.list_releases().await?;
    Ok(changed_since(all, since))
  }

  async fn max_id(&self) -> Result<Option<u64>, RemoteError> {
    Ok(None)
  }
}
