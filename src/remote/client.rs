use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use url::Url;

use crate::cache::{ListFilter, RemoteError};
use crate::config::GitHubConfig;

use super::api_types::{ApiIssue, ApiMilestone, ApiRateLimitResponse, ApiRelease};
use super::retry::RetryPolicy;
use super::types::{Issue, Milestone, NewIssue, Release};

const PER_PAGE: usize = 100;
const API_VERSION: &str = "2022-11-28";

/// Last rate limit budget reported by the API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimit {
  pub remaining: Option<u64>,
  pub reset_at: Option<DateTime<Utc>>,
}

/// GitHub REST client scoped to one repository
#[derive(Clone)]
pub struct GitHubClient {
  http: reqwest::Client,
  base: Url,
  owner: String,
  repo: String,
  token: Option<String>,
  retry: RetryPolicy,
  rate_limit: Arc<Mutex<RateLimit>>,
  rate_limit_buffer: u64,
}

impl GitHubClient {
  pub fn new(config: &GitHubConfig, token: Option<String>, retry: RetryPolicy) -> Result<Self, RemoteError> {
    let mut base = Url::parse(&config.api_url)
      .map_err(|e| RemoteError::permanent(format!("invalid API url {}: {}", config.api_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
    headers.insert(USER_AGENT, HeaderValue::from_static("gh-mirror"));

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(std::time::Duration::from_secs(30))
      .build()
      .map_err(|e| RemoteError::permanent(format!("failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base,
      owner: config.owner.clone(),
      repo: config.repo.clone(),
      token,
      retry,
      rate_limit: Arc::new(Mutex::new(RateLimit::default())),
      rate_limit_buffer: config.rate_limit_buffer,
    })
  }

  /// "owner/repo"
  pub fn repository(&self) -> String {
    format!("{}/{}", self.owner, self.repo)
  }

  /// Budget as of the last response, without a request.
  pub fn last_rate_limit(&self) -> RateLimit {
    *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // ==========================================================================
  // Issues
  // ==========================================================================

  /// List issues (pull requests excluded)
  pub async fn list_issues(&self, filter: &ListFilter) -> Result<Vec<Issue>, RemoteError> {
    let mut query = vec![("state", filter.state.clone().unwrap_or_else(|| "open".to_string()))];
    if let Some(label) = &filter.label {
      query.push(("labels", label.clone()));
    }
    if let Some(milestone) = &filter.milestone {
      query.push(("milestone", milestone.clone()));
    }

    let path = self.repo_path("issues");
    let issues: Vec<ApiIssue> = self.get_paginated(&path, &query).await?;
    Ok(into_issues(issues))
  }

  pub async fn get_issue(&self, number: u64) -> Result<Issue, RemoteError> {
    let path = self.repo_path(&format!("issues/{}", number));
    let issue: ApiIssue = self.request(Method::GET, &path, &[], None).await?;
    if issue.is_pull_request() {
      return Err(RemoteError::not_found(format!("issue #{} (is a pull request)", number)));
    }
    Ok(issue.into_issue())
  }

  /// Issues of any state updated after `since`
  pub async fn list_issues_since(&self, since: DateTime<Utc>) -> Result<Vec<Issue>, RemoteError> {
    let query = vec![
      ("state", "all".to_string()),
      ("sort", "updated".to_string()),
      ("direction", "desc".to_string()),
      ("since", since.to_rfc3339()),
    ];
    let path = self.repo_path("issues");
    let issues: Vec<ApiIssue> = self.get_paginated(&path, &query).await?;
    Ok(into_issues(issues))
  }

  /// Highest issue number ever created; pull requests share the sequence.
  pub async fn latest_issue_number(&self) -> Result<Option<u64>, RemoteError> {
    let query = [
      ("state", "all".to_string()),
      ("sort", "created".to_string()),
      ("direction", "desc".to_string()),
      ("per_page", "1".to_string()),
    ];
    let path = self.repo_path("issues");
    let newest: Vec<ApiIssue> = self.request(Method::GET, &path, &query, None).await?;
    Ok(newest.first().map(|issue| issue.number))
  }

  pub async fn create_issue(&self, new_issue: &NewIssue) -> Result<Issue, RemoteError> {
    let body = serde_json::to_value(new_issue)
      .map_err(|e| RemoteError::permanent(format!("failed to encode issue: {}", e)))?;
    let path = self.repo_path("issues");
    let created: ApiIssue = self.request(Method::POST, &path, &[], Some(body)).await?;
    info!(number = created.number, "created issue");
    Ok(created.into_issue())
  }

  /// Close an issue, commenting first when a comment is given
  pub async fn close_issue(&self, number: u64, comment: Option<&str>) -> Result<Issue, RemoteError> {
    if let Some(comment) = comment {
      self.add_comment(number, comment).await?;
    }

    let path = self.repo_path(&format!("issues/{}", number));
    let body = serde_json::json!({ "state": "closed" });
    let closed: ApiIssue = self.request(Method::PATCH, &path, &[], Some(body)).await?;
    info!(number, "closed issue");
    Ok(closed.into_issue())
  }

  pub async fn add_comment(&self, number: u64, body: &str) -> Result<(), RemoteError> {
    let path = self.repo_path(&format!("issues/{}/comments", number));
    let payload = serde_json::json!({ "body": body });
    let _: Value = self.request(Method::POST, &path, &[], Some(payload)).await?;
    Ok(())
  }

  // ==========================================================================
  // Milestones and releases
  // ==========================================================================

  pub async fn list_milestones(&self, state: &str) -> Result<Vec<Milestone>, RemoteError> {
    let query = vec![("state", state.to_string())];
    let path = self.repo_path("milestones");
    let milestones: Vec<ApiMilestone> = self.get_paginated(&path, &query).await?;
    Ok(milestones.into_iter().map(Milestone::from).collect())
  }

  pub async fn get_milestone(&self, number: u64) -> Result<Milestone, RemoteError> {
    let path = self.repo_path(&format!("milestones/{}", number));
    let milestone: ApiMilestone = self.request(Method::GET, &path, &[], None).await?;
    Ok(milestone.into())
  }

  pub async fn list_releases(&self) -> Result<Vec<Release>, RemoteError> {
    let path = self.repo_path("releases");
    let releases: Vec<ApiRelease> = self.get_paginated(&path, &[]).await?;
    Ok(releases.into_iter().map(Release::from).collect())
  }

  pub async fn get_release(&self, id: u64) -> Result<Release, RemoteError> {
    let path = self.repo_path(&format!("releases/{}", id));
    let release: ApiRelease = self.request(Method::GET, &path, &[], None).await?;
    Ok(release.into())
  }

  /// Query the rate limit endpoint, which does not count against the budget
  pub async fn rate_limit(&self) -> Result<RateLimit, RemoteError> {
    let response: ApiRateLimitResponse = self.request(Method::GET, "rate_limit", &[], None).await?;
    let reset_at = Utc.timestamp_opt(response.rate.reset, 0).single();
    debug!(limit = response.rate.limit, remaining = response.rate.remaining, "fetched rate limit");
    Ok(RateLimit {
      remaining: Some(response.rate.remaining),
      reset_at,
    })
  }

  // ==========================================================================
  // Transport
  // ==========================================================================

  fn repo_path(&self, rest: &str) -> String {
    format!("repos/{}/{}/{}", self.owner, self.repo, rest)
  }

  fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url, RemoteError> {
    let mut url = self
      .base
      .join(path)
      .map_err(|e| RemoteError::permanent(format!("invalid endpoint {}: {}", path, e)))?;
    if !query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (key, value) in query {
        pairs.append_pair(key, value);
      }
    }
    Ok(url)
  }

  /// Follow `page` until a short page comes back
  async fn get_paginated<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, String)],
  ) -> Result<Vec<T>, RemoteError> {
    let mut all = Vec::new();
    let mut page = 1u32;

    loop {
      let mut paged = query.to_vec();
      paged.push(("per_page", PER_PAGE.to_string()));
      paged.push(("page", page.to_string()));

      let batch: Vec<T> = self.request(Method::GET, path, &paged, None).await?;
      let count = batch.len();
      all.extend(batch);

      if count < PER_PAGE {
        break;
      }
      page += 1;
    }

    debug!(path, pages = page, records = all.len(), "fetched paginated collection");
    Ok(all)
  }

  async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    query: &[(&str, String)],
    body: Option<Value>,
  ) -> Result<T, RemoteError> {
    let url = self.endpoint(path, query)?;
    let what = format!("{} {}", method, url.path());
    self
      .retry
      .run(&what, || self.send_once(method.clone(), url.clone(), body.clone()))
      .await
  }

  async fn send_once<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Url,
    body: Option<Value>,
  ) -> Result<T, RemoteError> {
    self.wait_for_budget().await;

    let mut request = self.http.request(method, url);
    if let Some(token) = &self.token {
      request = request.header(AUTHORIZATION, format!("token {}", token));
    }
    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| RemoteError::transient(format!("request failed: {}", e)))?;

    let status = response.status();
    let headers = response.headers().clone();
    self.record_rate_limit(&headers);

    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &headers, &text));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| RemoteError::permanent(format!("failed to decode response: {}", e)))
  }

  fn record_rate_limit(&self, headers: &HeaderMap) {
    let remaining = header_u64(headers, "x-ratelimit-remaining");
    let reset_at = header_reset(headers);
    if remaining.is_none() && reset_at.is_none() {
      return;
    }
    let mut limit = self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner);
    limit.remaining = remaining.or(limit.remaining);
    limit.reset_at = reset_at.or(limit.reset_at);
  }

  /// Sleep until the reset when the remaining budget is inside the reserve.
  async fn wait_for_budget(&self) {
    let wait = {
      let limit = self.last_rate_limit();
      match (limit.remaining, limit.reset_at) {
        (Some(remaining), Some(reset_at)) if remaining <= self.rate_limit_buffer => {
          (reset_at - Utc::now()).to_std().ok()
        }
        _ => None,
      }
    };

    if let Some(wait) = wait {
      let wait = wait.min(self.retry.rate_limit_wait_cap);
      info!(wait_secs = wait.as_secs(), "rate limit budget low, waiting for reset");
      tokio::time::sleep(wait).await;
    }
  }
}

fn into_issues(issues: Vec<ApiIssue>) -> Vec<Issue> {
  issues
    .into_iter()
    .filter(|issue| !issue.is_pull_request())
    .map(ApiIssue::into_issue)
    .collect()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
  headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
  let secs = i64::try_from(header_u64(headers, "x-ratelimit-reset")?).ok()?;
  Utc.timestamp_opt(secs, 0).single()
}

/// Map a non-success response onto the remote error taxonomy.
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> RemoteError {
  let budget_exhausted = header_u64(headers, "x-ratelimit-remaining") == Some(0);
  let retry_after = header_u64(headers, "retry-after");

  match status {
    StatusCode::NOT_FOUND => RemoteError::not_found(body_message(body).unwrap_or_else(|| "resource".to_string())),
    StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
      reset_at: rate_limit_reset(headers, retry_after),
    },
    StatusCode::FORBIDDEN if budget_exhausted || retry_after.is_some() => RemoteError::RateLimited {
      reset_at: rate_limit_reset(headers, retry_after),
    },
    s if s.is_server_error() => RemoteError::transient(format!("{}: {}", s, body_message(body).unwrap_or_default())),
    s => RemoteError::permanent(format!("{}: {}", s, body_message(body).unwrap_or_default())),
  }
}

fn rate_limit_reset(headers: &HeaderMap, retry_after: Option<u64>) -> DateTime<Utc> {
  if let Some(secs) = retry_after {
    return Utc::now() + ChronoDuration::seconds(i64::try_from(secs).unwrap_or(60));
  }
  header_reset(headers).unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(60))
}

/// GitHub error bodies look like `{"message": "..."}`
fn body_message(body: &str) -> Option<String> {
  let value: Value = serde_json::from_str(body).ok()?;
  value.get("message")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    map
  }

  fn client(api_url: &str) -> GitHubClient {
    let config = GitHubConfig {
      owner: "acme".to_string(),
      repo: "widgets".to_string(),
      api_url: api_url.to_string(),
      rate_limit_buffer: 100,
    };
    GitHubClient::new(&config, None, RetryPolicy::none()).unwrap()
  }

  #[test]
  fn test_not_found_is_permanent() {
    let err = classify_status(StatusCode::NOT_FOUND, &HeaderMap::new(), r#"{"message":"Not Found"}"#);
    assert!(err.is_not_found());
    assert!(!err.is_transient());
  }

  #[test]
  fn test_server_errors_are_transient() {
    let err = classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "");
    assert!(err.is_transient());
  }

  #[test]
  fn test_exhausted_budget_is_rate_limited() {
    let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1893456000")]);
    let err = classify_status(StatusCode::FORBIDDEN, &h, r#"{"message":"API rate limit exceeded"}"#);
    let expected = Utc.timestamp_opt(1_893_456_000, 0).single().unwrap();
    assert_eq!(err, RemoteError::RateLimited { reset_at: expected });
  }

  #[test]
  fn test_plain_forbidden_is_permanent() {
    let h = headers(&[("x-ratelimit-remaining", "4000")]);
    let err = classify_status(StatusCode::FORBIDDEN, &h, r#"{"message":"Resource not accessible"}"#);
    assert!(matches!(err, RemoteError::Permanent { ref message } if message.contains("Resource not accessible")));
  }

  #[test]
  fn test_endpoint_joins_base_with_path_prefix() {
    let c = client("https://ghe.example.com/api/v3");
    let url = c
      .endpoint(&c.repo_path("issues"), &[("state", "all".to_string())])
      .unwrap();
    assert_eq!(url.as_str(), "https://ghe.example.com/api/v3/repos/acme/widgets/issues?state=all");
  }

  #[test]
  fn test_rate_limit_headers_are_recorded() {
    let c = client("https://api.github.com");
    c.record_rate_limit(&headers(&[("x-ratelimit-remaining", "42"), ("x-ratelimit-reset", "1893456000")]));
    let limit = c.last_rate_limit();
    assert_eq!(limit.remaining, Some(42));
    assert!(limit.reset_at.is_some());

    // Responses without rate limit headers keep the last known budget
    c.record_rate_limit(&HeaderMap::new());
    assert_eq!(c.last_rate_limit().remaining, Some(42));
  }
}
