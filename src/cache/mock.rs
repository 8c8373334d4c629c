//! In-process remote source for cache tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::freshness::now;
use super::source::{ListFilter, RemoteError, RemoteSource};
use crate::remote::{Issue, ItemState};

pub(crate) fn sample_issue(number: u64) -> Issue {
  let at = now() - Duration::minutes(1);
  Issue {
    number,
    title: format!("Issue {}", number),
    state: ItemState::Open,
    labels: Vec::new(),
    milestone: None,
    created_at: at,
    updated_at: at,
    body: None,
    author: Some("octocat".to_string()),
    assignees: Vec::new(),
    url: format!("https://github.com/acme/widgets/issues/{}", number),
  }
}

#[derive(Default)]
pub(crate) struct MockSource {
  issues: Mutex<BTreeMap<u64, Issue>>,
  hidden_from_delta: Mutex<HashSet<u64>>,
  flaky: Mutex<HashSet<u64>>,
  latest_number: Mutex<Option<u64>>,
  failing: AtomicBool,
  failing_delta: AtomicBool,
  delay: Option<std::time::Duration>,
  list_calls: AtomicUsize,
  get_calls: AtomicUsize,
  since_calls: AtomicUsize,
  max_id_calls: AtomicUsize,
}

impl MockSource {
  pub(crate) fn with_issues(numbers: impl IntoIterator<Item = u64>) -> Self {
    let source = Self::default();
    for number in numbers {
      source.insert(sample_issue(number));
    }
    source
  }

  pub(crate) fn with_delay(mut self, delay: std::time::Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub(crate) fn insert(&self, issue: Issue) {
    self.issues.lock().unwrap().insert(issue.number, issue);
  }

  /// Make `number` invisible to `list_since`, as if the delta query missed it.
  pub(crate) fn hide_from_delta(&self, number: u64) {
    self.hidden_from_delta.lock().unwrap().insert(number);
  }

  /// The next `get` of `number` fails with a transient error.
  pub(crate) fn fail_get_once(&self, number: u64) {
    self.flaky.lock().unwrap().insert(number);
  }

  /// Report `number` as the latest id even if no issue carries it, the way
  /// pull requests consume issue numbers.
  pub(crate) fn set_latest_number(&self, number: u64) {
    *self.latest_number.lock().unwrap() = Some(number);
  }

  pub(crate) fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  pub(crate) fn fail_delta(&self, failing: bool) {
    self.failing_delta.store(failing, Ordering::SeqCst);
  }

  pub(crate) fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub(crate) fn get_calls(&self) -> usize {
    self.get_calls.load(Ordering::SeqCst)
  }

  pub(crate) fn since_calls(&self) -> usize {
    self.since_calls.load(Ordering::SeqCst)
  }

  pub(crate) fn total_calls(&self) -> usize {
    self.list_calls() + self.get_calls() + self.since_calls() + self.max_id_calls.load(Ordering::SeqCst)
  }

  async fn enter(&self, counter: &AtomicUsize) -> Result<(), RemoteError> {
    counter.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.failing.load(Ordering::SeqCst) {
      return Err(RemoteError::transient("connection refused"));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteSource for Arc<MockSource> {
  type Record = Issue;

  async fn list(&self, _filter: &ListFilter) -> Result<Vec<Issue>, RemoteError> {
    self.enter(&self.list_calls).await?;
    Ok(self.issues.lock().unwrap().values().rev().cloned().collect())
  }

  async fn get(&self, key: &str) -> Result<Issue, RemoteError> {
    self.enter(&self.get_calls).await?;
    let number: u64 = key
      .parse()
      .map_err(|_| RemoteError::permanent(format!("bad issue key {}", key)))?;
    if self.flaky.lock().unwrap().remove(&number) {
      return Err(RemoteError::transient("502 Bad Gateway"));
    }
    self
      .issues
      .lock()
      .unwrap()
      .get(&number)
      .cloned()
      .ok_or_else(|| RemoteError::not_found(format!("issue #{}", number)))
  }

  async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Issue>, RemoteError> {
    self.enter(&self.since_calls).await?;
    if self.failing_delta.load(Ordering::SeqCst) {
      return Err(RemoteError::transient("delta endpoint timed out"));
    }
    let hidden = self.hidden_from_delta.lock().unwrap().clone();
    Ok(
      self
        .issues
        .lock()
        .unwrap()
        .values()
        .filter(|issue| issue.updated_at > since && !hidden.contains(&issue.number))
        .cloned()
        .collect(),
    )
  }

  async fn max_id(&self) -> Result<Option<u64>, RemoteError> {
    self.enter(&self.max_id_calls).await?;
    let highest = self.issues.lock().unwrap().keys().next_back().copied();
    let latest = *self.latest_number.lock().unwrap();
    Ok(highest.max(latest))
  }
}
