use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;

use crate::cache::{RemoteSource, ResourceCache};
use crate::engine::{BoxError, Operation, OperationContext, ValidationResult};
use crate::remote::{Issue, ItemState};

const PRIORITIES: [&str; 4] = ["critical", "high", "medium", "low"];

/// Rank from a `priority:<level>` label; unlabelled issues sort last.
pub(crate) fn priority_rank(issue: &Issue) -> usize {
  issue
    .labels
    .iter()
    .filter_map(|label| {
      let level = label.to_ascii_lowercase();
      let level = level.strip_prefix("priority:")?.trim().to_string();
      PRIORITIES.iter().position(|p| *p == level)
    })
    .min()
    .unwrap_or(PRIORITIES.len())
}

fn due_on(issue: &Issue) -> Option<DateTime<Utc>> {
  issue.milestone.as_ref().and_then(|m| m.due_on)
}

/// Priority, then earliest milestone due date (undated last), then lowest number.
pub(crate) fn compare(a: &Issue, b: &Issue) -> Ordering {
  priority_rank(a)
    .cmp(&priority_rank(b))
    .then_with(|| match (due_on(a), due_on(b)) {
      (Some(x), Some(y)) => x.cmp(&y),
      (Some(_), None) => Ordering::Less,
      (None, Some(_)) => Ordering::Greater,
      (None, None) => Ordering::Equal,
    })
    .then_with(|| a.number.cmp(&b.number))
}

/// `next-item`: recommend the open issue to work on next.
///
/// Context: optional `label` to restrict candidates.
pub struct NextItem<S: RemoteSource<Record = Issue>> {
  issues: ResourceCache<S>,
}

impl<S: RemoteSource<Record = Issue>> NextItem<S> {
  pub fn new(issues: ResourceCache<S>) -> Self {
    Self { issues }
  }
}

#[async_trait]
impl<S: RemoteSource<Record = Issue>> Operation for NextItem<S> {
  fn name(&self) -> &str {
    "next-item"
  }

  async fn precondition(&self, _ctx: &OperationContext) -> ValidationResult {
    match self.issues.snapshot() {
      Ok(issues) => ValidationResult::check(
        issues.iter().any(Issue::is_open),
        "no open issues mirrored; run sync first",
      ),
      Err(err) => ValidationResult::fail(format!("cannot read issue mirror: {}", err)),
    }
  }

  async fn execute(&self, ctx: &OperationContext) -> Result<Value, BoxError> {
    let label = ctx.get_str("label");
    let mut candidates: Vec<Issue> = self
      .issues
      .all()
      .await?
      .data
      .into_iter()
      .filter(|i| i.is_open() && label.map_or(true, |l| i.has_label(l)))
      .collect();
    candidates.sort_by(compare);

    let Some(next) = candidates.first() else {
      return Err(match label {
        Some(l) => format!("no open issues labelled {}", l).into(),
        None => "no open issues".into(),
      });
    };

    let priority = PRIORITIES.get(priority_rank(next)).copied();
    Ok(json!({
      "number": next.number,
      "title": next.title,
      "state": next.state,
      "url": next.url,
      "priority": priority,
      "milestone": next.milestone.as_ref().map(|m| &m.title),
      "due_on": due_on(next),
      "candidates": candidates.len(),
    }))
  }

  async fn postcondition(&self, result: &Value, _ctx: &OperationContext) -> ValidationResult {
    ValidationResult::check(
      result["state"] == json!(ItemState::Open),
      "recommended issue is not open",
    )
    .with_details(result["number"].clone())
  }
}
