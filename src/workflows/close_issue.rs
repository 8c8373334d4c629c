use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{RemoteSource, ResourceCache};
use crate::engine::{BoxError, Operation, OperationContext, ValidationResult};
use crate::remote::{Issue, ItemState};

use super::{IssueWriter, WorkflowError};

/// Issue number from the context; accepts 12, "12" and "#12".
fn issue_number(ctx: &OperationContext) -> Option<u64> {
  match ctx.get_value("issue")? {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
    _ => None,
  }
}

/// `close-issue`: close an open issue with an optional comment.
///
/// Context: `issue` (number), optional `comment`.
pub struct CloseIssue<S: RemoteSource<Record = Issue>> {
  issues: ResourceCache<S>,
  writer: Arc<dyn IssueWriter>,
}

impl<S: RemoteSource<Record = Issue>> CloseIssue<S> {
  pub fn new(issues: ResourceCache<S>, writer: Arc<dyn IssueWriter>) -> Self {
    Self { issues, writer }
  }
}

#[async_trait]
impl<S: RemoteSource<Record = Issue>> Operation for CloseIssue<S> {
  fn name(&self) -> &str {
    "close-issue"
  }

  async fn precondition(&self, ctx: &OperationContext) -> ValidationResult {
    let Some(number) = issue_number(ctx) else {
      return ValidationResult::fail("an issue number is required");
    };

    match self.issues.get(&number.to_string()).await {
      Ok(hit) => ValidationResult::check(hit.data.is_open(), format!("issue #{} is already closed", number))
        .with_details(json!({ "issue": number, "source": hit.source })),
      Err(err) => ValidationResult::fail(format!("issue #{} is not available: {}", number, err)),
    }
  }

  async fn normalize(&self, ctx: &mut OperationContext) -> Result<(), BoxError> {
    let number = issue_number(ctx)
      .ok_or_else(|| WorkflowError::InvalidInput("issue must be a number".to_string()))?;
    ctx.set("issue", json!(number));

    let comment = ctx.get_str("comment").map(str::trim).unwrap_or_default().to_string();
    if comment.is_empty() {
      ctx.remove("comment");
    } else {
      ctx.set("comment", json!(comment));
    }
    Ok(())
  }

  async fn execute(&self, ctx: &OperationContext) -> Result<Value, BoxError> {
    let number = issue_number(ctx)
      .ok_or_else(|| WorkflowError::InvalidInput("issue must be a number".to_string()))?;
    let comment = ctx.get_str("comment");

    let closed = self
      .writer
      .close_issue(number, comment)
      .await
      .map_err(WorkflowError::from)?;
    info!(number, "issue closed");

    if let Some(removal) = self.issues.invalidate(&number.to_string()) {
      if let Err(err) = removal.await {
        warn!(number, error = %err, "durable invalidation task failed");
      }
    }

    Ok(serde_json::to_value(closed)?)
  }

  async fn postcondition(&self, result: &Value, _ctx: &OperationContext) -> ValidationResult {
    ValidationResult::check(
      result["state"] == json!(ItemState::Closed),
      "issue is still open after closing",
    )
  }
}
