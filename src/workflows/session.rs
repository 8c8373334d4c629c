use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::cache::{RemoteSource, ResourceCache, SyncOptions, SyncType};
use crate::engine::{BoxError, Operation, OperationContext, ValidationResult};
use crate::remote::Issue;

/// `session-start`: bring the issue mirror up to date and summarize it.
///
/// Context: optional `force` (bool) for a full sync.
pub struct SessionStart<S: RemoteSource<Record = Issue>> {
  issues: ResourceCache<S>,
}

impl<S: RemoteSource<Record = Issue>> SessionStart<S> {
  pub fn new(issues: ResourceCache<S>) -> Self {
    Self { issues }
  }
}

#[async_trait]
impl<S: RemoteSource<Record = Issue>> Operation for SessionStart<S> {
  fn name(&self) -> &str {
    "session-start"
  }

  async fn execute(&self, ctx: &OperationContext) -> Result<Value, BoxError> {
    let opts = SyncOptions {
      force: ctx.get::<bool>("force").unwrap_or(false),
    };

    let (sync, sync_error) = match self.issues.sync(opts).await {
      Ok(report) => (Some(report), None),
      Err(err) => {
        warn!(error = %err, "session sync failed, continuing with mirrored issues");
        (None, Some(err.to_string()))
      }
    };

    let issues = self.issues.snapshot()?;
    if issues.is_empty() {
      if let Some(err) = sync_error {
        return Err(err.into());
      }
    }

    let open = issues.iter().filter(|i| i.is_open()).count();
    let status = self.issues.status()?;

    Ok(json!({
      "sync": sync,
      "sync_error": sync_error,
      "open_issues": open,
      "closed_issues": issues.len() - open,
      "total_issues": issues.len(),
      "last_sync": status.last_sync,
      "stale": status.stale,
    }))
  }

  async fn postcondition(&self, result: &Value, _ctx: &OperationContext) -> ValidationResult {
    let skipped = result["sync"]["sync_type"] == json!(SyncType::SkippedInProgress);
    let empty = result["total_issues"].as_u64().unwrap_or(0) == 0;
    ValidationResult::check(
      !(skipped && empty),
      "another sync is running and nothing is mirrored yet",
    )
  }
}
