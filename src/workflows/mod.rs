//! Issue-tracking workflows built on the engine and the issue cache.

mod close_issue;
mod inbox;
mod next_item;
mod session;

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheError, RemoteError, RemoteSource, ResourceCache};
use crate::config::WorkspaceConfig;
use crate::engine::{BoxError, Engine, Normalizer, OperationContext};
use crate::remote::{GitHubClient, Issue, NewIssue};

pub use close_issue::CloseIssue;
pub use inbox::{fingerprint, IngestInbox};
pub use next_item::NextItem;
pub use session::SessionStart;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("{path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid input: {0}")]
  InvalidInput(String),
}

impl WorkflowError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Local directories the workflows read and write
#[derive(Debug, Clone)]
pub struct Workspace {
  pub root: PathBuf,
  pub inbox: PathBuf,
  pub outbox: PathBuf,
}

impl Workspace {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      inbox: root.join("inbox"),
      outbox: root.join("outbox"),
      root,
    }
  }

  pub fn from_config(config: &WorkspaceConfig) -> Self {
    Self {
      root: config.root.clone(),
      inbox: config.root.join(&config.inbox),
      outbox: config.root.join(&config.outbox),
    }
  }

  pub fn ensure(&self) -> Result<(), WorkflowError> {
    for dir in [&self.inbox, &self.outbox] {
      std::fs::create_dir_all(dir).map_err(|e| WorkflowError::io(dir, e))?;
    }
    Ok(())
  }
}

/// Remote writes the workflows need
#[async_trait]
pub trait IssueWriter: Send + Sync {
  async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, RemoteError>;

  async fn close_issue(&self, number: u64, comment: Option<&str>) -> Result<Issue, RemoteError>;
}

#[async_trait]
impl IssueWriter for GitHubClient {
  async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, RemoteError> {
    GitHubClient::create_issue(self, issue).await
  }

  async fn close_issue(&self, number: u64, comment: Option<&str>) -> Result<Issue, RemoteError> {
    GitHubClient::close_issue(self, number, comment).await
  }
}

/// Global normalizer: makes sure the workspace directories exist and records
/// their paths in the context.
pub struct EnsureDirectories {
  workspace: Workspace,
}

impl EnsureDirectories {
  pub fn new(workspace: Workspace) -> Self {
    Self { workspace }
  }
}

#[async_trait]
impl Normalizer for EnsureDirectories {
  async fn normalize(&self, ctx: &mut OperationContext) -> Result<(), BoxError> {
    self.workspace.ensure()?;
    ctx.set(
      "workspace",
      json!({
        "inbox": self.workspace.inbox.display().to_string(),
        "outbox": self.workspace.outbox.display().to_string(),
      }),
    );
    Ok(())
  }
}

/// Register every workflow operation on `engine`.
pub fn register_all<S>(engine: &Engine, issues: ResourceCache<S>, writer: Arc<dyn IssueWriter>, workspace: Workspace)
where
  S: RemoteSource<Record = Issue>,
{
  engine.register_normalizer_with("ensure-directories", Arc::new(EnsureDirectories::new(workspace.clone())));
  engine.install(Arc::new(SessionStart::new(issues.clone())));
  engine.install(Arc::new(NextItem::new(issues.clone())));
  engine.install(Arc::new(CloseIssue::new(issues.clone(), Arc::clone(&writer))));
  engine.install(Arc::new(IngestInbox::new(issues, writer, workspace)));
}


#[cfg(test)]
mod tests {
  use super::testing::{issue_cache, RecordingWriter};
  use super::*;
  use crate::cache::mock::MockSource;

  #[tokio::test]
  async fn test_register_all_installs_workflows_and_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(dir.path());
    let (_mock, cache) = issue_cache(MockSource::with_issues(1..=2));

    let engine = Engine::new();
    register_all(&engine, cache, Arc::new(RecordingWriter::default()), workspace.clone());
    assert_eq!(
      engine.operations(),
      vec!["close-issue", "ingest-inbox", "next-item", "session-start"]
    );

    let outcome = engine.execute("session-start", OperationContext::new()).await.unwrap();
    assert!(workspace.inbox.is_dir());
    assert!(workspace.outbox.is_dir());
    assert_eq!(
      outcome.context.get_value("workspace").unwrap()["inbox"],
      workspace.inbox.display().to_string()
    );
  }
}
