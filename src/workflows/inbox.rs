use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{RemoteSource, ResourceCache};
use crate::engine::{BoxError, Operation, OperationContext, ValidationResult};
use crate::remote::{Issue, NewIssue};

use super::{IssueWriter, WorkflowError, Workspace};

const MARKER_PREFIX: &str = "<!-- gh-mirror:fingerprint=";
const MARKER_SUFFIX: &str = " -->";

/// SHA-256 of the trimmed item content, hex encoded.
pub fn fingerprint(content: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(content.trim().as_bytes());
  hex::encode(hasher.finalize())
}

fn marker(fingerprint: &str) -> String {
  format!("{}{}{}", MARKER_PREFIX, fingerprint, MARKER_SUFFIX)
}

/// Fingerprint embedded in an issue body, if any.
fn embedded_fingerprint(body: &str) -> Option<&str> {
  let start = body.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
  let rest = &body[start..];
  let end = rest.find(MARKER_SUFFIX)?;
  Some(rest[..end].trim())
}

/// A markdown file waiting in the inbox
#[derive(Debug, Clone, PartialEq)]
struct InboxItem {
  path: PathBuf,
  title: String,
  body: String,
  fingerprint: String,
}

impl InboxItem {
  fn parse(path: &Path, content: &str) -> Self {
    let mut lines = content.lines();
    let mut title = None;
    let mut body_lines = Vec::new();

    for line in lines.by_ref() {
      let trimmed = line.trim();
      if trimmed.is_empty() {
        continue;
      }
      title = Some(trimmed.trim_start_matches('#').trim().to_string());
      break;
    }
    body_lines.extend(lines);

    let title = title.filter(|t| !t.is_empty()).unwrap_or_else(|| {
      path
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
        .unwrap_or_else(|| "Untitled".to_string())
    });

    Self {
      path: path.to_path_buf(),
      title,
      body: body_lines.join("\n").trim().to_string(),
      fingerprint: fingerprint(content),
    }
  }

  fn into_new_issue(self) -> NewIssue {
    let body = if self.body.is_empty() {
      marker(&self.fingerprint)
    } else {
      format!("{}\n\n{}", self.body, marker(&self.fingerprint))
    };
    NewIssue {
      title: self.title,
      body: Some(body),
      labels: Vec::new(),
    }
  }
}

fn is_markdown(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("md") || ext.eq_ignore_ascii_case("markdown"))
}

/// Markdown files in `dir`, sorted by name; a missing directory is empty.
fn pending_items(dir: &Path) -> Result<Vec<PathBuf>, WorkflowError> {
  let entries = match std::fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(err) => return Err(WorkflowError::io(dir, err)),
  };

  let mut paths = Vec::new();
  for entry in entries {
    let path = entry.map_err(|e| WorkflowError::io(dir, e))?.path();
    if is_markdown(&path) {
      paths.push(path);
    }
  }
  paths.sort();
  Ok(paths)
}

/// Move `path` into `outbox`, suffixing the name when it is taken.
fn move_to_outbox(path: &Path, outbox: &Path) -> Result<PathBuf, WorkflowError> {
  let name = path
    .file_name()
    .ok_or_else(|| WorkflowError::InvalidInput(format!("{} has no file name", path.display())))?;
  let mut target = outbox.join(name);

  let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
  let ext = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
  let mut n = 1;
  while target.exists() {
    target = outbox.join(format!("{}-{}.{}", stem, n, ext));
    n += 1;
  }

  std::fs::rename(path, &target).map_err(|e| WorkflowError::io(path, e))?;
  Ok(target)
}

#[derive(Debug, Default, Serialize)]
struct IngestReport {
  created: Vec<Value>,
  duplicates: Vec<Value>,
  failed: Vec<Value>,
  /// Inbox files that were handled and moved
  processed: Vec<String>,
}

/// `ingest-inbox`: turn markdown files in the inbox into issues.
///
/// Each file's fingerprint is embedded in the issue body so re-ingesting the
/// same content is detected against the mirror.
pub struct IngestInbox<S: RemoteSource<Record = Issue>> {
  issues: ResourceCache<S>,
  writer: Arc<dyn IssueWriter>,
  workspace: Workspace,
}

impl<S: RemoteSource<Record = Issue>> IngestInbox<S> {
  pub fn new(issues: ResourceCache<S>, writer: Arc<dyn IssueWriter>, workspace: Workspace) -> Self {
    Self {
      issues,
      writer,
      workspace,
    }
  }

  fn known_fingerprints(&self) -> HashSet<String> {
    match self.issues.snapshot() {
      Ok(issues) => issues
        .iter()
        .filter_map(|issue| issue.body.as_deref().and_then(embedded_fingerprint))
        .map(str::to_string)
        .collect(),
      Err(err) => {
        warn!(error = %err, "cannot read issue mirror, ingesting without dedup");
        HashSet::new()
      }
    }
  }
}

#[async_trait]
impl<S: RemoteSource<Record = Issue>> Operation for IngestInbox<S> {
  fn name(&self) -> &str {
    "ingest-inbox"
  }

  async fn precondition(&self, _ctx: &OperationContext) -> ValidationResult {
    match pending_items(&self.workspace.inbox) {
      Ok(items) => ValidationResult::check(!items.is_empty(), "inbox has no markdown items")
        .with_details(json!({ "inbox": self.workspace.inbox.display().to_string() })),
      Err(err) => ValidationResult::fail(err.to_string()),
    }
  }

  async fn execute(&self, _ctx: &OperationContext) -> Result<Value, BoxError> {
    let mut known = self.known_fingerprints();
    let mut report = IngestReport::default();

    for path in pending_items(&self.workspace.inbox)? {
      let file = path.display().to_string();
      let content = std::fs::read_to_string(&path).map_err(|e| WorkflowError::io(&path, e))?;
      let item = InboxItem::parse(&path, &content);

      if known.contains(&item.fingerprint) {
        info!(file = %file, "inbox item already ingested");
        move_to_outbox(&path, &self.workspace.outbox)?;
        report.duplicates.push(json!({ "file": file, "fingerprint": item.fingerprint }));
        report.processed.push(file);
        continue;
      }

      let fingerprint = item.fingerprint.clone();
      match self.writer.create_issue(&item.into_new_issue()).await {
        Ok(issue) => {
          info!(file = %file, number = issue.number, "created issue from inbox item");
          known.insert(fingerprint);
          move_to_outbox(&path, &self.workspace.outbox)?;
          report.created.push(json!({ "file": file, "number": issue.number, "title": issue.title }));
          report.processed.push(file);
        }
        Err(err) => {
          warn!(file = %file, error = %err, "failed to create issue, leaving item in inbox");
          report.failed.push(json!({ "file": file, "error": err.to_string() }));
        }
      }
    }

    Ok(serde_json::to_value(report)?)
  }

  async fn postcondition(&self, result: &Value, _ctx: &OperationContext) -> ValidationResult {
    let leftover: Vec<&str> = result["processed"]
      .as_array()
      .map(|files| files.iter().filter_map(Value::as_str).filter(|f| Path::new(f).exists()).collect())
      .unwrap_or_default();

    ValidationResult::check(leftover.is_empty(), "processed items remain in the inbox")
      .with_details(json!({ "files": leftover }))
  }
}
