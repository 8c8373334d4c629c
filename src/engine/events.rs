//! Success/failure events emitted once per execution.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::error::ErrorReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
  Success { result: Value },
  Failure { error: ErrorReport },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
  pub operation: String,
  #[serde(flatten)]
  pub outcome: EventOutcome,
  pub duration_ms: u64,
  pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
  pub fn is_success(&self) -> bool {
    matches!(self.outcome, EventOutcome::Success { .. })
  }
}

/// Receiver of execution events. Must not block.
pub trait EventSink: Send + Sync {
  fn emit(&self, event: ExecutionEvent);
}

/// Default sink; drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
  fn emit(&self, _event: ExecutionEvent) {}
}

/// Audit sink that logs each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
  fn emit(&self, event: ExecutionEvent) {
    match &event.outcome {
      EventOutcome::Success { .. } => info!(
        operation = %event.operation,
        duration_ms = event.duration_ms,
        "operation succeeded"
      ),
      EventOutcome::Failure { error } => warn!(
        operation = %event.operation,
        duration_ms = event.duration_ms,
        code = error.code,
        message = %error.message,
        "operation failed"
      ),
    }
  }
}

/// Forwards events into an unbounded channel
pub struct ChannelSink {
  tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
  pub fn new() -> (Self, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, EventStream { rx })
  }
}

impl EventSink for ChannelSink {
  fn emit(&self, event: ExecutionEvent) {
    // Receiver gone means nobody is listening any more
    let _ = self.tx.send(event);
  }
}

/// Receiving half of a `ChannelSink`
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl EventStream {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<ExecutionEvent> {
    self.rx.recv().await
  }

  /// Next event if one is already queued
  pub fn try_next(&mut self) -> Option<ExecutionEvent> {
    self.rx.try_recv().ok()
  }
}
