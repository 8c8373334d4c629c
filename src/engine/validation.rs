use serde::Serialize;
use serde_json::Value;

/// Outcome of a precondition or postcondition check.
///
/// Failures are plain values until the engine turns them into an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
  pub valid: bool,
  pub message: Option<String>,
  pub details: Option<Value>,
}

impl ValidationResult {
  pub fn pass() -> Self {
    Self {
      valid: true,
      message: None,
      details: None,
    }
  }

  pub fn fail(message: impl Into<String>) -> Self {
    Self {
      valid: false,
      message: Some(message.into()),
      details: None,
    }
  }

  pub fn with_details(mut self, details: Value) -> Self {
    self.details = Some(details);
    self
  }

  /// Pass when `condition` holds, otherwise fail with `message`.
  pub fn check(condition: bool, message: impl Into<String>) -> Self {
    if condition {
      Self::pass()
    } else {
      Self::fail(message)
    }
  }
}
