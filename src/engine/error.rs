use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Error type handlers and normalizers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pipeline stage an execution failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Precondition,
  Normalization,
  Execution,
  Postcondition,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
  #[error("{operation}: precondition failed: {message}")]
  PreconditionFailed {
    operation: String,
    message: String,
    details: Option<Value>,
  },

  #[error("{operation}: normalizer {normalizer} failed: {message}")]
  NormalizationFailed {
    operation: String,
    normalizer: String,
    message: String,
  },

  #[error("{operation}: execution failed: {message}")]
  ExecutionFailed { operation: String, message: String },

  #[error("{operation}: postcondition failed: {message}")]
  PostconditionFailed {
    operation: String,
    message: String,
    details: Option<Value>,
  },

  #[error("unknown operation: {operation}")]
  UnknownOperation { operation: String },
}

impl ExecutionError {
  pub fn stage(&self) -> Stage {
    match self {
      Self::PreconditionFailed { .. } => Stage::Precondition,
      Self::NormalizationFailed { .. } => Stage::Normalization,
      Self::ExecutionFailed { .. } | Self::UnknownOperation { .. } => Stage::Execution,
      Self::PostconditionFailed { .. } => Stage::Postcondition,
    }
  }

  pub fn operation(&self) -> &str {
    match self {
      Self::PreconditionFailed { operation, .. }
      | Self::NormalizationFailed { operation, .. }
      | Self::ExecutionFailed { operation, .. }
      | Self::PostconditionFailed { operation, .. }
      | Self::UnknownOperation { operation } => operation,
    }
  }

  /// Human-readable message without the operation prefix
  pub fn message(&self) -> String {
    match self {
      Self::PreconditionFailed { message, .. }
      | Self::NormalizationFailed { message, .. }
      | Self::ExecutionFailed { message, .. }
      | Self::PostconditionFailed { message, .. } => message.clone(),
      Self::UnknownOperation { operation } => format!("no handler registered for {}", operation),
    }
  }

  /// Stable machine-readable code
  pub fn code(&self) -> &'static str {
    match self {
      Self::PreconditionFailed { .. } => "PRECONDITION_FAILED",
      Self::NormalizationFailed { .. } => "NORMALIZATION_FAILED",
      Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
      Self::PostconditionFailed { .. } => "POSTCONDITION_FAILED",
      Self::UnknownOperation { .. } => "UNKNOWN_OPERATION",
    }
  }

  pub fn details(&self) -> Option<&Value> {
    match self {
      Self::PreconditionFailed { details, .. } | Self::PostconditionFailed { details, .. } => details.as_ref(),
      _ => None,
    }
  }

  pub fn report(&self) -> ErrorReport {
    ErrorReport {
      code: self.code(),
      stage: self.stage(),
      operation: self.operation().to_string(),
      message: self.message(),
      details: self.details().cloned(),
    }
  }
}

/// Structured form of an `ExecutionError`, as emitted and printed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
  pub code: &'static str,
  pub stage: Stage,
  pub operation: String,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<Value>,
}
