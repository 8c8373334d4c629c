use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::debug;

use super::context::OperationContext;
use super::error::{BoxError, ExecutionError};
use super::events::{EventOutcome, EventSink, ExecutionEvent, NoopSink};
use super::traits::{
  BundleHandler, BundleNormalizer, BundlePostcondition, BundlePrecondition, FnHandler, FnNormalizer, FnPostValidator,
  FnValidator, Handler, Normalizer, Operation, PostValidator, Validator,
};
use super::validation::ValidationResult;

/// Stages registered for one operation name
#[derive(Default, Clone)]
struct OperationEntry {
  preconditions: Vec<Arc<dyn Validator>>,
  normalizers: Vec<Arc<dyn Normalizer>>,
  handler: Option<Arc<dyn Handler>>,
  postconditions: Vec<Arc<dyn PostValidator>>,
}

#[derive(Default)]
struct Registry {
  operations: HashMap<String, OperationEntry>,
  /// Run for every operation, in registration order
  normalizers: Vec<(String, Arc<dyn Normalizer>)>,
}

/// Successful run of one operation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
  pub operation: String,
  pub result: Value,
  /// Context after normalization
  pub context: OperationContext,
}

/// Single-path executor: pre → normalize → execute → post → emit.
///
/// Each `execute` emits exactly one event. Validators and normalizers
/// accumulate in registration order; registering a handler replaces the
/// previous one.
pub struct Engine {
  registry: RwLock<Registry>,
  sink: Arc<dyn EventSink>,
}

impl Default for Engine {
  fn default() -> Self {
    Self::new()
  }
}

impl Engine {
  pub fn new() -> Self {
    Self::with_sink(Arc::new(NoopSink))
  }

  pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
    Self {
      registry: RwLock::new(Registry::default()),
      sink,
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, Registry> {
    self.registry.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, Registry> {
    self.registry.write().unwrap_or_else(PoisonError::into_inner)
  }

  // ==========================================================================
  // Registration
  // ==========================================================================

  pub fn register_precondition<F>(&self, operation: &str, check: F)
  where
    F: Fn(&OperationContext) -> ValidationResult + Send + Sync + 'static,
  {
    self.register_precondition_with(operation, Arc::new(FnValidator(check)));
  }

  pub fn register_precondition_with(&self, operation: &str, validator: Arc<dyn Validator>) {
    self
      .write()
      .operations
      .entry(operation.to_string())
      .or_default()
      .preconditions
      .push(validator);
  }

  pub fn register_postcondition<F>(&self, operation: &str, check: F)
  where
    F: Fn(&Value, &OperationContext) -> ValidationResult + Send + Sync + 'static,
  {
    self.register_postcondition_with(operation, Arc::new(FnPostValidator(check)));
  }

  pub fn register_postcondition_with(&self, operation: &str, validator: Arc<dyn PostValidator>) {
    self
      .write()
      .operations
      .entry(operation.to_string())
      .or_default()
      .postconditions
      .push(validator);
  }

  /// Register the handler for `operation`, replacing any previous one.
  pub fn register_operation<F, Fut>(&self, operation: &str, handler: F)
  where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
  {
    self.register_handler(operation, Arc::new(FnHandler(handler)));
  }

  pub fn register_handler(&self, operation: &str, handler: Arc<dyn Handler>) {
    let mut registry = self.write();
    let entry = registry.operations.entry(operation.to_string()).or_default();
    if entry.handler.replace(handler).is_some() {
      debug!(operation, "replaced handler");
    }
  }

  /// Register a global normalizer. Re-registering a name replaces it in place.
  pub fn register_normalizer<F>(&self, name: &str, normalize: F)
  where
    F: Fn(&mut OperationContext) -> Result<(), BoxError> + Send + Sync + 'static,
  {
    self.register_normalizer_with(name, Arc::new(FnNormalizer(normalize)));
  }

  pub fn register_normalizer_with(&self, name: &str, normalizer: Arc<dyn Normalizer>) {
    let mut registry = self.write();
    match registry.normalizers.iter_mut().find(|(n, _)| n.as_str() == name) {
      Some(slot) => slot.1 = normalizer,
      None => registry.normalizers.push((name.to_string(), normalizer)),
    }
  }

  /// Install an `Operation` bundle, replacing everything registered under its name.
  pub fn install(&self, operation: Arc<dyn Operation>) {
    let name = operation.name().to_string();
    let entry = OperationEntry {
      preconditions: vec![Arc::new(BundlePrecondition(Arc::clone(&operation)))],
      normalizers: vec![Arc::new(BundleNormalizer(Arc::clone(&operation)))],
      handler: Some(Arc::new(BundleHandler(Arc::clone(&operation)))),
      postconditions: vec![Arc::new(BundlePostcondition(operation))],
    };
    self.write().operations.insert(name, entry);
  }

  pub fn has_operation(&self, operation: &str) -> bool {
    self
      .read()
      .operations
      .get(operation)
      .is_some_and(|entry| entry.handler.is_some())
  }

  /// Names of operations with a handler, sorted
  pub fn operations(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .read()
      .operations
      .iter()
      .filter(|(_, entry)| entry.handler.is_some())
      .map(|(name, _)| name.clone())
      .collect();
    names.sort();
    names
  }

  // ==========================================================================
  // Execution
  // ==========================================================================

  /// Run `operation` through the pipeline and emit one event for the outcome.
  pub async fn execute(&self, operation: &str, ctx: OperationContext) -> Result<ExecutionOutcome, ExecutionError> {
    let started = Instant::now();
    let result = self.run_pipeline(operation, ctx).await;

    let outcome = match &result {
      Ok(outcome) => EventOutcome::Success {
        result: outcome.result.clone(),
      },
      Err(err) => EventOutcome::Failure { error: err.report() },
    };
    self.sink.emit(ExecutionEvent {
      operation: operation.to_string(),
      outcome,
      duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
      timestamp: chrono::Utc::now(),
    });

    result
  }

  async fn run_pipeline(&self, operation: &str, mut ctx: OperationContext) -> Result<ExecutionOutcome, ExecutionError> {
    // Snapshot so registration never waits on a running pipeline
    let (entry, handler, global_normalizers) = {
      let registry = self.read();
      let entry = registry.operations.get(operation).cloned().unwrap_or_default();
      let Some(handler) = entry.handler.clone() else {
        return Err(ExecutionError::UnknownOperation {
          operation: operation.to_string(),
        });
      };
      (entry, handler, registry.normalizers.clone())
    };

    for precondition in &entry.preconditions {
      let check = precondition.validate(&ctx).await;
      if !check.valid {
        return Err(ExecutionError::PreconditionFailed {
          operation: operation.to_string(),
          message: check.message.unwrap_or_else(|| "precondition failed".to_string()),
          details: check.details,
        });
      }
    }

    for (name, normalizer) in &global_normalizers {
      normalizer
        .normalize(&mut ctx)
        .await
        .map_err(|e| ExecutionError::NormalizationFailed {
          operation: operation.to_string(),
          normalizer: name.clone(),
          message: e.to_string(),
        })?;
    }
    for normalizer in &entry.normalizers {
      normalizer
        .normalize(&mut ctx)
        .await
        .map_err(|e| ExecutionError::NormalizationFailed {
          operation: operation.to_string(),
          normalizer: operation.to_string(),
          message: e.to_string(),
        })?;
    }

    debug!(operation, "executing");
    let result = handler
      .handle(&ctx)
      .await
      .map_err(|e| ExecutionError::ExecutionFailed {
        operation: operation.to_string(),
        message: e.to_string(),
      })?;

    for postcondition in &entry.postconditions {
      let check = postcondition.validate(&result, &ctx).await;
      if !check.valid {
        return Err(ExecutionError::PostconditionFailed {
          operation: operation.to_string(),
          message: check.message.unwrap_or_else(|| "postcondition failed".to_string()),
          details: check.details,
        });
      }
    }

    Ok(ExecutionOutcome {
      operation: operation.to_string(),
      result,
      context: ctx,
    })
  }
}
