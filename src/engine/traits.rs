//! Pipeline stage traits and closure adapters.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::context::OperationContext;
use super::error::BoxError;
use super::validation::ValidationResult;

#[async_trait]
pub trait Validator: Send + Sync {
  async fn validate(&self, ctx: &OperationContext) -> ValidationResult;
}

/// Checks the handler's result.
#[async_trait]
pub trait PostValidator: Send + Sync {
  async fn validate(&self, result: &Value, ctx: &OperationContext) -> ValidationResult;
}

#[async_trait]
pub trait Normalizer: Send + Sync {
  async fn normalize(&self, ctx: &mut OperationContext) -> Result<(), BoxError>;
}

#[async_trait]
pub trait Handler: Send + Sync {
  async fn handle(&self, ctx: &OperationContext) -> Result<Value, BoxError>;
}

/// A complete operation installed as one bundle.
///
/// Only `execute` is required; the other stages default to pass-through.
#[async_trait]
pub trait Operation: Send + Sync {
  fn name(&self) -> &str;

  async fn precondition(&self, _ctx: &OperationContext) -> ValidationResult {
    ValidationResult::pass()
  }

  async fn normalize(&self, _ctx: &mut OperationContext) -> Result<(), BoxError> {
    Ok(())
  }

  async fn execute(&self, ctx: &OperationContext) -> Result<Value, BoxError>;

  async fn postcondition(&self, _result: &Value, _ctx: &OperationContext) -> ValidationResult {
    ValidationResult::pass()
  }
}

// ============================================================================
// Closure adapters
// ============================================================================

pub struct FnValidator<F>(pub F);

#[async_trait]
impl<F> Validator for FnValidator<F>
where
  F: Fn(&OperationContext) -> ValidationResult + Send + Sync,
{
  async fn validate(&self, ctx: &OperationContext) -> ValidationResult {
    (self.0)(ctx)
  }
}

pub struct FnPostValidator<F>(pub F);

#[async_trait]
impl<F> PostValidator for FnPostValidator<F>
where
  F: Fn(&Value, &OperationContext) -> ValidationResult + Send + Sync,
{
  async fn validate(&self, result: &Value, ctx: &OperationContext) -> ValidationResult {
    (self.0)(result, ctx)
  }
}

pub struct FnNormalizer<F>(pub F);

#[async_trait]
impl<F> Normalizer for FnNormalizer<F>
where
  F: Fn(&mut OperationContext) -> Result<(), BoxError> + Send + Sync,
{
  async fn normalize(&self, ctx: &mut OperationContext) -> Result<(), BoxError> {
    (self.0)(ctx)
  }
}

/// Async closure handler; receives its own copy of the context.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
  F: Fn(OperationContext) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Value, BoxError>> + Send,
{
  async fn handle(&self, ctx: &OperationContext) -> Result<Value, BoxError> {
    (self.0)(ctx.clone()).await
  }
}

// ============================================================================
// Operation bundle adapters
// ============================================================================

pub(super) struct BundlePrecondition(pub(super) Arc<dyn Operation>);

#[async_trait]
impl Validator for BundlePrecondition {
  async fn validate(&self, ctx: &OperationContext) -> ValidationResult {
    self.0.precondition(ctx).await
  }
}

pub(super) struct BundleNormalizer(pub(super) Arc<dyn Operation>);

#[async_trait]
impl Normalizer for BundleNormalizer {
  async fn normalize(&self, ctx: &mut OperationContext) -> Result<(), BoxError> {
    self.0.normalize(ctx).await
  }
}

pub(super) struct BundleHandler(pub(super) Arc<dyn Operation>);

#[async_trait]
impl Handler for BundleHandler {
  async fn handle(&self, ctx: &OperationContext) -> Result<Value, BoxError> {
    self.0.execute(ctx).await
  }
}

pub(super) struct BundlePostcondition(pub(super) Arc<dyn Operation>);

#[async_trait]
impl PostValidator for BundlePostcondition {
  async fn validate(&self, result: &Value, ctx: &OperationContext) -> ValidationResult {
    self.0.postcondition(result, ctx).await
  }
}
