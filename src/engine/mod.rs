//! Single-path execution engine for named operations.

mod context;
mod error;
mod events;
mod executor;
mod traits;
mod validation;

pub use context::OperationContext;
pub use error::{BoxError, ErrorReport, ExecutionError, Stage};
pub use events::{ChannelSink, EventOutcome, EventSink, EventStream, ExecutionEvent, NoopSink, TracingSink};
pub use executor::{Engine, ExecutionOutcome};
pub use traits::{
  FnHandler, FnNormalizer, FnPostValidator, FnValidator, Handler, Normalizer, Operation, PostValidator, Validator,
};
pub use validation::ValidationResult;
