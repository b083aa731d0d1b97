//! Step Capabilities
//!
//! A step is a named unit of work operating on the shared context. Two
//! capabilities exist: [`UnitStep`] for work with no result, and
//! [`ValueStep`] for work producing a typed, serializable result. The
//! scheduler does not distinguish between them: both are erased behind a
//! [`StepHandle`], whose invocation always yields an optional untyped
//! value.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextError, FlowContext};
use crate::execution::cancel::CancelSignal;

/// Errors raised by step implementations.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step failed with a message of its own.
    #[error("{0}")]
    Failed(String),

    /// A context operation failed.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// A typed step output could not be serialized.
    #[error("failed to encode step output: {0}")]
    Output(#[from] serde_json::Error),
}

impl StepError {
    /// Creates a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A step that performs work without producing a result.
///
/// Implementations receive the shared context and a cancellation signal.
/// Long-running steps should observe the signal and return early; the
/// scheduler never kills a running step.
#[async_trait]
pub trait UnitStep: Send + Sync {
    async fn run(&self, ctx: &FlowContext, cancel: &CancelSignal) -> Result<(), StepError>;
}

/// A step that produces a typed result.
///
/// The output is serialized and collected into the run's output map under
/// the step's name.
#[async_trait]
pub trait ValueStep: Send + Sync {
    type Output: Serialize + Send;

    async fn run(&self, ctx: &FlowContext, cancel: &CancelSignal)
        -> Result<Self::Output, StepError>;
}

/// Object-safe shape both capabilities are erased into.
#[async_trait]
trait ErasedStep: Send + Sync {
    async fn invoke(
        &self,
        ctx: &FlowContext,
        cancel: &CancelSignal,
    ) -> Result<Option<Value>, StepError>;
}

struct UnitAdapter<S>(S);

#[async_trait]
impl<S: UnitStep> ErasedStep for UnitAdapter<S> {
    async fn invoke(
        &self,
        ctx: &FlowContext,
        cancel: &CancelSignal,
    ) -> Result<Option<Value>, StepError> {
        self.0.run(ctx, cancel).await.map(|_| None)
    }
}

struct ValueAdapter<S>(S);

#[async_trait]
impl<S: ValueStep> ErasedStep for ValueAdapter<S> {
    async fn invoke(
        &self,
        ctx: &FlowContext,
        cancel: &CancelSignal,
    ) -> Result<Option<Value>, StepError> {
        let output = self.0.run(ctx, cancel).await?;
        Ok(Some(serde_json::to_value(output)?))
    }
}

/// The uniform wrapper around either step capability.
///
/// Handles are cheap to clone and are what descriptors, registries and
/// the scheduler carry.
#[derive(Clone)]
pub struct StepHandle {
    inner: Arc<dyn ErasedStep>,
}

impl StepHandle {
    /// Wraps a step with no result.
    pub fn unit(step: impl UnitStep + 'static) -> Self {
        Self {
            inner: Arc::new(UnitAdapter(step)),
        }
    }

    /// Wraps a step producing a typed result.
    pub fn value<S>(step: S) -> Self
    where
        S: ValueStep + 'static,
    {
        Self {
            inner: Arc::new(ValueAdapter(step)),
        }
    }

    /// Runs the wrapped step.
    ///
    /// Unit steps yield `None`; value steps yield their serialized output.
    pub async fn invoke(
        &self,
        ctx: &FlowContext,
        cancel: &CancelSignal,
    ) -> Result<Option<Value>, StepError> {
        self.inner.invoke(ctx, cancel).await
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepHandle")
    }
}
