//! Workflow Data Model
//!
//! Core data structures describing what a run executes: step descriptors
//! and the ordered configuration they are collected into.
//!
//! Insertion order carries no scheduling meaning. Only dependency and
//! condition satisfaction determine when a step becomes eligible; the
//! scheduler re-derives eligibility from the descriptors every round.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::context::{ContextKey, FlowContext};

use super::step::{StepHandle, UnitStep, ValueStep};

/// Predicate deciding whether a step is currently eligible to run.
///
/// Evaluated against the live context at every scheduling round, so a
/// condition can become true as earlier steps write their results.
pub type StepCondition = Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>;

/// Describes a single step of a configuration.
///
/// A descriptor bundles the wrapped step with its name, an optional run
/// condition, the parallel flag, and the names of the steps it depends
/// on.
///
/// # Example
///
/// ```
/// use flowrunner::{FlowContext, StepDescriptor};
/// # use async_trait::async_trait;
/// # use flowrunner::{CancelSignal, StepError, UnitStep};
/// # struct Align;
/// # #[async_trait]
/// # impl UnitStep for Align {
/// #     async fn run(&self, _: &FlowContext, _: &CancelSignal) -> Result<(), StepError> { Ok(()) }
/// # }
///
/// let step = StepDescriptor::unit("align", Align)
///     .depends_on("trim")
///     .with_parallel(true)
///     .with_condition(|ctx: &FlowContext| ctx.contains("reads"));
///
/// assert_eq!(step.name().name(), "align");
/// assert!(step.is_parallel());
/// ```
#[derive(Clone)]
pub struct StepDescriptor {
    handle: StepHandle,
    name: ContextKey,
    condition: Option<StepCondition>,
    parallel: bool,
    depends_on: Vec<ContextKey>,
}

impl StepDescriptor {
    /// Creates a descriptor from an already-wrapped step.
    pub fn new(name: impl Into<ContextKey>, handle: StepHandle) -> Self {
        Self {
            handle,
            name: name.into(),
            condition: None,
            parallel: false,
            depends_on: Vec::new(),
        }
    }

    /// Creates a descriptor for a step with no result.
    pub fn unit(name: impl Into<ContextKey>, step: impl UnitStep + 'static) -> Self {
        Self::new(name, StepHandle::unit(step))
    }

    /// Creates a descriptor for a step producing a typed result.
    pub fn value<S>(name: impl Into<ContextKey>, step: S) -> Self
    where
        S: ValueStep + 'static,
    {
        Self::new(name, StepHandle::value(step))
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, name: impl Into<ContextKey>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Sets whether this step may run concurrently with other eligible
    /// parallel steps.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the run condition for this step.
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&FlowContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Returns the step's name.
    pub fn name(&self) -> &ContextKey {
        &self.name
    }

    /// Returns the wrapped step.
    pub fn handle(&self) -> &StepHandle {
        &self.handle
    }

    /// Returns true if this step may join a parallel batch.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Returns the names of the steps this step depends on.
    pub fn dependencies(&self) -> &[ContextKey] {
        &self.depends_on
    }

    /// Returns true if this step carries a run condition.
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    /// Returns true if every dependency has executed and the condition
    /// (if any) holds against the current context.
    pub(crate) fn is_ready(&self, executed: &HashSet<ContextKey>, ctx: &FlowContext) -> bool {
        self.depends_on.iter().all(|dep| executed.contains(dep))
            && self.condition.as_ref().map_or(true, |cond| cond(ctx))
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name.name())
            .field("parallel", &self.parallel)
            .field("depends_on", &self.depends_on)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

/// Settings shared by a batch of steps appended together.
#[derive(Clone, Default)]
pub struct StepSettings {
    /// Parallel flag applied to every step in the batch.
    pub parallel: bool,
    /// Dependencies applied to every step in the batch.
    pub depends_on: Vec<ContextKey>,
    /// Run condition applied to every step in the batch.
    pub condition: Option<StepCondition>,
}

/// An ordered collection of step descriptors.
///
/// Configurations are assembled with chainable appends. Structural
/// integrity (unique names, dependencies that exist) is checked when a
/// manager is constructed from the configuration, not at append time.
#[derive(Clone, Default)]
pub struct FlowConfiguration {
    steps: Vec<StepDescriptor>,
}

impl FlowConfiguration {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step descriptor.
    pub fn add_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a batch of named steps sharing one group of settings.
    pub fn add_steps<I, N>(mut self, steps: I, settings: StepSettings) -> Self
    where
        I: IntoIterator<Item = (N, StepHandle)>,
        N: Into<ContextKey>,
    {
        for (name, handle) in steps {
            let mut descriptor =
                StepDescriptor::new(name, handle).with_parallel(settings.parallel);
            descriptor.depends_on = settings.depends_on.clone();
            descriptor.condition = settings.condition.clone();
            self.steps.push(descriptor);
        }
        self
    }

    /// Returns the descriptors in insertion order.
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// Returns the descriptor with the given name, if present.
    pub fn get_step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.name().name() == name)
    }

    /// Returns every step name in insertion order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name().name()).collect()
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the configuration has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for FlowConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowConfiguration")
            .field("steps", &self.step_names())
            .finish()
    }
}
