//! Step Type Registry
//!
//! The allowlist consulted when a configuration is built from declarative
//! input. Every entry maps a step-type string to a factory the caller
//! registered explicitly; nothing outside this table can ever be
//! instantiated from a declaration. Callers that resolve steps through
//! their own wiring (configuration values, shared services) capture that
//! wiring inside the factories they register.

use std::collections::HashMap;
use std::fmt;

use log::debug;

use super::step::{StepHandle, UnitStep, ValueStep};

type StepFactory = Box<dyn Fn() -> StepHandle + Send + Sync>;

/// Caller-supplied mapping from step-type names to step factories.
///
/// # Example
///
/// ```
/// use flowrunner::StepRegistry;
/// # use async_trait::async_trait;
/// # use flowrunner::{CancelSignal, FlowContext, StepError, UnitStep};
/// # struct Validate;
/// # #[async_trait]
/// # impl UnitStep for Validate {
/// #     async fn run(&self, _: &FlowContext, _: &CancelSignal) -> Result<(), StepError> { Ok(()) }
/// # }
///
/// let mut registry = StepRegistry::new();
/// registry.register_unit("Validate", || Validate);
///
/// assert!(registry.contains("Validate"));
/// assert!(registry.resolve("Transform").is_none());
/// ```
#[derive(Default)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing an already-wrapped step.
    ///
    /// Re-registering a type name replaces the previous factory.
    pub fn register<F>(&mut self, step_type: impl Into<String>, factory: F)
    where
        F: Fn() -> StepHandle + Send + Sync + 'static,
    {
        let step_type = step_type.into();
        debug!("Registering step type '{}'", step_type);
        self.factories.insert(step_type, Box::new(factory));
    }

    /// Registers a factory for a step with no result.
    pub fn register_unit<S, F>(&mut self, step_type: impl Into<String>, make: F)
    where
        S: UnitStep + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register(step_type, move || StepHandle::unit(make()));
    }

    /// Registers a factory for a step producing a typed result.
    pub fn register_value<S, F>(&mut self, step_type: impl Into<String>, make: F)
    where
        S: ValueStep + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register(step_type, move || StepHandle::value(make()));
    }

    /// Instantiates a step of the given registered type.
    ///
    /// Returns `None` for unregistered types; no factory runs in that
    /// case.
    pub fn resolve(&self, step_type: &str) -> Option<StepHandle> {
        self.factories.get(step_type).map(|factory| factory())
    }

    /// Returns true if the type name is registered.
    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Returns the registered type names, sorted.
    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort();
        types
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
