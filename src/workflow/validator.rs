//! Configuration Validation
//!
//! Structural integrity checks performed once, when a manager is built:
//! step names must be unique and every declared dependency must name a
//! step that exists in the same configuration.
//!
//! Dependency cycles are deliberately not a structural error. A cycle of
//! existing names passes validation and then terminates at run time as a
//! deadlock, together with conditions that never become true; only
//! problems detectable from the shape of the configuration alone are
//! rejected here.

use std::collections::HashSet;

use log::info;
use thiserror::Error;

use super::model::FlowConfiguration;

/// Errors produced while building or validating a configuration.
///
/// These are always surfaced synchronously, from constructors and
/// loaders; a run never reports them.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two steps share a name.
    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),

    /// A step depends on a name no step carries.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// A declaration named a type absent from the registry.
    #[error("step type '{step_type}' is not registered (step '{step_name}')")]
    UnregisteredType {
        step_type: String,
        step_name: String,
    },

    /// A declaration document could not be parsed.
    #[error("malformed step declaration: {0}")]
    Malformed(String),

    /// A declaration file could not be read.
    #[error("failed to read declaration file '{path}': {message}")]
    Io { path: String, message: String },
}

/// Validates the structural integrity of a configuration.
///
/// Performs the following checks:
/// 1. No duplicate step names
/// 2. Every dependency names a step in the configuration
///
/// Empty configurations are valid; they complete immediately when run.
pub fn validate_configuration(config: &FlowConfiguration) -> Result<(), ConfigError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(config.len());
    for step in config.steps() {
        if !seen.insert(step.name().name()) {
            return Err(ConfigError::DuplicateStepName(step.name().name().to_string()));
        }
    }

    for step in config.steps() {
        for dependency in step.dependencies() {
            if !seen.contains(dependency.name()) {
                return Err(ConfigError::UnknownDependency {
                    step: step.name().name().to_string(),
                    dependency: dependency.name().to_string(),
                });
            }
        }
    }

    info!("Configuration validated: {} steps", config.len());
    Ok(())
}

/// Non-failing validation that collects every problem as a message.
///
/// Useful for tooling feedback before a configuration is handed to a
/// manager.
pub fn quick_validate(config: &FlowConfiguration) -> Vec<String> {
    let mut problems = Vec::new();

    let mut seen: HashSet<&str> = HashSet::with_capacity(config.len());
    for step in config.steps() {
        if !seen.insert(step.name().name()) {
            problems.push(format!("Duplicate step name: '{}'", step.name().name()));
        }
    }

    let names: HashSet<&str> = config.steps().iter().map(|s| s.name().name()).collect();
    for step in config.steps() {
        for dependency in step.dependencies() {
            if !names.contains(dependency.name()) {
                problems.push(format!(
                    "Step '{}': references unknown step '{}'",
                    step.name().name(),
                    dependency.name()
                ));
            }
        }
    }

    problems
}
