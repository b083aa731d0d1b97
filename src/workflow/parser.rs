//! Declaration Parser
//!
//! Handles building configurations from declarative JSON input. A
//! declaration is a list of records naming a registered step type, a
//! unique step name, an optional parallel flag and optional dependencies:
//!
//! ```json
//! [
//!   {"StepType": "Validate", "StepName": "Validation"},
//!   {"StepType": "Transform", "StepName": "Transformation",
//!    "IsParallel": true, "DependsOn": ["Validation"]}
//! ]
//! ```
//!
//! Declarations are untrusted input. Every `StepType` must be present in
//! the caller's [`StepRegistry`] allowlist, and the whole document is
//! checked before any factory runs, so a rejected declaration never
//! instantiates anything.

use std::fs;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{FlowConfiguration, StepDescriptor};
use super::registry::StepRegistry;
use super::validator::ConfigError;

/// One record of a declarative configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDeclaration {
    /// Key into the caller's step registry.
    #[serde(rename = "StepType")]
    pub step_type: String,

    /// Unique name of the step within the configuration.
    #[serde(rename = "StepName")]
    pub step_name: String,

    /// Whether the step may run in a parallel batch.
    #[serde(rename = "IsParallel", default)]
    pub is_parallel: bool,

    /// Names of steps that must complete first.
    #[serde(rename = "DependsOn", default)]
    pub depends_on: Vec<String>,
}

impl StepDeclaration {
    /// Creates a declaration for the given type and name.
    pub fn new(step_type: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            step_name: step_name.into(),
            is_parallel: false,
            depends_on: Vec::new(),
        }
    }

    /// Sets the parallel flag.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.is_parallel = parallel;
        self
    }

    /// Adds a dependency on another declared step.
    pub fn depends_on(mut self, step_name: impl Into<String>) -> Self {
        self.depends_on.push(step_name.into());
        self
    }
}

/// Builds a configuration from a JSON declaration document.
///
/// Fails with [`ConfigError::Malformed`] on unparseable input and with
/// [`ConfigError::UnregisteredType`] when any record names a type absent
/// from the registry. Structural checks across steps (duplicate names,
/// dependencies on undeclared steps) happen later, at manager
/// construction.
pub fn from_declaration(
    doc: &str,
    registry: &StepRegistry,
) -> Result<FlowConfiguration, ConfigError> {
    let declarations: Vec<StepDeclaration> =
        serde_json::from_str(doc).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    from_declarations(&declarations, registry)
}

/// Builds a configuration from already-parsed declaration records.
pub fn from_declarations(
    declarations: &[StepDeclaration],
    registry: &StepRegistry,
) -> Result<FlowConfiguration, ConfigError> {
    // Reject before resolving: no factory runs for a document that names
    // even one unknown type or carries a blank name.
    for declaration in declarations {
        if declaration.step_name.trim().is_empty() {
            return Err(ConfigError::Malformed(
                "declaration has an empty StepName".to_string(),
            ));
        }
        if !registry.contains(&declaration.step_type) {
            return Err(ConfigError::UnregisteredType {
                step_type: declaration.step_type.clone(),
                step_name: declaration.step_name.clone(),
            });
        }
    }

    let mut config = FlowConfiguration::new();
    for declaration in declarations {
        // Registration was checked above; a vanished entry would be a
        // registry bug, surfaced as an unregistered type all the same.
        let handle =
            registry
                .resolve(&declaration.step_type)
                .ok_or_else(|| ConfigError::UnregisteredType {
                    step_type: declaration.step_type.clone(),
                    step_name: declaration.step_name.clone(),
                })?;

        let mut descriptor = StepDescriptor::new(declaration.step_name.as_str(), handle)
            .with_parallel(declaration.is_parallel);
        for dependency in &declaration.depends_on {
            descriptor = descriptor.depends_on(dependency.as_str());
        }

        debug!(
            "Declared step '{}' (type: {}, parallel: {}, deps: {:?})",
            declaration.step_name,
            declaration.step_type,
            declaration.is_parallel,
            declaration.depends_on
        );
        config = config.add_step(descriptor);
    }

    info!("Built configuration from {} declarations", config.len());
    Ok(config)
}

/// Loads a declaration document from a JSON file.
///
/// # Arguments
///
/// * `path` - Path to the declaration file
/// * `registry` - The caller's step-type allowlist
pub fn load_declaration(
    path: &str,
    registry: &StepRegistry,
) -> Result<FlowConfiguration, ConfigError> {
    info!("Loading step declarations from: {}", path);

    let doc = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    from_declaration(&doc, registry)
}
