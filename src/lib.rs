//! FlowRunner - Dependency-Aware Step Orchestration
//!
//! A library for executing named units of work ("steps") against a
//! shared, thread-safe context, honoring declared dependencies, optional
//! run conditions, and a per-step parallel/sequential flag, while
//! bounding how many flows and how many concurrent steps are in flight.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`context`]: The shared key/value store steps communicate through
//! - [`workflow`]: Step capabilities, descriptors, configurations, and
//!   declarative loading behind a type allowlist
//! - [`execution`]: The round-based scheduler and the managing facade
//!   with its concurrency limits and bounded work queue
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use flowrunner::{
//!     CancelSignal, FlowConfiguration, FlowContext, FlowManager, StepDescriptor, StepError,
//!     UnitStep,
//! };
//!
//! struct Generate;
//!
//! #[async_trait]
//! impl UnitStep for Generate {
//!     async fn run(&self, ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
//!         ctx.set("value", 42);
//!         Ok(())
//!     }
//! }
//!
//! struct Report;
//!
//! #[async_trait]
//! impl UnitStep for Report {
//!     async fn run(&self, ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
//!         let value: i64 = ctx.get_typed("value")?;
//!         println!("generated {}", value);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FlowConfiguration::new()
//!         .add_step(StepDescriptor::unit("generate", Generate))
//!         .add_step(StepDescriptor::unit("report", Report).depends_on("generate"));
//!
//!     let manager = FlowManager::new(config)?;
//!     let result = manager.run(&FlowContext::new()).await;
//!     assert!(result.success);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod execution;
pub mod workflow;

// Re-export commonly used types
pub use context::{ContextError, ContextKey, ContextScope, FlowContext, DEFAULT_SCOPE};
pub use execution::{
    CancelSignal, FlowError, FlowErrorKind, FlowManager, FlowResult, LogResultHandler,
    ManagerOptions, QueueError, ResultHandler, Scheduler, StepResult,
};
pub use workflow::{
    from_declaration, from_declarations, load_declaration, quick_validate, validate_configuration,
    ConfigError, FlowConfiguration, StepCondition, StepDeclaration, StepDescriptor, StepError,
    StepHandle, StepRegistry, StepSettings, UnitStep, ValueStep,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_context() {
        let ctx = FlowContext::new();
        ctx.set("k", 1);
        assert!(ctx.contains("k"));
    }

    #[test]
    fn test_module_exports_configuration() {
        let config = FlowConfiguration::new();
        assert!(config.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
