//! Execution Context Module
//!
//! Provides the shared state that flows through a workflow run.
//!
//! # Structure
//!
//! - [`key`]: Precomputed-hash identifiers for entries and step names
//! - [`store`]: The thread-safe, scope-partitioned key/value store

pub mod key;
pub mod store;

pub use key::ContextKey;
pub use store::{ContextError, ContextScope, FlowContext, DEFAULT_SCOPE};
