//! Shared Execution Context
//!
//! The thread-safe key/value store passed to every step of a run. It is
//! the single channel through which steps communicate: upstream steps
//! write values, downstream steps (and the caller, after completion) read
//! them. Entries live in named scopes; a default scope always exists.
//!
//! All operations are safe under arbitrary concurrent callers. Storage is
//! a sharded concurrent map, so a batch of parallel steps does not
//! serialize on a single context lock.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::key::ContextKey;

/// Name of the scope used by the context-level operations.
pub const DEFAULT_SCOPE: &str = "default";

/// Errors produced by context operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// No entry exists for the requested key.
    #[error("context key not found: '{0}'")]
    NotFound(String),

    /// An entry exists but does not deserialize as the requested type.
    #[error("context value for '{key}' is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    /// Null values cannot be stored through the guarded insert.
    #[error("context values must not be null")]
    NullValue,
}

/// A single named partition of the context.
///
/// Scope operations mirror the context-level operations; `clear` on a
/// scope empties only that scope.
#[derive(Debug, Default)]
pub struct ContextScope {
    entries: DashMap<ContextKey, Value>,
}

impl ContextScope {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Inserts or replaces a value. Last writer wins.
    pub fn set(&self, key: impl Into<ContextKey>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Inserts a value only if the key is absent.
    ///
    /// Returns `Ok(false)` without touching the existing entry when the
    /// key is already present. Null values are rejected.
    pub fn try_set(
        &self,
        key: impl Into<ContextKey>,
        value: impl Into<Value>,
    ) -> Result<bool, ContextError> {
        let value = value.into();
        if value.is_null() {
            return Err(ContextError::NullValue);
        }

        match self.entries.entry(key.into()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    /// Returns a copy of the value for `key`, if present.
    pub fn get(&self, key: impl Into<ContextKey>) -> Option<Value> {
        self.entries.get(&key.into()).map(|v| v.clone())
    }

    /// Returns the value for `key` deserialized as `T`.
    ///
    /// Fails with [`ContextError::NotFound`] when the key is absent and
    /// with [`ContextError::WrongType`] when the stored value does not
    /// deserialize as `T`.
    pub fn get_typed<T: DeserializeOwned>(
        &self,
        key: impl Into<ContextKey>,
    ) -> Result<T, ContextError> {
        let key = key.into();
        let value = self
            .entries
            .get(&key)
            .map(|v| v.clone())
            .ok_or_else(|| ContextError::NotFound(key.name().to_string()))?;

        serde_json::from_value(value).map_err(|_| ContextError::WrongType {
            key: key.name().to_string(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Removes the entry for `key`. Returns true if an entry was removed.
    pub fn remove(&self, key: impl Into<ContextKey>) -> bool {
        self.entries.remove(&key.into()).is_some()
    }

    /// Returns true if an entry exists for `key`.
    pub fn contains(&self, key: impl Into<ContextKey>) -> bool {
        self.entries.contains_key(&key.into())
    }

    /// Removes every entry in this scope.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Returns the number of entries in this scope.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this scope holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a point-in-time copy of this scope's entries keyed by name.
    ///
    /// The copy does not track later modifications.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.entries
            .iter()
            .map(|entry| (entry.key().name().to_string(), entry.value().clone()))
            .collect()
    }
}

struct ContextInner {
    scopes: DashMap<String, Arc<ContextScope>>,
    default_scope: Arc<ContextScope>,
}

/// The shared, mutable, thread-safe store for one workflow run.
///
/// `FlowContext` is a cheap handle: cloning it yields another handle to
/// the same underlying storage, which is how it is threaded through
/// concurrently executing steps. Context-level operations address the
/// default scope; use [`FlowContext::scope`] for additional partitions.
///
/// # Example
///
/// ```
/// use flowrunner::FlowContext;
///
/// let ctx = FlowContext::new();
/// ctx.set("sample", "NA12878");
/// assert_eq!(ctx.get_typed::<String>("sample").unwrap(), "NA12878");
/// ```
#[derive(Clone)]
pub struct FlowContext {
    inner: Arc<ContextInner>,
}

impl FlowContext {
    /// Creates an empty context with the default scope in place.
    pub fn new() -> Self {
        let default_scope = Arc::new(ContextScope::new());
        let scopes = DashMap::new();
        scopes.insert(DEFAULT_SCOPE.to_string(), Arc::clone(&default_scope));

        Self {
            inner: Arc::new(ContextInner {
                scopes,
                default_scope,
            }),
        }
    }

    /// Returns the scope with the given name, creating it if needed.
    pub fn scope(&self, name: &str) -> Arc<ContextScope> {
        if name == DEFAULT_SCOPE {
            return Arc::clone(&self.inner.default_scope);
        }

        Arc::clone(
            &self
                .inner
                .scopes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ContextScope::new())),
        )
    }

    /// Returns the names of all existing scopes, sorted.
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .scopes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Inserts or replaces a value in the default scope.
    pub fn set(&self, key: impl Into<ContextKey>, value: impl Into<Value>) {
        self.inner.default_scope.set(key, value);
    }

    /// Inserts into the default scope only if the key is absent.
    pub fn try_set(
        &self,
        key: impl Into<ContextKey>,
        value: impl Into<Value>,
    ) -> Result<bool, ContextError> {
        self.inner.default_scope.try_set(key, value)
    }

    /// Returns a copy of the value for `key` from the default scope.
    pub fn get(&self, key: impl Into<ContextKey>) -> Option<Value> {
        self.inner.default_scope.get(key)
    }

    /// Returns the default-scope value for `key` deserialized as `T`.
    pub fn get_typed<T: DeserializeOwned>(
        &self,
        key: impl Into<ContextKey>,
    ) -> Result<T, ContextError> {
        self.inner.default_scope.get_typed(key)
    }

    /// Removes the default-scope entry for `key`.
    pub fn remove(&self, key: impl Into<ContextKey>) -> bool {
        self.inner.default_scope.remove(key)
    }

    /// Returns true if the default scope has an entry for `key`.
    pub fn contains(&self, key: impl Into<ContextKey>) -> bool {
        self.inner.default_scope.contains(key)
    }

    /// Removes every entry from every scope.
    pub fn clear(&self) {
        for entry in self.inner.scopes.iter() {
            entry.value().clear();
        }
    }

    /// Returns the number of entries in the default scope.
    pub fn len(&self) -> usize {
        self.inner.default_scope.len()
    }

    /// Returns true if the default scope is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.default_scope.is_empty()
    }

    /// Returns a point-in-time copy of the default scope.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.default_scope.snapshot()
    }
}

impl Default for FlowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("scopes", &self.scope_names())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let ctx = FlowContext::new();
        ctx.set("count", 3);

        assert_eq!(ctx.get("count"), Some(json!(3)));
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let ctx = FlowContext::new();
        ctx.set("k", "first");
        ctx.set("k", "second");

        assert_eq!(ctx.get("k"), Some(json!("second")));
    }

    #[test]
    fn test_try_set_respects_existing_entry() {
        let ctx = FlowContext::new();

        assert_eq!(ctx.try_set("k", "original"), Ok(true));
        assert_eq!(ctx.try_set("k", "usurper"), Ok(false));
        assert_eq!(ctx.get("k"), Some(json!("original")));
    }

    #[test]
    fn test_try_set_rejects_null() {
        let ctx = FlowContext::new();

        assert_eq!(ctx.try_set("k", Value::Null), Err(ContextError::NullValue));
        assert!(!ctx.contains("k"));
    }

    #[test]
    fn test_get_typed() {
        let ctx = FlowContext::new();
        ctx.set("threads", 8);

        let threads: u32 = ctx.get_typed("threads").unwrap();
        assert_eq!(threads, 8);
    }

    #[test]
    fn test_get_typed_missing() {
        let ctx = FlowContext::new();

        let err = ctx.get_typed::<String>("absent").unwrap_err();
        assert_eq!(err, ContextError::NotFound("absent".to_string()));
    }

    #[test]
    fn test_get_typed_wrong_type() {
        let ctx = FlowContext::new();
        ctx.set("label", "not a number");

        let err = ctx.get_typed::<u64>("label").unwrap_err();
        assert!(matches!(err, ContextError::WrongType { .. }));
    }

    #[test]
    fn test_remove_and_contains() {
        let ctx = FlowContext::new();
        ctx.set("k", 1);

        assert!(ctx.contains("k"));
        assert!(ctx.remove("k"));
        assert!(!ctx.contains("k"));
        assert!(!ctx.remove("k"));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let ctx = FlowContext::new();
        ctx.set("a", 1);

        let snap = ctx.snapshot();
        ctx.set("b", 2);

        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("a"), Some(&json!(1)));
        assert!(snap.get("b").is_none());
    }

    #[test]
    fn test_clear_empties_all_scopes() {
        let ctx = FlowContext::new();
        ctx.set("a", 1);
        ctx.scope("aux").set("b", 2);

        ctx.clear();

        assert!(ctx.is_empty());
        assert!(ctx.scope("aux").is_empty());
    }

    #[test]
    fn test_scopes_are_isolated() {
        let ctx = FlowContext::new();
        ctx.set("k", "default value");
        ctx.scope("staging").set("k", "staging value");

        assert_eq!(ctx.get("k"), Some(json!("default value")));
        assert_eq!(ctx.scope("staging").get("k"), Some(json!("staging value")));
    }

    #[test]
    fn test_default_scope_always_exists() {
        let ctx = FlowContext::new();

        assert_eq!(ctx.scope_names(), vec![DEFAULT_SCOPE.to_string()]);
        ctx.scope(DEFAULT_SCOPE).set("k", 1);
        assert_eq!(ctx.get("k"), Some(json!(1)));
    }

    #[test]
    fn test_clone_shares_storage() {
        let ctx = FlowContext::new();
        let handle = ctx.clone();

        handle.set("shared", true);
        assert_eq!(ctx.get("shared"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let ctx = FlowContext::new();

        let mut handles = Vec::new();
        for task in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    ctx.set(format!("task{}_{}", task, i), i);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ctx.len(), 8 * 50);
    }

    #[tokio::test]
    async fn test_concurrent_try_set_single_winner() {
        let ctx = FlowContext::new();

        let mut handles = Vec::new();
        for task in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { ctx.try_set("slot", task) }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(ctx.contains("slot"));
    }
}
