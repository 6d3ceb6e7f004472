//! Operation registry
//!
//! Operation implementations register under their dotted mapping; executors
//! resolve mappings through here instead of loading code paths at run time.
//! A worker process rebuilds the registry by running the same registration
//! code as its parent before consuming any task.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::context::OperationContext;
use crate::errors::ExecutorError;

/// Signature every operation implementation satisfies
///
/// The return value is ignored on success; an error marks the attempt
/// failed and is subject to the task's retry policy.
pub type OperationFn = Arc<dyn Fn(&OperationContext) -> anyhow::Result<()> + Send + Sync>;

/// Process-wide default registry
static GLOBAL: Lazy<OperationRegistry> = Lazy::new(OperationRegistry::new);

/// Mapping -> implementation table
pub struct OperationRegistry {
    operations: DashMap<String, OperationFn>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry {
            operations: DashMap::new(),
        }
    }

    /// The process-wide registry most executors default to
    pub fn global() -> &'static OperationRegistry {
        &GLOBAL
    }

    /// Register an implementation under its dotted mapping
    ///
    /// Re-registering a mapping replaces the previous implementation; the
    /// last registration wins, which is what lets tests stub operations.
    pub fn register<F>(&self, mapping: impl Into<String>, operation: F)
    where
        F: Fn(&OperationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.operations.insert(mapping.into(), Arc::new(operation));
    }

    pub fn resolve(&self, mapping: &str) -> Result<OperationFn, ExecutorError> {
        self.operations
            .get(mapping)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExecutorError::UnknownOperation(mapping.to_string()))
    }

    pub fn contains(&self, mapping: &str) -> bool {
        self.operations.contains_key(mapping)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
