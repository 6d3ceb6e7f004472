//! Error taxonomy
//!
//! One enum per layer, all `thiserror`. The split follows the propagation
//! policy: validation-shaped errors (`ValueError`) are collected into
//! reports before a plan is rejected, evaluation misses (`CannotEvaluate`)
//! are swallowed at plan time and surfaced at run time, and everything the
//! engine sees at run time is either retryable (`ExecutorError`,
//! `TaskFailed`) or terminal for the workflow.

use thiserror::Error;

use crate::ids::{ApiId, TaskId};

/// Position in the source document a value came from, when known
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Locator {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// ============================================================================
// TASK-GRAPH API
// ============================================================================

/// Errors raised by the task-graph API; the plan fails, nothing executes
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("adding dependency '{dependent}' -> '{dependency}' would create a cycle")]
    CycleDetected { dependent: ApiId, dependency: ApiId },

    #[error("task '{0}' is not part of this graph")]
    UnknownTask(ApiId),

    #[error("a different task with id '{0}' is already in this graph")]
    ConflictingTask(ApiId),

    #[error("a task cannot depend on itself: '{0}'")]
    SelfDependency(ApiId),

    #[error(transparent)]
    InvalidId(#[from] crate::ids::ApiIdError),
}

// ============================================================================
// FUNCTION EVALUATION
// ============================================================================

/// A value that cannot be coerced or an intrinsic-function call that is
/// malformed; collected into validation reports
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("invalid arguments to {function}: {reason}{}", fmt_locator(.locator))]
    InvalidArgument {
        function: &'static str,
        reason: String,
        locator: Option<Locator>,
    },

    #[error("unknown modelable entity: '{0}'")]
    UnknownEntity(String),

    #[error("unknown input: '{0}'")]
    UnknownInput(String),

    #[error("circular reference while evaluating '{0}'")]
    CircularReference(String),
}

fn fmt_locator(locator: &Option<Locator>) -> String {
    match locator {
        Some(l) => format!(" (at {})", l),
        None => String::new(),
    }
}

/// Outcome of trying to evaluate an intrinsic function
///
/// `CannotEvaluate` is not a defect: it means "not yet", e.g. `HOST` before
/// instantiation. Plan-time callers swallow it, run-time callers surface it.
#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("cannot evaluate {function}: {reason}")]
    CannotEvaluate {
        function: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Invalid(#[from] ValueError),
}

impl FunctionError {
    pub fn cannot(function: &'static str, reason: impl Into<String>) -> Self {
        FunctionError::CannotEvaluate {
            function,
            reason: reason.into(),
        }
    }

    pub fn is_cannot_evaluate(&self) -> bool {
        matches!(self, FunctionError::CannotEvaluate { .. })
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Errors from the model and resource storages
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("{kind} named '{name}' not found")]
    NameNotFound { kind: &'static str, name: String },

    #[error("{kind} {id} already exists")]
    Conflict { kind: &'static str, id: u64 },

    #[error("resource '{entry}/{path}' not found")]
    ResourceNotFound { entry: String, path: String },

    #[error("storage backend cannot be serialized across a process boundary")]
    NotSerializable,

    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage (de)serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

// ============================================================================
// EXECUTORS
// ============================================================================

/// Errors from executor backends; the engine treats these as task failures
/// and applies the task's retry policy
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is closed")]
    Closed,

    #[error("no operation registered for mapping '{0}'")]
    UnknownOperation(String),

    #[error("failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("worker ipc failure: {0}")]
    Ipc(String),

    #[error("broker failure: {0}")]
    Broker(String),

    #[error("remote executor did not become ready within {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// ENGINE
// ============================================================================

/// Terminal outcomes of driving a workflow
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task {task_id} ('{api_id}') failed after {attempts} attempt(s): {error}")]
    TaskFailed {
        task_id: TaskId,
        api_id: ApiId,
        attempts: u32,
        error: String,
    },

    #[error("execution was cancelled")]
    Cancelled,

    #[error("workflow aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// ============================================================================
// WORKFLOW CONSTRUCTION
// ============================================================================

/// Errors raised while a workflow function populates its task graph
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow input '{0}' is missing")]
    MissingInput(String),

    #[error("workflow input '{name}' is invalid: {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("no scalable entity named '{0}' was found")]
    UnknownScalableEntity(String),

    #[error("illegal delta {delta}: entity '{entity}' has {current} instance(s)")]
    IllegalDelta {
        entity: String,
        delta: i64,
        current: u64,
    },

    #[error("node '{node}' has no operation '{operation}'")]
    MissingOperation { node: String, operation: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl From<FunctionError> for WorkflowError {
    fn from(err: FunctionError) -> Self {
        match err {
            FunctionError::Invalid(v) => WorkflowError::Value(v),
            FunctionError::CannotEvaluate { function, reason } => WorkflowError::InvalidInput {
                name: function.to_string(),
                reason,
            },
        }
    }
}

// ============================================================================
// UMBRELLA
// ============================================================================

/// Single error type for callers that drive the whole pipeline
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_error_includes_locator() {
        let err = ValueError::InvalidArgument {
            function: "concat",
            reason: "expected a list".to_string(),
            locator: Some(Locator { line: 4, column: 7 }),
        };
        let msg = err.to_string();
        assert!(msg.contains("concat"));
        assert!(msg.contains("4:7"));
    }

    #[test]
    fn cannot_evaluate_is_distinguishable() {
        let miss = FunctionError::cannot("get_attribute", "not yet instantiated");
        assert!(miss.is_cannot_evaluate());

        let invalid: FunctionError = ValueError::UnknownInput("port".to_string()).into();
        assert!(!invalid.is_cannot_evaluate());
    }

    #[test]
    fn engine_error_carries_origin() {
        let err = EngineError::TaskFailed {
            task_id: TaskId::new(7),
            api_id: ApiId::new("create.web").unwrap(),
            attempts: 3,
            error: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("create.web"));
        assert!(msg.contains("boom"));
    }
}
