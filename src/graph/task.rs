//! Task-graph task variants
//!
//! Three kinds of API-level tasks: an [`OperationTask`] does real work
//! against an actor, a [`StubTask`] is a join/fan-out anchor with no work,
//! and a [`WorkflowTask`] nests a whole task graph that compiles into its
//! own start/end-marker subgraph.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as Json;

use crate::graph::TaskGraph;
use crate::ids::ApiId;
use crate::model::ActorRef;

/// A task that runs an operation implementation against an actor
#[derive(Debug, Clone)]
pub struct OperationTask {
    pub id: ApiId,
    /// Human-readable name for logs
    pub name: String,
    pub actor: ActorRef,
    /// Dotted path resolved by the executor's operation registry
    pub operation_mapping: String,
    /// Inputs, already function-evaluated at plan time
    pub inputs: BTreeMap<String, Json>,
    /// Dispatch budget: first attempt plus retries
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Requested backend; None means the engine default
    pub executor: Option<String>,
}

impl OperationTask {
    pub fn new(
        name: impl Into<String>,
        actor: ActorRef,
        operation_mapping: impl Into<String>,
    ) -> Self {
        let name = name.into();
        OperationTask {
            id: ApiId::generate(&name),
            name,
            actor,
            operation_mapping: operation_mapping.into(),
            inputs: BTreeMap::new(),
            max_attempts: 1,
            retry_interval: Duration::ZERO,
            executor: None,
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, Json>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_attempts = max_retries + 1;
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }
}

/// A task with no implementation; keeps dependency edges expressible when a
/// logical unit has no work
#[derive(Debug, Clone)]
pub struct StubTask {
    pub id: ApiId,
    pub name: String,
}

impl StubTask {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        StubTask {
            id: ApiId::generate(&name),
            name,
        }
    }
}

/// A nested task graph; compiled into its own marker-framed subgraph
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub graph: TaskGraph,
}

impl WorkflowTask {
    pub fn new(graph: TaskGraph) -> Self {
        WorkflowTask { graph }
    }

    pub fn id(&self) -> &ApiId {
        self.graph.id()
    }
}

/// Any task addable to a [`TaskGraph`]
#[derive(Debug, Clone)]
pub enum ApiTask {
    Operation(OperationTask),
    Stub(StubTask),
    Workflow(WorkflowTask),
}

impl ApiTask {
    pub fn id(&self) -> &ApiId {
        match self {
            ApiTask::Operation(t) => &t.id,
            ApiTask::Stub(t) => &t.id,
            ApiTask::Workflow(t) => t.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ApiTask::Operation(t) => &t.name,
            ApiTask::Stub(t) => &t.name,
            ApiTask::Workflow(t) => t.graph.name(),
        }
    }
}

impl From<OperationTask> for ApiTask {
    fn from(task: OperationTask) -> Self {
        ApiTask::Operation(task)
    }
}

impl From<StubTask> for ApiTask {
    fn from(task: StubTask) -> Self {
        ApiTask::Stub(task)
    }
}

impl From<WorkflowTask> for ApiTask {
    fn from(task: WorkflowTask) -> Self {
        ApiTask::Workflow(task)
    }
}

impl From<TaskGraph> for ApiTask {
    fn from(graph: TaskGraph) -> Self {
        ApiTask::Workflow(WorkflowTask::new(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;

    #[test]
    fn operation_task_builder() {
        let task = OperationTask::new("create web_1", ActorRef::Node(NodeId::new(1)), "web.create")
            .with_retry(2, Duration::from_millis(10))
            .with_executor("thread-pool");

        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.retry_interval, Duration::from_millis(10));
        assert_eq!(task.executor.as_deref(), Some("thread-pool"));
        assert!(task.id.as_str().starts_with("create_web_1."));
    }

    #[test]
    fn api_task_exposes_id_and_name() {
        let stub = StubTask::new("anchor");
        let id = stub.id.clone();
        let task: ApiTask = stub.into();
        assert_eq!(task.id(), &id);
        assert_eq!(task.name(), "anchor");
    }
}
