//! Execution entities
//!
//! One [`Execution`] row per workflow invocation and one [`TaskModel`] row
//! per execution-graph node. Status values persist as lowercase strings so
//! every process observing the storage reads the same vocabulary.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ids::{ApiId, ExecutionId, NodeId, RelationshipId, ServiceId, TaskId};

// ============================================================================
// EXECUTION
// ============================================================================

/// Status of a workflow invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Started,
    #[serde(rename = "in-progress")]
    InProgress,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// A single invocation of a workflow over a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub service_id: ServiceId,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub inputs: BTreeMap<String, Json>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Single error summary when the execution ended in `failed`
    #[serde(default)]
    pub error: Option<String>,
}

impl Execution {
    pub fn new(service_id: ServiceId, workflow_name: impl Into<String>) -> Self {
        Execution {
            id: ExecutionId::new(0),
            service_id,
            workflow_name: workflow_name.into(),
            status: ExecutionStatus::Pending,
            inputs: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

// ============================================================================
// TASK
// ============================================================================

/// Status of an execution-graph task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Retrying,
    Sent,
    Started,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// End states: nothing further will happen to this attempt
    pub fn has_ended(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Marker/stub discriminator for execution-graph tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubType {
    /// A real operation task
    None,
    StartWorkflow,
    EndWorkflow,
    StartSubworkflow,
    EndSubworkflow,
    /// A join/fan-out anchor with no work
    Stub,
}

impl StubType {
    pub fn is_marker(self) -> bool {
        !matches!(self, StubType::None)
    }
}

/// What kind of model entity an operation task acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Node,
    Relationship,
}

/// Weak reference to a task's actor; the actor outlives any execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum ActorRef {
    Node(NodeId),
    Relationship(RelationshipId),
}

impl ActorRef {
    pub fn kind(self) -> ActorKind {
        match self {
            ActorRef::Node(_) => ActorKind::Node,
            ActorRef::Relationship(_) => ActorKind::Relationship,
        }
    }

    pub fn raw_id(self) -> u64 {
        match self {
            ActorRef::Node(id) => id.get(),
            ActorRef::Relationship(id) => id.get(),
        }
    }
}

/// One persisted row per execution-graph node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModel {
    pub id: TaskId,
    pub execution_id: ExecutionId,
    /// Stable user-facing id, including `-Start`/`-End` suffixes for markers
    pub api_id: ApiId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actor: Option<ActorRef>,
    #[serde(default)]
    pub operation_mapping: Option<String>,
    /// Resolved inputs; plain JSON by the time a task is persisted
    #[serde(default)]
    pub inputs: BTreeMap<String, Json>,
    pub status: TaskStatus,
    /// Dispatch count; incremented when the task is sent
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, with = "retry_secs")]
    pub retry_interval: Duration,
    /// Not-before timestamp; pushed forward on retry
    pub eta: DateTime<Utc>,
    pub stub_type: StubType,
    /// Tasks this one waits on
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Requested backend; None means the engine default
    #[serde(default)]
    pub executor: Option<String>,
    /// Error message of the most recent failed attempt
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskModel {
    /// A marker or join stub: no operation, completes instantly
    pub fn stub(
        execution_id: ExecutionId,
        api_id: ApiId,
        stub_type: StubType,
        dependencies: Vec<TaskId>,
    ) -> Self {
        TaskModel {
            id: TaskId::new(0),
            execution_id,
            name: api_id.to_string(),
            api_id,
            actor: None,
            operation_mapping: None,
            inputs: BTreeMap::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 1,
            retry_interval: Duration::ZERO,
            eta: Utc::now(),
            stub_type,
            dependencies,
            executor: None,
            error: None,
        }
    }

    /// True while the task may still be dispatched again after a failure
    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_stub(&self) -> bool {
        self.stub_type.is_marker()
    }

    /// Due for dispatch: pending and past its not-before time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.eta <= now
    }
}

mod retry_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelling).unwrap(),
            "\"cancelling\""
        );
        let parsed: ExecutionStatus = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::Succeeded);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Cancelling.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn task_status_end_states() {
        assert!(TaskStatus::Succeeded.has_ended());
        assert!(TaskStatus::Failed.has_ended());
        assert!(!TaskStatus::Retrying.has_ended());
        assert!(!TaskStatus::Sent.has_ended());
    }

    #[test]
    fn stub_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StubType::StartWorkflow).unwrap(),
            "\"start_workflow\""
        );
        assert_eq!(
            serde_json::to_string(&StubType::EndSubworkflow).unwrap(),
            "\"end_subworkflow\""
        );
    }

    #[test]
    fn stub_task_completes_without_retries() {
        let task = TaskModel::stub(
            ExecutionId::new(1),
            ApiId::new("wf").unwrap().start_marker(),
            StubType::StartWorkflow,
            vec![],
        );
        assert!(task.is_stub());
        assert_eq!(task.max_attempts, 1);
        assert!(task.has_retries_left());
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn actor_ref_kind_and_raw_id() {
        let actor = ActorRef::Node(NodeId::new(5));
        assert_eq!(actor.kind(), ActorKind::Node);
        assert_eq!(actor.raw_id(), 5);

        let actor = ActorRef::Relationship(RelationshipId::new(9));
        assert_eq!(actor.kind(), ActorKind::Relationship);
        assert_eq!(actor.raw_id(), 9);
    }
}
