//! Workflow context
//!
//! Handed to every workflow function together with an empty task graph.
//! Wraps the storages and the execution/service ids, and builds operation
//! tasks with their inputs already function-evaluated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tracing::debug;

use crate::errors::{StorageError, WorkflowError};
use crate::graph::{OperationTask, TaskGraph};
use crate::ids::{ExecutionId, ServiceId};
use crate::model::functions::{self, Scope};
use crate::model::{
    ActorRef, Execution, ModelValue, Node, Operation, Relationship, Service,
};
use crate::storage::{ModelStorage, ResourceStorage};

/// Context of one workflow invocation
#[derive(Clone)]
pub struct WorkflowContext {
    pub name: String,
    pub service_id: ServiceId,
    pub execution_id: ExecutionId,
    model: ModelStorage,
    resource: Option<Arc<dyn ResourceStorage>>,
    /// Dispatch budget for operations that do not declare retries
    pub default_max_attempts: u32,
    pub default_retry_interval: Duration,
}

impl WorkflowContext {
    pub fn new(
        name: impl Into<String>,
        model: ModelStorage,
        resource: Option<Arc<dyn ResourceStorage>>,
        service_id: ServiceId,
        execution_id: ExecutionId,
    ) -> Self {
        WorkflowContext {
            name: name.into(),
            service_id,
            execution_id,
            model,
            resource,
            default_max_attempts: 1,
            default_retry_interval: Duration::ZERO,
        }
    }

    pub fn model(&self) -> &ModelStorage {
        &self.model
    }

    pub fn resource(&self) -> Option<&Arc<dyn ResourceStorage>> {
        self.resource.as_ref()
    }

    pub fn service(&self) -> Result<Service, StorageError> {
        self.model.service(self.service_id)
    }

    pub fn execution(&self) -> Result<Execution, StorageError> {
        self.model.execution(self.execution_id)
    }

    /// The service's member nodes in instantiation order
    pub fn nodes(&self) -> Result<Vec<Node>, StorageError> {
        let service = self.service()?;
        self.model.service_nodes(&service)
    }

    /// A fresh named sub-graph
    pub fn task_graph(&self, name: impl Into<String>) -> TaskGraph {
        TaskGraph::new(name)
    }

    // ------------------------------------------------------------------
    // Operation-task builders
    // ------------------------------------------------------------------

    /// Build an operation task for a node operation (`interface.operation`)
    pub fn operation_task(
        &self,
        node: &Node,
        operation_name: &str,
    ) -> Result<OperationTask, WorkflowError> {
        let operation =
            node.operation(operation_name)
                .ok_or_else(|| WorkflowError::MissingOperation {
                    node: node.name.clone(),
                    operation: operation_name.to_string(),
                })?;
        let service = self.service()?;
        let scope = Scope::node(&self.model, &service, node.id);
        self.build_task(
            format!("{}.{}", operation_name, node.name),
            ActorRef::Node(node.id),
            operation,
            &scope,
            None,
        )
    }

    /// Node operation task with caller-supplied input overrides
    pub fn operation_task_with_inputs(
        &self,
        node: &Node,
        operation_name: &str,
        overrides: &BTreeMap<String, Json>,
        allow_override: bool,
    ) -> Result<OperationTask, WorkflowError> {
        let operation =
            node.operation(operation_name)
                .ok_or_else(|| WorkflowError::MissingOperation {
                    node: node.name.clone(),
                    operation: operation_name.to_string(),
                })?;
        if !allow_override {
            if let Some(conflict) = overrides.keys().find(|k| operation.inputs.contains_key(*k)) {
                return Err(WorkflowError::InvalidInput {
                    name: conflict.clone(),
                    reason: "overriding a declared operation input requires allow_override"
                        .to_string(),
                });
            }
        }
        let service = self.service()?;
        let scope = Scope::node(&self.model, &service, node.id);
        self.build_task(
            format!("{}.{}", operation_name, node.name),
            ActorRef::Node(node.id),
            operation,
            &scope,
            Some(overrides),
        )
    }

    /// Source-side relationship operation task
    pub fn relationship_source_task(
        &self,
        relationship: &Relationship,
        operation_name: &str,
    ) -> Result<OperationTask, WorkflowError> {
        let operation = relationship
            .source_operation(operation_name)
            .ok_or_else(|| WorkflowError::MissingOperation {
                node: relationship.name.clone(),
                operation: operation_name.to_string(),
            })?;
        let service = self.service()?;
        let scope = Scope::relationship(&self.model, &service, relationship.id);
        self.build_task(
            format!("{}.source.{}", operation_name, relationship.name),
            ActorRef::Relationship(relationship.id),
            operation,
            &scope,
            None,
        )
    }

    /// Target-side relationship operation task
    pub fn relationship_target_task(
        &self,
        relationship: &Relationship,
        operation_name: &str,
    ) -> Result<OperationTask, WorkflowError> {
        let operation = relationship
            .target_operation(operation_name)
            .ok_or_else(|| WorkflowError::MissingOperation {
                node: relationship.name.clone(),
                operation: operation_name.to_string(),
            })?;
        let service = self.service()?;
        let scope = Scope::relationship(&self.model, &service, relationship.id);
        self.build_task(
            format!("{}.target.{}", operation_name, relationship.name),
            ActorRef::Relationship(relationship.id),
            operation,
            &scope,
            None,
        )
    }

    fn build_task(
        &self,
        name: String,
        actor: ActorRef,
        operation: &Operation,
        scope: &Scope<'_>,
        overrides: Option<&BTreeMap<String, Json>>,
    ) -> Result<OperationTask, WorkflowError> {
        let implementation = operation.implementation.clone().ok_or_else(|| {
            WorkflowError::MissingOperation {
                node: name.clone(),
                operation: operation.name.clone(),
            }
        })?;

        let mut inputs = BTreeMap::new();
        for (key, value) in &operation.inputs {
            inputs.insert(key.clone(), resolve_input(value, scope)?);
        }
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                inputs.insert(key.clone(), value.clone());
            }
        }

        let (max_attempts, retry_interval) = if operation.max_retries > 0 {
            (operation.max_attempts(), operation.retry_interval)
        } else {
            (self.default_max_attempts, self.default_retry_interval)
        };

        debug!(task = %name, mapping = %implementation, "built operation task");
        let mut task = OperationTask::new(name, actor, implementation).with_inputs(inputs);
        task.max_attempts = max_attempts;
        task.retry_interval = retry_interval;
        task.executor = operation.executor.clone();
        Ok(task)
    }
}

/// Plan-time input resolution: evaluation misses keep the raw function form
/// so the operation can resolve them at run time
fn resolve_input(value: &ModelValue, scope: &Scope<'_>) -> Result<Json, WorkflowError> {
    match functions::evaluate(value, scope) {
        Ok(Some(evaluation)) => Ok(evaluation.value),
        Ok(None) => Ok(value.to_raw()),
        Err(err) if err.is_cannot_evaluate() => Ok(value.to_raw()),
        Err(err) => Err(err.into()),
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("name", &self.name)
            .field("service_id", &self.service_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}
