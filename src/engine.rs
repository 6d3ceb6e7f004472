//! The workflow engine
//!
//! A single-threaded cooperative driver: each iteration consumes lifecycle
//! signals from the bus, retires ended tasks, dispatches whatever became
//! ready, and sleeps briefly. Parallelism lives entirely in the executor.
//! A task failure after its retry budget is fatal - in-flight tasks drain,
//! nothing new dispatches, and the execution ends in `failed`. Cancellation
//! is cooperative: an external caller flips the execution to `cancelling`
//! and the engine winds down between iterations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::Receiver;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, instrument, warn};

use crate::context::{OperationContext, WorkflowContext};
use crate::errors::{EngineError, StorageError};
use crate::events::{Event, EventBus, EventKind};
use crate::executor::{Executor, ExecutorTask};
use crate::ids::{ExecutionId, TaskId};
use crate::model::{ExecutionStatus, TaskModel, TaskStatus};
use crate::storage::ModelStorage;

/// Pause between scheduling iterations
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Flip an execution to `cancelling`; the engine notices between iterations
pub fn request_cancel(model: &ModelStorage, execution_id: ExecutionId) -> Result<(), StorageError> {
    let mut execution = model.execution(execution_id)?;
    if !execution.status.is_terminal() {
        execution.status = ExecutionStatus::Cancelling;
        model.executions().update(&execution)?;
    }
    Ok(())
}

/// In-memory mirror of the execution graph's live tasks
///
/// Owned and mutated only by the engine thread. Edges point from dependent
/// to dependency; a task is ready when its dependency set is drained.
struct ExecutionGraph {
    alive: FxHashSet<TaskId>,
    dependencies: FxHashMap<TaskId, FxHashSet<TaskId>>,
    /// Sorted snapshot for deterministic iteration
    order: Vec<TaskId>,
}

impl ExecutionGraph {
    fn new(tasks: &[TaskModel]) -> Self {
        let alive: FxHashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let dependencies = tasks
            .iter()
            .map(|t| (t.id, t.dependencies.iter().copied().collect()))
            .collect();
        let mut order: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        order.sort_unstable();
        ExecutionGraph {
            alive,
            dependencies,
            order,
        }
    }

    fn contains(&self, id: TaskId) -> bool {
        self.alive.contains(&id)
    }

    fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Ready: no unresolved dependencies remain
    fn is_ready(&self, id: TaskId) -> bool {
        self.dependencies
            .get(&id)
            .map(|deps| deps.is_empty())
            .unwrap_or(true)
    }

    /// Retire a satisfied task, unblocking its dependents
    fn remove(&mut self, id: TaskId) {
        self.alive.remove(&id);
        self.order.retain(|t| *t != id);
        for deps in self.dependencies.values_mut() {
            deps.remove(&id);
        }
    }

    fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().copied()
    }
}

/// How a run loop ended
enum Outcome {
    Succeeded,
    Cancelled,
    Failed {
        task_id: TaskId,
        error: String,
    },
}

/// The cooperative workflow driver
pub struct Engine {
    ctx: WorkflowContext,
    executor: Arc<dyn Executor>,
    bus: EventBus,
    events_rx: Receiver<Event>,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(
        ctx: WorkflowContext,
        executor: Arc<dyn Executor>,
        bus: EventBus,
        events_rx: Receiver<Event>,
    ) -> Self {
        Engine {
            ctx,
            executor,
            bus,
            events_rx,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the scheduling pause (tests use a tight loop)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Drive the compiled execution graph to completion
    #[instrument(skip(self), fields(execution = %self.ctx.execution_id))]
    pub fn execute(&mut self) -> Result<(), EngineError> {
        let model = self.ctx.model().clone();
        let tasks = model.execution_tasks(self.ctx.execution_id)?;
        let mut graph = ExecutionGraph::new(&tasks);

        let mut execution = self.ctx.execution()?;
        execution.status = ExecutionStatus::Started;
        execution.started_at = Some(Utc::now());
        model.executions().update(&execution)?;
        self.bus.emit(EventKind::WorkflowStarted {
            execution_id: self.ctx.execution_id,
        });
        info!(workflow = %execution.workflow_name, "workflow started");

        let outcome = self.run_loop(&model, &mut graph)?;

        let mut execution = self.ctx.execution()?;
        execution.ended_at = Some(Utc::now());
        match outcome {
            Outcome::Succeeded => {
                execution.status = ExecutionStatus::Succeeded;
                model.executions().update(&execution)?;
                self.bus.emit(EventKind::WorkflowSucceeded {
                    execution_id: self.ctx.execution_id,
                });
                info!("workflow succeeded");
                Ok(())
            }
            Outcome::Cancelled => {
                self.teardown(&model, &graph)?;
                execution.status = ExecutionStatus::Cancelled;
                model.executions().update(&execution)?;
                self.bus.emit(EventKind::WorkflowCancelled {
                    execution_id: self.ctx.execution_id,
                });
                self.executor.close();
                info!("workflow cancelled");
                Err(EngineError::Cancelled)
            }
            Outcome::Failed { task_id, error } => {
                self.teardown(&model, &graph)?;
                let task = model.task(task_id)?;
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(format!("task '{}': {}", task.api_id, error));
                model.executions().update(&execution)?;
                self.bus.emit(EventKind::WorkflowFailed {
                    execution_id: self.ctx.execution_id,
                    error: error.clone(),
                    failed_task: Some(task_id),
                });
                warn!(task = %task.api_id, %error, "workflow failed");
                Err(EngineError::TaskFailed {
                    task_id,
                    api_id: task.api_id,
                    attempts: task.attempts,
                    error,
                })
            }
        }
    }

    fn run_loop(
        &self,
        model: &ModelStorage,
        graph: &mut ExecutionGraph,
    ) -> Result<Outcome, EngineError> {
        let mut in_flight: FxHashSet<TaskId> = FxHashSet::default();
        let mut fatal: Option<Outcome> = None;
        let mut dispatched_any = false;

        loop {
            self.consume_events(model, graph, &mut in_flight)?;
            self.handle_ended_tasks(model, graph, &mut fatal)?;

            let cancelling = self.is_cancelling(model)?;

            if fatal.is_none() && !cancelling {
                let newly_dispatched =
                    self.dispatch_ready_tasks(model, graph, &mut in_flight)?;
                if newly_dispatched && !dispatched_any {
                    dispatched_any = true;
                    let mut execution = self.ctx.execution()?;
                    execution.status = ExecutionStatus::InProgress;
                    model.executions().update(&execution)?;
                }
            }

            if cancelling && in_flight.is_empty() {
                return Ok(Outcome::Cancelled);
            }
            if let Some(outcome) = fatal.take() {
                if in_flight.is_empty() {
                    return Ok(outcome);
                }
                // Keep draining in-flight tasks before surfacing the failure
                fatal = Some(outcome);
            }
            if graph.is_empty() {
                return Ok(Outcome::Succeeded);
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    /// Apply lifecycle signals to the persisted task rows
    fn consume_events(
        &self,
        model: &ModelStorage,
        graph: &ExecutionGraph,
        in_flight: &mut FxHashSet<TaskId>,
    ) -> Result<(), EngineError> {
        for event in self.events_rx.try_iter() {
            let Some(task_id) = event.kind.task_id() else {
                continue;
            };
            if !graph.contains(task_id) {
                continue;
            }
            let mut task = model.task(task_id)?;
            match &event.kind {
                EventKind::TaskStarted { .. } => {
                    task.status = TaskStatus::Started;
                    model.tasks().update(&task)?;
                }
                EventKind::TaskSucceeded { .. } => {
                    task.status = TaskStatus::Succeeded;
                    model.tasks().update(&task)?;
                    in_flight.remove(&task_id);
                }
                EventKind::TaskFailed { error, .. } => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.clone());
                    model.tasks().update(&task)?;
                    in_flight.remove(&task_id);
                }
                // TaskSent is emitted by this engine
                _ => {}
            }
        }
        Ok(())
    }

    /// Retire succeeded tasks; schedule retries or abort on failures
    fn handle_ended_tasks(
        &self,
        model: &ModelStorage,
        graph: &mut ExecutionGraph,
        fatal: &mut Option<Outcome>,
    ) -> Result<(), EngineError> {
        let ended: Vec<TaskId> = graph.iter().collect();
        for task_id in ended {
            let mut task = model.task(task_id)?;
            match task.status {
                TaskStatus::Succeeded => {
                    debug!(task = %task.api_id, "task succeeded");
                    graph.remove(task_id);
                }
                TaskStatus::Failed if task.has_retries_left() => {
                    debug!(
                        task = %task.api_id,
                        attempt = task.attempts,
                        "task failed, scheduling retry"
                    );
                    task.status = TaskStatus::Retrying;
                    model.tasks().update(&task)?;
                    task.status = TaskStatus::Pending;
                    task.eta = Utc::now()
                        + chrono::Duration::from_std(task.retry_interval)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    model.tasks().update(&task)?;
                }
                TaskStatus::Failed => {
                    if fatal.is_none() {
                        *fatal = Some(Outcome::Failed {
                            task_id,
                            error: task
                                .error
                                .clone()
                                .unwrap_or_else(|| "task failed".to_string()),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Dispatch every pending, due, dependency-free task
    fn dispatch_ready_tasks(
        &self,
        model: &ModelStorage,
        graph: &mut ExecutionGraph,
        in_flight: &mut FxHashSet<TaskId>,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let mut progressed = true;
        let mut dispatched = false;

        // Stub completion can unblock further stubs within one iteration
        while progressed {
            progressed = false;
            let candidates: Vec<TaskId> = graph
                .iter()
                .filter(|id| graph.is_ready(*id) && !in_flight.contains(id))
                .collect();

            for task_id in candidates {
                let mut task = model.task(task_id)?;
                if !task.is_due(now) {
                    continue;
                }

                if task.is_stub() {
                    // Markers and stubs complete without touching an executor
                    task.status = TaskStatus::Succeeded;
                    model.tasks().update(&task)?;
                    graph.remove(task_id);
                    progressed = true;
                    continue;
                }

                task.attempts += 1;
                task.status = TaskStatus::Sent;
                model.tasks().update(&task)?;
                self.bus.emit(EventKind::TaskSent { task_id });
                debug!(task = %task.api_id, attempt = task.attempts, "dispatching task");

                let executor_task = self.executor_task(&task);
                if let Err(err) = self.executor.execute(executor_task) {
                    // Executor refusals count as a failed attempt
                    task.status = TaskStatus::Failed;
                    task.error = Some(err.to_string());
                    model.tasks().update(&task)?;
                } else {
                    in_flight.insert(task_id);
                }
                dispatched = true;
            }
        }
        Ok(dispatched)
    }

    fn executor_task(&self, task: &TaskModel) -> ExecutorTask {
        ExecutorTask {
            task_id: task.id,
            operation_mapping: task.operation_mapping.clone().unwrap_or_default(),
            context: OperationContext::new(
                task.name.clone(),
                self.ctx.service_id,
                task.id,
                task.actor.expect("operation tasks carry an actor"),
                task.inputs.clone(),
                Some(self.ctx.model().clone()),
                self.ctx.resource().cloned(),
            ),
        }
    }

    fn is_cancelling(&self, model: &ModelStorage) -> Result<bool, EngineError> {
        Ok(model.execution(self.ctx.execution_id)?.status == ExecutionStatus::Cancelling)
    }

    /// Teardown on fatal failure or cancellation: rows that never reached an
    /// end state are deleted, ended rows stay queryable
    fn teardown(&self, model: &ModelStorage, graph: &ExecutionGraph) -> Result<(), EngineError> {
        for task_id in graph.iter() {
            let task = model.task(task_id)?;
            if !task.status.has_ended() {
                model.tasks().delete(task_id.get())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ApiId;
    use crate::model::StubType;

    fn stub_row(id: u64, deps: Vec<TaskId>) -> TaskModel {
        let mut task = TaskModel::stub(
            ExecutionId::new(1),
            ApiId::new(format!("t{}", id)).unwrap(),
            StubType::Stub,
            deps,
        );
        task.id = TaskId::new(id);
        task
    }

    #[test]
    fn graph_readiness_follows_dependencies() {
        let rows = vec![
            stub_row(1, vec![]),
            stub_row(2, vec![TaskId::new(1)]),
            stub_row(3, vec![TaskId::new(1), TaskId::new(2)]),
        ];
        let mut graph = ExecutionGraph::new(&rows);

        assert!(graph.is_ready(TaskId::new(1)));
        assert!(!graph.is_ready(TaskId::new(2)));
        assert!(!graph.is_ready(TaskId::new(3)));

        graph.remove(TaskId::new(1));
        assert!(graph.is_ready(TaskId::new(2)));
        assert!(!graph.is_ready(TaskId::new(3)));

        graph.remove(TaskId::new(2));
        assert!(graph.is_ready(TaskId::new(3)));
        assert!(!graph.is_empty());

        graph.remove(TaskId::new(3));
        assert!(graph.is_empty());
    }

    #[test]
    fn request_cancel_only_touches_live_executions() {
        use crate::ids::ServiceId;
        use crate::model::Execution;

        let model = ModelStorage::in_memory();
        let mut execution = Execution::new(ServiceId::new(1), "install");
        execution.status = ExecutionStatus::Succeeded;
        let id = ExecutionId::new(model.executions().put(execution).unwrap());

        request_cancel(&model, id).unwrap();
        assert_eq!(
            model.execution(id).unwrap().status,
            ExecutionStatus::Succeeded
        );

        let live = ExecutionId::new(
            model
                .executions()
                .put(Execution::new(ServiceId::new(1), "install"))
                .unwrap(),
        );
        request_cancel(&model, live).unwrap();
        assert_eq!(
            model.execution(live).unwrap().status,
            ExecutionStatus::Cancelling
        );
    }
}
