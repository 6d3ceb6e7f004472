//! Compilation of an API task graph into an execution graph
//!
//! Every (sub)workflow gets a unique start marker and a unique end marker;
//! nested workflow tasks expand recursively, their end marker standing in
//! for them in the parent graph. Each execution-graph node is persisted as
//! a task row before the engine ever runs. The end marker's dependency set
//! is computed over the tasks created by the current call only, so a
//! recursive sub-workflow can never capture its parent's tasks.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::context::WorkflowContext;
use crate::errors::StorageError;
use crate::graph::{ApiTask, TaskGraph};
use crate::ids::{ApiId, ExecutionId, TaskId};
use crate::model::{StubType, TaskModel, TaskStatus};
use crate::storage::ModelStorage;

/// The persisted shape of one compiled workflow
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub start: TaskId,
    pub end: TaskId,
    /// Every task created by the compilation, in persistence order
    pub task_ids: Vec<TaskId>,
}

/// Compile the root graph of an execution and persist its tasks
pub fn create_execution_tasks(
    ctx: &WorkflowContext,
    graph: &TaskGraph,
) -> Result<CompiledWorkflow, StorageError> {
    let mut created = Vec::new();
    let frame = construct(
        ctx.model(),
        ctx.execution_id,
        graph,
        StubType::StartWorkflow,
        StubType::EndWorkflow,
        Vec::new(),
        &mut created,
    )?;
    debug!(
        execution = %ctx.execution_id,
        tasks = created.len(),
        "compiled execution graph"
    );
    Ok(CompiledWorkflow {
        start: frame.start,
        end: frame.end,
        task_ids: created,
    })
}

/// Start/end markers of one compiled (sub)graph
struct Frame {
    start: TaskId,
    end: TaskId,
}

fn construct(
    model: &ModelStorage,
    execution_id: ExecutionId,
    graph: &TaskGraph,
    start_stub: StubType,
    end_stub: StubType,
    depends_on: Vec<TaskId>,
    created: &mut Vec<TaskId>,
) -> Result<Frame, StorageError> {
    // Insert the start marker
    let start = persist(
        model,
        created,
        TaskModel::stub(
            execution_id,
            graph.id().start_marker(),
            start_stub,
            depends_on,
        ),
    )?;

    // Representative compiled task per api task: the task itself, or the
    // end marker for a nested workflow
    let mut representative: FxHashMap<ApiId, TaskId> = FxHashMap::default();
    // Tasks created directly by this call, and which of them something in
    // this call depends on; their difference is the sink set
    let mut local: Vec<TaskId> = Vec::new();
    let mut depended_upon: FxHashSet<TaskId> = FxHashSet::default();

    for api_id in graph.topological_order(false) {
        let task = graph.task(&api_id).expect("order only yields graph tasks");

        let mut dependencies: Vec<TaskId> = graph
            .get_dependencies(&api_id)
            .iter()
            .map(|dep| representative[dep])
            .collect();
        if dependencies.is_empty() {
            dependencies.push(start);
        }
        depended_upon.extend(dependencies.iter().copied());

        let compiled = match task {
            ApiTask::Operation(op) => {
                let mut row = TaskModel::stub(
                    execution_id,
                    op.id.clone(),
                    StubType::None,
                    dependencies,
                );
                row.name = op.name.clone();
                row.actor = Some(op.actor);
                row.operation_mapping = Some(op.operation_mapping.clone());
                row.inputs = op.inputs.clone();
                row.max_attempts = op.max_attempts;
                row.retry_interval = op.retry_interval;
                row.executor = op.executor.clone();
                row.status = TaskStatus::Pending;
                persist(model, created, row)?
            }
            ApiTask::Stub(stub) => persist(
                model,
                created,
                TaskModel::stub(execution_id, stub.id.clone(), StubType::Stub, dependencies),
            )?,
            ApiTask::Workflow(workflow) => {
                let frame = construct(
                    model,
                    execution_id,
                    &workflow.graph,
                    StubType::StartSubworkflow,
                    StubType::EndSubworkflow,
                    dependencies,
                    created,
                )?;
                frame.end
            }
        };

        representative.insert(api_id, compiled);
        local.push(compiled);
    }

    // The end marker waits for this call's sinks; an empty graph leaves
    // only the start marker to wait for
    let mut sinks: Vec<TaskId> = local
        .iter()
        .copied()
        .filter(|id| !depended_upon.contains(id))
        .collect();
    if sinks.is_empty() {
        sinks.push(start);
    }

    let end = persist(
        model,
        created,
        TaskModel::stub(execution_id, graph.id().end_marker(), end_stub, sinks),
    )?;

    Ok(Frame { start, end })
}

fn persist(
    model: &ModelStorage,
    created: &mut Vec<TaskId>,
    task: TaskModel,
) -> Result<TaskId, StorageError> {
    let id = TaskId::new(model.tasks().put(task)?);
    created.push(id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{OperationTask, StubTask, WorkflowTask};
    use crate::ids::{NodeId, ServiceId};
    use crate::model::{ActorRef, Execution, Service};

    fn context() -> WorkflowContext {
        let model = ModelStorage::in_memory();
        let service_id = ServiceId::new(model.services().put(Service::new("svc")).unwrap());
        let execution_id = ExecutionId::new(
            model
                .executions()
                .put(Execution::new(service_id, "test"))
                .unwrap(),
        );
        WorkflowContext::new("test", model, None, service_id, execution_id)
    }

    fn op(name: &str) -> OperationTask {
        OperationTask::new(name, ActorRef::Node(NodeId::new(1)), "tests.noop")
    }

    fn task_by_id(ctx: &WorkflowContext, id: TaskId) -> TaskModel {
        ctx.model().task(id).unwrap()
    }

    #[test]
    fn empty_graph_compiles_to_marker_pair() {
        let ctx = context();
        let graph = TaskGraph::new("empty");
        let compiled = create_execution_tasks(&ctx, &graph).unwrap();

        assert_eq!(compiled.task_ids.len(), 2);
        let start = task_by_id(&ctx, compiled.start);
        let end = task_by_id(&ctx, compiled.end);
        assert_eq!(start.stub_type, StubType::StartWorkflow);
        assert_eq!(end.stub_type, StubType::EndWorkflow);
        assert_eq!(end.dependencies, vec![compiled.start]);
        assert!(start.dependencies.is_empty());
        assert!(start.api_id.as_str().ends_with("-Start"));
        assert!(end.api_id.as_str().ends_with("-End"));
    }

    #[test]
    fn operation_rows_preserve_the_api_task() {
        let ctx = context();
        let mut graph = TaskGraph::new("wf");
        let mut task = op("create.web");
        task.inputs
            .insert("port".to_string(), serde_json::json!(8080));
        task.max_attempts = 3;
        let api_id = graph.add_task(task).unwrap();
        let compiled = create_execution_tasks(&ctx, &graph).unwrap();

        assert_eq!(compiled.task_ids.len(), 3);
        let row = ctx
            .model()
            .execution_tasks(ctx.execution_id)
            .unwrap()
            .into_iter()
            .find(|t| t.api_id == api_id)
            .unwrap();
        assert_eq!(row.stub_type, StubType::None);
        assert_eq!(row.operation_mapping.as_deref(), Some("tests.noop"));
        assert_eq!(row.inputs["port"], serde_json::json!(8080));
        assert_eq!(row.max_attempts, 3);
        assert_eq!(row.dependencies, vec![compiled.start]);
    }

    #[test]
    fn dependencies_map_to_compiled_tasks() {
        let ctx = context();
        let mut graph = TaskGraph::new("wf");
        let a = graph.add_task(op("a")).unwrap();
        let b = graph.add_task(op("b")).unwrap();
        graph.add_dependency(&b, &a).unwrap();
        let compiled = create_execution_tasks(&ctx, &graph).unwrap();

        let tasks = ctx.model().execution_tasks(ctx.execution_id).unwrap();
        let row_a = tasks.iter().find(|t| t.api_id == a).unwrap();
        let row_b = tasks.iter().find(|t| t.api_id == b).unwrap();
        let end = tasks.iter().find(|t| t.id == compiled.end).unwrap();

        assert_eq!(row_b.dependencies, vec![row_a.id]);
        // Only the sink feeds the end marker
        assert_eq!(end.dependencies, vec![row_b.id]);
    }

    #[test]
    fn stub_tasks_become_stub_rows() {
        let ctx = context();
        let mut graph = TaskGraph::new("wf");
        graph.add_task(StubTask::new("anchor")).unwrap();
        create_execution_tasks(&ctx, &graph).unwrap();

        let tasks = ctx.model().execution_tasks(ctx.execution_id).unwrap();
        assert!(tasks.iter().any(|t| t.stub_type == StubType::Stub));
    }

    #[test]
    fn nested_workflow_expands_with_subworkflow_markers() {
        let ctx = context();

        let mut inner = TaskGraph::new("inner");
        let inner_op = inner.add_task(op("inner.op")).unwrap();

        let mut root = TaskGraph::new("root");
        let before = root.add_task(op("before")).unwrap();
        let inner_id = root.add_task(WorkflowTask::new(inner)).unwrap();
        let after = root.add_task(op("after")).unwrap();
        root.sequence(&[before.clone(), inner_id.clone(), after.clone()])
            .unwrap();

        let compiled = create_execution_tasks(&ctx, &root).unwrap();
        assert_eq!(compiled.task_ids.len(), 7);

        let tasks = ctx.model().execution_tasks(ctx.execution_id).unwrap();
        let stub_types: Vec<StubType> = tasks.iter().map(|t| t.stub_type).collect();
        assert_eq!(
            stub_types
                .iter()
                .filter(|s| **s == StubType::StartSubworkflow)
                .count(),
            1
        );
        assert_eq!(
            stub_types
                .iter()
                .filter(|s| **s == StubType::EndSubworkflow)
                .count(),
            1
        );
        // Exactly one workflow-level marker pair
        assert_eq!(
            stub_types
                .iter()
                .filter(|s| **s == StubType::StartWorkflow)
                .count(),
            1
        );
        assert_eq!(
            stub_types
                .iter()
                .filter(|s| **s == StubType::EndWorkflow)
                .count(),
            1
        );

        // The sub-workflow's start waits for `before`; `after` waits for the
        // sub-workflow's end marker
        let row_before = tasks.iter().find(|t| t.api_id == before).unwrap();
        let row_after = tasks.iter().find(|t| t.api_id == after).unwrap();
        let sub_start = tasks
            .iter()
            .find(|t| t.stub_type == StubType::StartSubworkflow)
            .unwrap();
        let sub_end = tasks
            .iter()
            .find(|t| t.stub_type == StubType::EndSubworkflow)
            .unwrap();
        let row_inner = tasks.iter().find(|t| t.api_id == inner_op).unwrap();

        assert_eq!(sub_start.dependencies, vec![row_before.id]);
        assert_eq!(row_inner.dependencies, vec![sub_start.id]);
        assert_eq!(sub_end.dependencies, vec![row_inner.id]);
        assert_eq!(row_after.dependencies, vec![sub_end.id]);

        // End-marker scoping: the root end marker waits for `after` only,
        // never for tasks inside the sub-workflow
        let root_end = tasks.iter().find(|t| t.id == compiled.end).unwrap();
        assert_eq!(root_end.dependencies, vec![row_after.id]);
    }

    #[test]
    fn compiled_order_matches_api_topological_order() {
        let ctx = context();
        let mut graph = TaskGraph::new("wf");
        let a = graph.add_task(op("a")).unwrap();
        let b = graph.add_task(op("b")).unwrap();
        let c = graph.add_task(op("c")).unwrap();
        graph.sequence(&[a.clone(), b.clone(), c.clone()]).unwrap();

        create_execution_tasks(&ctx, &graph).unwrap();
        let tasks = ctx.model().execution_tasks(ctx.execution_id).unwrap();

        // Walk non-marker rows in persistence order
        let non_markers: Vec<&ApiId> = tasks
            .iter()
            .filter(|t| t.stub_type == StubType::None)
            .map(|t| &t.api_id)
            .collect();
        let api_order = graph.topological_order(false);
        assert_eq!(non_markers, api_order.iter().collect::<Vec<_>>());
    }
}
