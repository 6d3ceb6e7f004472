//! Builtin execute_operation workflow

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::info;

use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::{StubTask, TaskGraph};
use crate::ids::{ApiId, NodeId};
use crate::model::Node;

/// Parameters of the execute_operation workflow
#[derive(Debug, Clone, Default)]
pub struct ExecuteOperationParams {
    /// Operation to run, as `interface.operation`
    pub operation: String,
    /// Extra inputs merged into the operation's declared inputs
    pub kwargs: BTreeMap<String, Json>,
    /// Whether kwargs may replace declared inputs
    pub allow_override: bool,
    /// Mirror the relationship graph with inter-task dependencies
    pub in_dep_order: bool,
    /// Keep only nodes whose type hierarchy matches one of these
    pub type_filter: Vec<String>,
    /// Keep only instances of these templates
    pub node_template_names: Vec<String>,
    /// Keep only these node instances
    pub node_instance_ids: Vec<NodeId>,
}

impl ExecuteOperationParams {
    pub fn new(operation: impl Into<String>) -> Self {
        ExecuteOperationParams {
            operation: operation.into(),
            ..Default::default()
        }
    }

    fn matches(&self, node: &Node) -> bool {
        let by_template = self.node_template_names.is_empty()
            || self.node_template_names.contains(&node.template_name);
        let by_instance =
            self.node_instance_ids.is_empty() || self.node_instance_ids.contains(&node.id);
        let by_type =
            self.type_filter.is_empty() || self.type_filter.iter().any(|t| node.is_of_type(t));
        by_template && by_instance && by_type
    }
}

/// Run one operation across the matching node instances
///
/// With `in_dep_order`, non-matching instances get stub tasks so the
/// relationship graph's ordering is expressible without doing their work.
pub fn execute_operation(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    params: &ExecuteOperationParams,
) -> Result<(), WorkflowError> {
    let nodes = ctx.nodes()?;
    let matching: Vec<&Node> = nodes.iter().filter(|n| params.matches(n)).collect();

    let mut tasks: FxHashMap<NodeId, ApiId> = FxHashMap::default();

    if params.in_dep_order {
        for node in &nodes {
            if !params.matches(node) {
                let stub = StubTask::new(format!("execute_operation_stub_{}", node.name));
                tasks.insert(node.id, graph.add_task(stub)?);
            }
        }
    }

    for node in &matching {
        let task = ctx.operation_task_with_inputs(
            node,
            &params.operation,
            &params.kwargs,
            params.allow_override,
        )?;
        tasks.insert(node.id, graph.add_task(task)?);
    }

    if params.in_dep_order {
        for node in &nodes {
            let dependent = tasks[&node.id].clone();
            for rel_id in &node.relationship_ids {
                let relationship = ctx.model().relationship(*rel_id)?;
                if let Some(dependency) = tasks.get(&relationship.target_id) {
                    graph.add_dependency(&dependent, dependency)?;
                }
            }
        }
    }

    info!(
        operation = %params.operation,
        matched = matching.len(),
        "execute_operation workflow built"
    );
    Ok(())
}
