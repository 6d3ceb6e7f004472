//! Builtin uninstall workflow

use tracing::info;

use crate::builtin::lifecycle::{uninstall_node, NodeSubWorkflows};
use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::TaskGraph;
use crate::model::Node;

/// Uninstall every node of the service
///
/// Symmetric and reverse to install: a relationship target's sub-workflow
/// waits for its sources, so a node is taken down only after everything
/// that depends on it is gone.
pub fn uninstall(ctx: &WorkflowContext, graph: &mut TaskGraph) -> Result<(), WorkflowError> {
    let nodes = ctx.nodes()?;
    let mut sub_workflows = NodeSubWorkflows::default();
    uninstall_nodes(ctx, graph, &nodes, &mut sub_workflows)
}

/// Uninstall a chosen subset of nodes (see install_nodes for the seeding
/// convention)
pub(crate) fn uninstall_nodes(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    nodes: &[Node],
    sub_workflows: &mut NodeSubWorkflows,
) -> Result<(), WorkflowError> {
    for node in nodes {
        let sub_workflow = uninstall_node(ctx, node)?;
        let id = graph.add_task(sub_workflow)?;
        sub_workflows.insert(node.id, id);
    }

    // Reversed edges: the target waits for the source
    for node in nodes {
        let source_wf = sub_workflows[&node.id].clone();
        for rel_id in node.relationship_ids.iter().rev() {
            let relationship = ctx.model().relationship(*rel_id)?;
            if let Some(target_wf) = sub_workflows.get(&relationship.target_id) {
                graph.add_dependency(target_wf, &source_wf)?;
            }
        }
    }

    info!(nodes = nodes.len(), "uninstall workflow built");
    Ok(())
}
