//! Builtin install workflow

use tracing::info;

use crate::builtin::lifecycle::{depend_on_targets, install_node, NodeSubWorkflows};
use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::TaskGraph;
use crate::model::Node;

/// Install every node of the service
///
/// Each node gets its install sub-workflow; a node's sub-workflow waits for
/// the sub-workflows of all its relationship targets, so providers come up
/// before their consumers.
pub fn install(ctx: &WorkflowContext, graph: &mut TaskGraph) -> Result<(), WorkflowError> {
    let nodes = ctx.nodes()?;
    let mut sub_workflows = NodeSubWorkflows::default();
    install_nodes(ctx, graph, &nodes, &mut sub_workflows)
}

/// Install a chosen subset of nodes
///
/// `sub_workflows` may arrive pre-seeded with stub sub-workflows for nodes
/// outside the subset (heal and scale use this), so cross-set dependency
/// edges still have something to attach to.
pub(crate) fn install_nodes(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    nodes: &[Node],
    sub_workflows: &mut NodeSubWorkflows,
) -> Result<(), WorkflowError> {
    for node in nodes {
        let sub_workflow = install_node(ctx, node)?;
        let id = graph.add_task(sub_workflow)?;
        sub_workflows.insert(node.id, id);
    }

    for node in nodes {
        let dependent = sub_workflows[&node.id].clone();
        depend_on_targets(ctx, graph, node, &dependent, sub_workflows)?;
    }

    info!(nodes = nodes.len(), "install workflow built");
    Ok(())
}
