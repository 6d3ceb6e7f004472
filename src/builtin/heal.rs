//! Builtin heal workflow

use rustc_hash::FxHashSet;
use tracing::info;

use crate::builtin::install::install_nodes;
use crate::builtin::lifecycle::{
    relationship_tasks, stub_sub_workflow, NodeSubWorkflows, ESTABLISH, UNLINK,
};
use crate::builtin::uninstall::uninstall_nodes;
use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::TaskGraph;
use crate::ids::NodeId;
use crate::model::Node;

/// Heal a failing node: tear down its containment subgraph, then bring it
/// back up, re-wiring the unchanged peers that point into it
///
/// The subgraph is the failing node's host plus everything transitively
/// hosted on it. Targeted peers (outside the subgraph but related to it)
/// contribute unlink operations on the way down and establish operations on
/// the way back up; their own lifecycles are untouched.
pub fn heal(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    failing_node_id: NodeId,
) -> Result<(), WorkflowError> {
    let model = ctx.model();
    let failing = model.node(failing_node_id)?;
    let host = match failing.host_id {
        Some(host_id) => model.node(host_id)?,
        None => failing,
    };

    let failing_nodes = contained_subgraph(ctx, &host)?;
    let failing_ids: FxHashSet<NodeId> = failing_nodes.iter().map(|n| n.id).collect();
    let targeted_nodes = targeted_peers(ctx, &failing_nodes, &failing_ids)?;

    let down = heal_uninstall(ctx, &failing_nodes, &targeted_nodes, &failing_ids)?;
    let up = heal_install(ctx, &failing_nodes, &targeted_nodes, &failing_ids)?;

    let down_id = graph.add_task(down)?;
    let up_id = graph.add_task(up)?;
    graph.add_dependency(&up_id, &down_id)?;

    info!(
        failing = failing_nodes.len(),
        targeted = targeted_nodes.len(),
        "heal workflow built"
    );
    Ok(())
}

/// The uninstall half: stub sub-workflows for targeted peers, real
/// uninstalls for the failing subgraph, unlink pairs in between
fn heal_uninstall(
    ctx: &WorkflowContext,
    failing_nodes: &[Node],
    targeted_nodes: &[Node],
    failing_ids: &FxHashSet<NodeId>,
) -> Result<crate::graph::WorkflowTask, WorkflowError> {
    let mut graph = ctx.task_graph("heal_uninstall");
    let mut sub_workflows = NodeSubWorkflows::default();

    for node in targeted_nodes {
        let stub = stub_sub_workflow(ctx, format!("uninstall_stub_{}", node.name));
        sub_workflows.insert(node.id, graph.add_task(stub)?);
    }

    uninstall_nodes(ctx, &mut graph, failing_nodes, &mut sub_workflows)?;

    // Unlink the targeted peers from the failing nodes before those nodes
    // are deleted
    for node in targeted_nodes {
        let own_wf = sub_workflows[&node.id].clone();
        for rel_id in node.relationship_ids.iter().rev() {
            let relationship = ctx.model().relationship(*rel_id)?;
            if !failing_ids.contains(&relationship.target_id) {
                continue;
            }
            if let Some(pair) = relationship_tasks(ctx, node, &relationship, UNLINK)? {
                let pair_id = graph.add_task(pair)?;
                // The failing target comes down only after the unlink, and
                // the peer's stub completes after it too
                let target_wf = sub_workflows[&relationship.target_id].clone();
                graph.add_dependency(&target_wf, &pair_id)?;
                graph.add_dependency(&own_wf, &pair_id)?;
            }
        }
    }

    Ok(crate::graph::WorkflowTask::new(graph))
}

/// The install half: stub sub-workflows for targeted peers, real installs
/// for the failing subgraph, establish pairs after the failing side is up
fn heal_install(
    ctx: &WorkflowContext,
    failing_nodes: &[Node],
    targeted_nodes: &[Node],
    failing_ids: &FxHashSet<NodeId>,
) -> Result<crate::graph::WorkflowTask, WorkflowError> {
    let mut graph = ctx.task_graph("heal_install");
    let mut sub_workflows = NodeSubWorkflows::default();

    for node in targeted_nodes {
        let stub = stub_sub_workflow(ctx, format!("install_stub_{}", node.name));
        sub_workflows.insert(node.id, graph.add_task(stub)?);
    }

    install_nodes(ctx, &mut graph, failing_nodes, &mut sub_workflows)?;

    // Re-establish the peers against the freshly installed nodes
    for node in targeted_nodes {
        let own_wf = sub_workflows[&node.id].clone();
        for rel_id in &node.relationship_ids {
            let relationship = ctx.model().relationship(*rel_id)?;
            if !failing_ids.contains(&relationship.target_id) {
                continue;
            }
            if let Some(pair) = relationship_tasks(ctx, node, &relationship, ESTABLISH)? {
                let pair_id = graph.add_task(pair)?;
                let target_wf = sub_workflows[&relationship.target_id].clone();
                graph.add_dependency(&pair_id, &target_wf)?;
                graph.add_dependency(&own_wf, &pair_id)?;
            }
        }
    }

    Ok(crate::graph::WorkflowTask::new(graph))
}

/// The failing node's containment subgraph: the host plus every node whose
/// host chain reaches it
fn contained_subgraph(ctx: &WorkflowContext, host: &Node) -> Result<Vec<Node>, WorkflowError> {
    let nodes = ctx.nodes()?;
    let mut contained: Vec<Node> = vec![host.clone()];
    let mut contained_ids: FxHashSet<NodeId> = [host.id].into_iter().collect();

    // Fixed point over the hosted-on forest
    let mut grew = true;
    while grew {
        grew = false;
        for node in &nodes {
            if contained_ids.contains(&node.id) {
                continue;
            }
            if let Some(host_id) = node.host_id {
                if host_id != node.id && contained_ids.contains(&host_id) {
                    contained_ids.insert(node.id);
                    contained.push(node.clone());
                    grew = true;
                }
            }
        }
    }
    Ok(contained)
}

/// Unchanged nodes referenced by relationships from inside the subgraph,
/// plus unchanged nodes whose relationships point into it
fn targeted_peers(
    ctx: &WorkflowContext,
    failing_nodes: &[Node],
    failing_ids: &FxHashSet<NodeId>,
) -> Result<Vec<Node>, WorkflowError> {
    let model = ctx.model();
    let mut peers: Vec<Node> = Vec::new();
    let mut seen: FxHashSet<NodeId> = FxHashSet::default();

    for node in failing_nodes {
        for rel_id in &node.relationship_ids {
            let relationship = model.relationship(*rel_id)?;
            if !failing_ids.contains(&relationship.target_id) && seen.insert(relationship.target_id)
            {
                peers.push(model.node(relationship.target_id)?);
            }
        }
    }

    for node in ctx.nodes()? {
        if failing_ids.contains(&node.id) || seen.contains(&node.id) {
            continue;
        }
        for rel_id in &node.relationship_ids {
            let relationship = model.relationship(*rel_id)?;
            if failing_ids.contains(&relationship.target_id) {
                seen.insert(node.id);
                peers.push(node.clone());
                break;
            }
        }
    }

    Ok(peers)
}
