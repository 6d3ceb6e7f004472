//! Builtin scale workflow

use rustc_hash::FxHashSet;
use tracing::{info, warn};

use crate::builtin::install::install_nodes;
use crate::builtin::lifecycle::{
    relationship_tasks, stub_sub_workflow, NodeSubWorkflows, ESTABLISH, UNLINK,
};
use crate::builtin::uninstall::uninstall_nodes;
use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::TaskGraph;
use crate::ids::{ModificationId, NodeId};
use crate::model::{
    finish_modification, modify_service, rollback_modification, ModificationRole, Node,
    ServiceModification,
};

/// Scale a named entity by `delta` instances
///
/// The entity is a scaling group, or a node template - optionally promoted
/// to its host template when `scale_compute` is set. Opens a service
/// modification, builds a scale-install (delta > 0) or scale-uninstall
/// (delta < 0) sub-graph over the partitioned node sets, and rolls the
/// modification back if graph construction fails. The returned modification
/// must be settled with [`complete_scale`] once the execution has run.
pub fn scale(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    entity_name: &str,
    delta: i64,
    scale_compute: bool,
) -> Result<Option<ModificationId>, WorkflowError> {
    if delta == 0 {
        info!("delta is 0, no scaling will take place");
        return Ok(None);
    }

    let (scale_id, current) = resolve_scalable_entity(ctx, entity_name, scale_compute)?;
    let planned = current as i64 + delta;
    if planned < 0 {
        return Err(WorkflowError::IllegalDelta {
            entity: entity_name.to_string(),
            delta,
            current,
        });
    }

    let modification = modify_service(
        ctx.model(),
        ctx.service_id,
        [(scale_id.clone(), planned as u64)].into_iter().collect(),
    )?;
    info!(
        modification = %modification.id,
        entity = %scale_id,
        delta,
        planned,
        "service modification started"
    );

    let built = if delta > 0 {
        let (added, related) = partition(ctx, &modification, ModificationRole::Added)?;
        scale_install(ctx, graph, &added, &related)
    } else {
        let (removed, related) = partition(ctx, &modification, ModificationRole::Removed)?;
        scale_uninstall(ctx, graph, &removed, &related)
    };

    if let Err(err) = built {
        warn!(modification = %modification.id, "rolling back service modification");
        if let Err(rollback_err) = rollback_modification(ctx.model(), modification.id) {
            warn!(
                modification = %modification.id,
                error = %rollback_err,
                "modification rollback failed; the service model may be corrupted"
            );
        }
        return Err(err);
    }

    Ok(Some(modification.id))
}

/// Settle a modification after its execution ran
///
/// Finish on success, roll back on failure. Both are best-effort: failures
/// are logged and re-raised.
pub fn complete_scale(
    ctx: &WorkflowContext,
    modification_id: ModificationId,
    workflow_succeeded: bool,
) -> Result<(), WorkflowError> {
    if workflow_succeeded {
        finish_modification(ctx.model(), modification_id).map_err(|err| {
            warn!(
                modification = %modification_id,
                error = %err,
                "modification finish failed; the service model may be corrupted"
            );
            err
        })
    } else {
        rollback_modification(ctx.model(), modification_id).map_err(|err| {
            warn!(
                modification = %modification_id,
                error = %err,
                "modification rollback failed; the service model may be corrupted"
            );
            err
        })
    }
}

/// Resolve the scaling group or (possibly host-promoted) node template and
/// its current instance count
fn resolve_scalable_entity(
    ctx: &WorkflowContext,
    entity_name: &str,
    scale_compute: bool,
) -> Result<(String, u64), WorkflowError> {
    let service = ctx.service()?;

    if let Some(group) = service.groups.get(entity_name) {
        let current = group
            .current_instances()
            .unwrap_or(group.member_node_ids.len() as u64);
        return Ok((entity_name.to_string(), current));
    }

    let nodes = ctx.nodes()?;
    let instance = nodes
        .iter()
        .find(|n| n.template_name == entity_name)
        .ok_or_else(|| WorkflowError::UnknownScalableEntity(entity_name.to_string()))?;

    let template = match instance.host_id {
        Some(host_id) if scale_compute && host_id != instance.id => {
            ctx.model().node(host_id)?.template_name
        }
        _ => instance.template_name.clone(),
    };
    let current = nodes.iter().filter(|n| n.template_name == template).count() as u64;
    Ok((template, current))
}

/// Split a modification's node set into (changed, related) model nodes
fn partition(
    ctx: &WorkflowContext,
    modification: &ServiceModification,
    changed_role: ModificationRole,
) -> Result<(Vec<Node>, Vec<Node>), WorkflowError> {
    let list = match changed_role {
        ModificationRole::Added => &modification.added_and_related,
        _ => &modification.removed_and_related,
    };

    let mut changed = Vec::new();
    let mut related = Vec::new();
    for entry in list {
        let node = ctx.model().node(entry.node_id)?;
        if entry.role == changed_role {
            changed.push(node);
        } else {
            related.push(node);
        }
    }
    Ok((changed, related))
}

/// Install the scaled-out instances; unaffected peers contribute establish
/// pairs once their new neighbors are up
fn scale_install(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    scaling_up: &[Node],
    unaffected: &[Node],
) -> Result<(), WorkflowError> {
    let scaling_ids: FxHashSet<NodeId> = scaling_up.iter().map(|n| n.id).collect();
    let mut sub_workflows = NodeSubWorkflows::default();

    for node in unaffected {
        let stub = stub_sub_workflow(ctx, format!("install_stub_{}", node.name));
        sub_workflows.insert(node.id, graph.add_task(stub)?);
    }

    install_nodes(ctx, graph, scaling_up, &mut sub_workflows)?;

    for node in unaffected {
        let own_wf = sub_workflows[&node.id].clone();
        for rel_id in &node.relationship_ids {
            let relationship = ctx.model().relationship(*rel_id)?;
            if !scaling_ids.contains(&relationship.target_id) {
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
    Ok(())
}

/// Uninstall the scaled-in instances; unaffected peers unlink from them
/// before they disappear
fn scale_uninstall(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    scaling_down: &[Node],
    unaffected: &[Node],
) -> Result<(), WorkflowError> {
    let scaling_ids: FxHashSet<NodeId> = scaling_down.iter().map(|n| n.id).collect();
    let mut sub_workflows = NodeSubWorkflows::default();

    for node in unaffected {
        let stub = stub_sub_workflow(ctx, format!("uninstall_stub_{}", node.name));
        sub_workflows.insert(node.id, graph.add_task(stub)?);
    }

    uninstall_nodes(ctx, graph, scaling_down, &mut sub_workflows)?;

    for node in unaffected {
        let own_wf = sub_workflows[&node.id].clone();
        for rel_id in node.relationship_ids.iter().rev() {
            let relationship = ctx.model().relationship(*rel_id)?;
            if !scaling_ids.contains(&relationship.target_id) {
                continue;
            }
            if let Some(pair) = relationship_tasks(ctx, node, &relationship, UNLINK)? {
                let pair_id = graph.add_task(pair)?;
                let target_wf = sub_workflows[&relationship.target_id].clone();
                graph.add_dependency(&target_wf, &pair_id)?;
                graph.add_dependency(&own_wf, &pair_id)?;
            }
        }
    }
    Ok(())
}
