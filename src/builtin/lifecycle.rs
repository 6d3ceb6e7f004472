//! Node lifecycle sub-workflows
//!
//! The shared machinery of install/uninstall/heal/scale: per-node lifecycle
//! chains and the paired source/target tasks of relationship operations.
//! A relationship operation always yields a sub-graph holding both sides,
//! so dependents wait for the pair, never for half of it.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::{TaskGraph, WorkflowTask};
use crate::ids::{ApiId, NodeId};
use crate::model::{Node, Relationship};

// Node lifecycle operations (interface `lifecycle`)
pub const CREATE: &str = "lifecycle.create";
pub const CONFIGURE: &str = "lifecycle.configure";
pub const START: &str = "lifecycle.start";
pub const STOP: &str = "lifecycle.stop";
pub const DELETE: &str = "lifecycle.delete";

// Relationship lifecycle operations (interface `relationship_lifecycle`)
pub const PRECONFIGURE: &str = "relationship_lifecycle.preconfigure";
pub const POSTCONFIGURE: &str = "relationship_lifecycle.postconfigure";
pub const ESTABLISH: &str = "relationship_lifecycle.establish";
pub const UNLINK: &str = "relationship_lifecycle.unlink";

/// Sub-workflow ids per node, shared across a composite workflow so
/// cross-node dependencies can attach to stubs as well as real work
pub type NodeSubWorkflows = FxHashMap<NodeId, ApiId>;

/// Build the install sub-workflow of one node:
/// `create -> preconfigure -> configure -> postconfigure -> start -> establish`
///
/// Missing operations drop out of the chain; relationship phases appear
/// only when at least one relationship declares the operation.
pub fn install_node(ctx: &WorkflowContext, node: &Node) -> Result<WorkflowTask, WorkflowError> {
    let mut sub = ctx.task_graph(format!("install_{}", node.name));
    let mut chain = Vec::new();

    append_lifecycle_task(ctx, &mut sub, &mut chain, node, CREATE)?;
    append_relationship_phase(ctx, &mut sub, &mut chain, node, PRECONFIGURE)?;
    append_lifecycle_task(ctx, &mut sub, &mut chain, node, CONFIGURE)?;
    append_relationship_phase(ctx, &mut sub, &mut chain, node, POSTCONFIGURE)?;
    append_lifecycle_task(ctx, &mut sub, &mut chain, node, START)?;
    append_relationship_phase(ctx, &mut sub, &mut chain, node, ESTABLISH)?;

    sub.sequence(&chain)?;
    debug!(node = %node.name, steps = chain.len(), "built install sub-workflow");
    Ok(WorkflowTask::new(sub))
}

/// Build the uninstall sub-workflow of one node:
/// `stop -> unlink -> delete`
pub fn uninstall_node(ctx: &WorkflowContext, node: &Node) -> Result<WorkflowTask, WorkflowError> {
    let mut sub = ctx.task_graph(format!("uninstall_{}", node.name));
    let mut chain = Vec::new();

    append_lifecycle_task(ctx, &mut sub, &mut chain, node, STOP)?;
    append_relationship_phase(ctx, &mut sub, &mut chain, node, UNLINK)?;
    append_lifecycle_task(ctx, &mut sub, &mut chain, node, DELETE)?;

    sub.sequence(&chain)?;
    debug!(node = %node.name, steps = chain.len(), "built uninstall sub-workflow");
    Ok(WorkflowTask::new(sub))
}

/// An empty sub-workflow standing in for a node that does no work here
pub fn stub_sub_workflow(ctx: &WorkflowContext, name: impl Into<String>) -> WorkflowTask {
    WorkflowTask::new(ctx.task_graph(name))
}

/// The paired source/target tasks of one relationship operation
///
/// Returns `None` when neither side declares the operation; a one-sided
/// declaration yields a one-task pair.
pub fn relationship_tasks(
    ctx: &WorkflowContext,
    node: &Node,
    relationship: &Relationship,
    operation: &str,
) -> Result<Option<WorkflowTask>, WorkflowError> {
    let has_source = relationship.source_operation(operation).is_some();
    let has_target = relationship.target_operation(operation).is_some();
    if !has_source && !has_target {
        return Ok(None);
    }

    let mut pair = ctx.task_graph(format!(
        "{}.{}.{}",
        operation, relationship.source_position, node.name
    ));
    if has_source {
        let task = ctx.relationship_source_task(relationship, operation)?;
        pair.add_task(task)?;
    }
    if has_target {
        let task = ctx.relationship_target_task(relationship, operation)?;
        pair.add_task(task)?;
    }
    Ok(Some(WorkflowTask::new(pair)))
}

/// Append a node lifecycle task to the chain when the node declares it
fn append_lifecycle_task(
    ctx: &WorkflowContext,
    sub: &mut TaskGraph,
    chain: &mut Vec<ApiId>,
    node: &Node,
    operation: &str,
) -> Result<(), WorkflowError> {
    if node.operation(operation).is_none() {
        return Ok(());
    }
    let task = ctx.operation_task(node, operation)?;
    chain.push(sub.add_task(task)?);
    Ok(())
}

/// Append the relationship phase of an operation: every relationship pair,
/// chained in source-position order
fn append_relationship_phase(
    ctx: &WorkflowContext,
    sub: &mut TaskGraph,
    chain: &mut Vec<ApiId>,
    node: &Node,
    operation: &str,
) -> Result<(), WorkflowError> {
    let mut pair_ids = Vec::new();
    for rel_id in &node.relationship_ids {
        let relationship = ctx.model().relationship(*rel_id)?;
        if let Some(pair) = relationship_tasks(ctx, node, &relationship, operation)? {
            pair_ids.push(sub.add_task(pair)?);
        }
    }
    if pair_ids.is_empty() {
        return Ok(());
    }

    // Chain the pairs in relationship order and splice them into the chain
    sub.sequence(&pair_ids)?;
    if let Some(previous) = chain.last() {
        sub.add_dependency(&pair_ids[0], previous)?;
    }
    chain.push(pair_ids.last().expect("non-empty").clone());
    Ok(())
}

/// Wire `dependent_wf` to wait for the sub-workflows of its relationship
/// targets, when those targets participate in the same composite workflow
pub fn depend_on_targets(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    node: &Node,
    dependent_wf: &ApiId,
    sub_workflows: &NodeSubWorkflows,
) -> Result<(), WorkflowError> {
    for rel_id in &node.relationship_ids {
        let relationship = ctx.model().relationship(*rel_id)?;
        if let Some(target_wf) = sub_workflows.get(&relationship.target_id) {
            graph.add_dependency(dependent_wf, target_wf)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ApiTask;
    use crate::ids::{ExecutionId, RelationshipId, ServiceId};
    use crate::model::{Execution, Interface, Operation, Service};
    use crate::storage::ModelStorage;
    use std::collections::BTreeMap;

    fn lifecycle_interface(ops: &[&str]) -> Interface {
        let mut interface = Interface::new("lifecycle");
        for op in ops {
            interface = interface.with_operation(Operation::new(*op, format!("tests.{}", op)));
        }
        interface
    }

    fn relationship_interface(ops: &[&str]) -> Interface {
        let mut interface = Interface::new("relationship_lifecycle");
        for op in ops {
            interface = interface.with_operation(Operation::new(*op, format!("tests.rel.{}", op)));
        }
        interface
    }

    fn fixture() -> (WorkflowContext, Node, Node) {
        let model = ModelStorage::in_memory();
        let service_id = ServiceId::new(model.services().put(Service::new("svc")).unwrap());

        let mut db = Node::new("db_1", "Database");
        db.service_id = service_id;
        db.interfaces.insert(
            "lifecycle".to_string(),
            lifecycle_interface(&["create", "start", "stop", "delete"]),
        );
        let db_id = NodeId::new(model.nodes().put(db).unwrap());

        let mut web = Node::new("web_1", "WebServer");
        web.service_id = service_id;
        web.interfaces.insert(
            "lifecycle".to_string(),
            lifecycle_interface(&["create", "configure", "start"]),
        );
        let web_id = NodeId::new(model.nodes().put(web).unwrap());

        let rel = Relationship {
            id: RelationshipId::new(0),
            name: "web_to_db".to_string(),
            type_name: "ConnectsTo".to_string(),
            source_id: web_id,
            target_id: db_id,
            source_position: 0,
            target_position: 0,
            properties: BTreeMap::new(),
            source_interfaces: [(
                "relationship_lifecycle".to_string(),
                relationship_interface(&["preconfigure", "establish", "unlink"]),
            )]
            .into_iter()
            .collect(),
            target_interfaces: [(
                "relationship_lifecycle".to_string(),
                relationship_interface(&["establish"]),
            )]
            .into_iter()
            .collect(),
        };
        let rel_id = RelationshipId::new(model.relationships().put(rel).unwrap());

        let mut web = model.node(web_id).unwrap();
        web.relationship_ids.push(rel_id);
        model.nodes().update(&web).unwrap();

        let mut service = model.service(service_id).unwrap();
        service.node_ids = vec![db_id, web_id];
        model.services().update(&service).unwrap();

        let execution_id = ExecutionId::new(
            model
                .executions()
                .put(Execution::new(service_id, "install"))
                .unwrap(),
        );
        let ctx = WorkflowContext::new("install", model.clone(), None, service_id, execution_id);
        let web = model.node(web_id).unwrap();
        let db = model.node(db_id).unwrap();
        (ctx, web, db)
    }

    #[test]
    fn install_chain_skips_missing_operations() {
        let (ctx, _web, db) = fixture();
        let wf = install_node(&ctx, &db).unwrap();
        // db has create and start but no configure; no relationships
        let names: Vec<&str> = wf.graph.tasks().map(|t| t.name()).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("lifecycle.create"));
        assert!(names[1].starts_with("lifecycle.start"));
    }

    #[test]
    fn install_chain_includes_relationship_phases() {
        let (ctx, web, _db) = fixture();
        let wf = install_node(&ctx, &web).unwrap();

        let tasks: Vec<&ApiTask> = wf.graph.tasks().collect();
        // create, preconfigure pair, configure, start, establish pair
        assert_eq!(tasks.len(), 5);

        let order = wf.graph.topological_order(false);
        let names: Vec<String> = order
            .iter()
            .map(|id| wf.graph.task(id).unwrap().name().to_string())
            .collect();
        assert!(names[0].starts_with("lifecycle.create"));
        assert!(names[1].starts_with("relationship_lifecycle.preconfigure"));
        assert!(names[2].starts_with("lifecycle.configure"));
        assert!(names[3].starts_with("lifecycle.start"));
        assert!(names[4].starts_with("relationship_lifecycle.establish"));
    }

    #[test]
    fn relationship_pair_holds_both_sides() {
        let (ctx, web, _db) = fixture();
        let rel = ctx.model().relationship(web.relationship_ids[0]).unwrap();

        let pair = relationship_tasks(&ctx, &web, &rel, ESTABLISH)
            .unwrap()
            .unwrap();
        let names: Vec<&str> = pair.graph.tasks().map(|t| t.name()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.contains(".source.")));
        assert!(names.iter().any(|n| n.contains(".target.")));

        // unlink is declared on the source side only
        let pair = relationship_tasks(&ctx, &web, &rel, UNLINK).unwrap().unwrap();
        assert_eq!(pair.graph.len(), 1);

        // postconfigure is declared on neither side
        assert!(relationship_tasks(&ctx, &web, &rel, POSTCONFIGURE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn uninstall_chain_is_reverse_shaped() {
        let (ctx, web, _db) = fixture();
        let wf = uninstall_node(&ctx, &web).unwrap();

        let order = wf.graph.topological_order(false);
        let names: Vec<String> = order
            .iter()
            .map(|id| wf.graph.task(id).unwrap().name().to_string())
            .collect();
        // web declares no stop/delete, so only the unlink phase remains
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("relationship_lifecycle.unlink"));
    }
}
