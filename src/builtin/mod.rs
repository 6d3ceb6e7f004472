//! Built-in workflows
//!
//! Deterministic graph constructors over the model: each one reads the
//! topology and populates the supplied task graph. The name registry lets
//! an embedding application dispatch `install`, `uninstall`, `heal`,
//! `scale` and `execute_operation` from stored workflow names, with inputs
//! arriving as a JSON map.

pub mod execute_operation;
pub mod heal;
pub mod install;
pub mod lifecycle;
pub mod scale;
pub mod uninstall;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde_json::Value as Json;

use crate::context::WorkflowContext;
use crate::errors::WorkflowError;
use crate::graph::TaskGraph;
use crate::ids::NodeId;

pub use execute_operation::{execute_operation, ExecuteOperationParams};
pub use heal::heal;
pub use install::install;
pub use scale::{complete_scale, scale};
pub use uninstall::uninstall;

/// A named workflow invocable with JSON inputs
pub type BuiltinWorkflowFn =
    fn(&WorkflowContext, &mut TaskGraph, &BTreeMap<String, Json>) -> Result<(), WorkflowError>;

static REGISTRY: Lazy<BTreeMap<&'static str, BuiltinWorkflowFn>> = Lazy::new(|| {
    let mut registry: BTreeMap<&'static str, BuiltinWorkflowFn> = BTreeMap::new();
    registry.insert("install", install_by_name);
    registry.insert("uninstall", uninstall_by_name);
    registry.insert("heal", heal_by_name);
    registry.insert("scale", scale_by_name);
    registry.insert("execute_operation", execute_operation_by_name);
    registry
});

/// Look up a built-in workflow by name
pub fn lookup(name: &str) -> Option<BuiltinWorkflowFn> {
    REGISTRY.get(name).copied()
}

/// The registered workflow names, sorted
pub fn names() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

fn install_by_name(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    _inputs: &BTreeMap<String, Json>,
) -> Result<(), WorkflowError> {
    install(ctx, graph)
}

fn uninstall_by_name(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    _inputs: &BTreeMap<String, Json>,
) -> Result<(), WorkflowError> {
    uninstall(ctx, graph)
}

fn heal_by_name(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    inputs: &BTreeMap<String, Json>,
) -> Result<(), WorkflowError> {
    let node_id = require_u64(inputs, "node_instance_id")?;
    heal(ctx, graph, NodeId::new(node_id))
}

fn scale_by_name(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    inputs: &BTreeMap<String, Json>,
) -> Result<(), WorkflowError> {
    let entity = require_str(inputs, "entity_name")?;
    let delta = inputs
        .get("delta")
        .and_then(Json::as_i64)
        .ok_or_else(|| WorkflowError::MissingInput("delta".to_string()))?;
    let scale_compute = inputs
        .get("scale_compute")
        .and_then(Json::as_bool)
        .unwrap_or(true);
    scale(ctx, graph, &entity, delta, scale_compute)?;
    Ok(())
}

fn execute_operation_by_name(
    ctx: &WorkflowContext,
    graph: &mut TaskGraph,
    inputs: &BTreeMap<String, Json>,
) -> Result<(), WorkflowError> {
    let mut params = ExecuteOperationParams::new(require_str(inputs, "operation")?);
    if let Some(kwargs) = inputs.get("operation_kwargs").and_then(Json::as_object) {
        params.kwargs = kwargs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    params.allow_override = inputs
        .get("allow_kwargs_override")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    params.in_dep_order = inputs
        .get("run_by_dependency_order")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    params.type_filter = string_list(inputs, "type_names");
    params.node_template_names = string_list(inputs, "node_ids");
    params.node_instance_ids = inputs
        .get("node_instance_ids")
        .and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Json::as_u64)
                .map(NodeId::new)
                .collect()
        })
        .unwrap_or_default();
    execute_operation(ctx, graph, &params)
}

fn require_str(inputs: &BTreeMap<String, Json>, key: &str) -> Result<String, WorkflowError> {
    inputs
        .get(key)
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| WorkflowError::MissingInput(key.to_string()))
}

fn require_u64(inputs: &BTreeMap<String, Json>, key: &str) -> Result<u64, WorkflowError> {
    inputs
        .get(key)
        .and_then(Json::as_u64)
        .ok_or_else(|| WorkflowError::MissingInput(key.to_string()))
}

fn string_list(inputs: &BTreeMap<String, Json>, key: &str) -> Vec<String> {
    inputs
        .get(key)
        .and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_builtin() {
        assert_eq!(
            names(),
            vec!["execute_operation", "heal", "install", "scale", "uninstall"]
        );
        assert!(lookup("install").is_some());
        assert!(lookup("reinstall").is_none());
    }

    #[test]
    fn named_invocation_validates_inputs() {
        let heal_fn = lookup("heal").unwrap();
        let model = crate::storage::ModelStorage::in_memory();
        let service_id = crate::ids::ServiceId::new(
            model
                .services()
                .put(crate::model::Service::new("svc"))
                .unwrap(),
        );
        let execution_id = crate::ids::ExecutionId::new(
            model
                .executions()
                .put(crate::model::Execution::new(service_id, "heal"))
                .unwrap(),
        );
        let ctx = WorkflowContext::new("heal", model, None, service_id, execution_id);
        let mut graph = TaskGraph::new("heal");

        let err = heal_fn(&ctx, &mut graph, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::MissingInput(_)));
    }
}
