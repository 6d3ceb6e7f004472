//! Intrinsic-function evaluator
//!
//! Lazily evaluates function-valued model values against a scope (the
//! containing entity plus its service). Evaluation is recursive to a fixed
//! point: a function may evaluate to a value that itself embeds functions.
//! A non-final intermediate forces the whole chain non-final, and path
//! traversal across entities carries a visited set so circular property
//! references are reported instead of looping.

use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tracing::trace;

use crate::errors::{FunctionError, ValueError};
use crate::ids::{NodeId, RelationshipId};
use crate::model::service::{Node, Relationship, Service};
use crate::model::value::{IntrinsicFunction, ModelValue};
use crate::storage::ModelStorage;

/// Reserved entity tokens accepted by `get_property`/`get_attribute`
pub const SELF: &str = "SELF";
pub const HOST: &str = "HOST";
pub const SOURCE: &str = "SOURCE";
pub const TARGET: &str = "TARGET";

/// An evaluated function return value
///
/// `is_final` marks a value that cannot change for the remainder of the
/// execution; callers may memoize it.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Json,
    pub is_final: bool,
}

impl Evaluation {
    pub fn new(value: Json, is_final: bool) -> Self {
        Evaluation { value, is_final }
    }
}

/// The entity a value is being evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Service,
    Node(NodeId),
    Relationship(RelationshipId),
}

/// Scope triple: container entity, its service, and the model it lives in
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub model: &'a ModelStorage,
    pub service: &'a Service,
    pub container: Container,
}

impl<'a> Scope<'a> {
    pub fn service(model: &'a ModelStorage, service: &'a Service) -> Self {
        Scope {
            model,
            service,
            container: Container::Service,
        }
    }

    pub fn node(model: &'a ModelStorage, service: &'a Service, node: NodeId) -> Self {
        Scope {
            model,
            service,
            container: Container::Node(node),
        }
    }

    pub fn relationship(
        model: &'a ModelStorage,
        service: &'a Service,
        relationship: RelationshipId,
    ) -> Self {
        Scope {
            model,
            service,
            container: Container::Relationship(relationship),
        }
    }

    fn with_container(&self, container: Container) -> Scope<'a> {
        Scope {
            model: self.model,
            service: self.service,
            container,
        }
    }
}

/// Guard key for the cross-entity visited set
type VisitKey = (Container, String);

/// Recursively evaluate any functions embedded in `value`
///
/// Returns `None` when no function is present anywhere, otherwise the
/// combined evaluation. `CannotEvaluate` bubbles up unmodified; plan-time
/// callers are expected to swallow it.
pub fn evaluate(
    value: &ModelValue,
    scope: &Scope<'_>,
) -> Result<Option<Evaluation>, FunctionError> {
    let mut visited = FxHashSet::default();
    evaluate_inner(value, scope, &mut visited)
}

/// Evaluate to a concrete JSON value, treating function-free values as final
pub fn resolve(value: &ModelValue, scope: &Scope<'_>) -> Result<Evaluation, FunctionError> {
    match evaluate(value, scope)? {
        Some(evaluation) => Ok(evaluation),
        None => Ok(Evaluation::new(value.to_raw(), true)),
    }
}

fn evaluate_inner(
    value: &ModelValue,
    scope: &Scope<'_>,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Option<Evaluation>, FunctionError> {
    match value {
        ModelValue::Literal(_) => Ok(None),

        ModelValue::List(items) => {
            let mut evaluated = false;
            let mut is_final = true;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match evaluate_inner(item, scope, visited)? {
                    Some(e) => {
                        evaluated = true;
                        is_final &= e.is_final;
                        out.push(e.value);
                    }
                    None => out.push(item.to_raw()),
                }
            }
            Ok(evaluated.then(|| Evaluation::new(Json::Array(out), is_final)))
        }

        ModelValue::Map(map) => {
            let mut evaluated = false;
            let mut is_final = true;
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                match evaluate_inner(item, scope, visited)? {
                    Some(e) => {
                        evaluated = true;
                        is_final &= e.is_final;
                        out.insert(key.clone(), e.value);
                    }
                    None => {
                        out.insert(key.clone(), item.to_raw());
                    }
                }
            }
            Ok(evaluated.then(|| Evaluation::new(Json::Object(out), is_final)))
        }

        ModelValue::Function(function) => {
            trace!(function = function.name(), "evaluating intrinsic function");
            let mut evaluation = evaluate_function(function, scope, visited)?;

            // The result might itself embed functions; chase to a fixed point
            let reparsed = ModelValue::parse(&evaluation.value).map_err(FunctionError::Invalid)?;
            if !reparsed.is_concrete() {
                if let Some(nested) = evaluate_inner(&reparsed, scope, visited)? {
                    evaluation = Evaluation::new(nested.value, evaluation.is_final && nested.is_final);
                }
            }
            Ok(Some(evaluation))
        }
    }
}

fn evaluate_function(
    function: &IntrinsicFunction,
    scope: &Scope<'_>,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Evaluation, FunctionError> {
    match function {
        IntrinsicFunction::Concat { args } => {
            let mut is_final = true;
            let mut joined = String::new();
            for arg in args {
                match evaluate_inner(arg, scope, visited)? {
                    Some(e) => {
                        is_final &= e.is_final;
                        joined.push_str(&json_fragment(&e.value));
                    }
                    None => joined.push_str(&json_fragment(&arg.to_raw())),
                }
            }
            Ok(Evaluation::new(Json::String(joined), is_final))
        }

        IntrinsicFunction::Token {
            value,
            separators,
            index,
        } => {
            let inner = match evaluate_inner(value, scope, visited)? {
                Some(e) => e,
                None => Evaluation::new(value.to_raw(), true),
            };
            let text = json_fragment(&inner.value);
            let tokens: Vec<&str> = text
                .split(|c: char| separators.contains(c))
                .filter(|t| !t.is_empty())
                .collect();
            let token = tokens.get(*index).ok_or_else(|| {
                FunctionError::cannot(
                    "token",
                    format!("index {} out of range for '{}'", index, text),
                )
            })?;
            Ok(Evaluation::new(Json::String(token.to_string()), inner.is_final))
        }

        IntrinsicFunction::GetInput { input } => {
            let value = scope
                .service
                .inputs
                .get(input)
                .ok_or_else(|| ValueError::UnknownInput(input.clone()))?;
            let service_scope = scope.with_container(Container::Service);
            let inner = match evaluate_inner(value, &service_scope, visited)? {
                Some(e) => e.value,
                None => value.to_raw(),
            };
            // Inputs may be overridden at run time
            Ok(Evaluation::new(inner, false))
        }

        IntrinsicFunction::GetProperty { path } => {
            evaluate_entity_path(scope, path, PathKind::Property, visited)
        }

        IntrinsicFunction::GetAttribute { path } => {
            let evaluation = evaluate_entity_path(scope, path, PathKind::Attribute, visited)?;
            // Attributes are mutable for the lifetime of the service
            Ok(Evaluation::new(evaluation.value, false))
        }

        IntrinsicFunction::GetOperationOutput { .. } => Err(FunctionError::cannot(
            "get_operation_output",
            "operation outputs are only available at run time",
        )),

        IntrinsicFunction::GetArtifact { .. } => Err(FunctionError::cannot(
            "get_artifact",
            "artifact resolution is only available at run time",
        )),

        IntrinsicFunction::GetNodesOfType { type_name } => {
            let mut names = Vec::new();
            for node_id in &scope.service.node_ids {
                let node = lookup_node(scope, *node_id)?;
                if node.is_of_type(type_name) {
                    names.push(Json::String(node.name.clone()));
                }
            }
            Ok(Evaluation::new(Json::Array(names), false))
        }
    }
}

// ============================================================================
// ENTITY RESOLUTION & PATH TRAVERSAL
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum PathKind {
    Property,
    Attribute,
}

impl PathKind {
    fn function(self) -> &'static str {
        match self {
            PathKind::Property => "get_property",
            PathKind::Attribute => "get_attribute",
        }
    }
}

enum Resolved {
    Node(Box<Node>),
    Relationship(Box<Relationship>),
}

fn evaluate_entity_path(
    scope: &Scope<'_>,
    path: &[String],
    kind: PathKind,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Evaluation, FunctionError> {
    let function = kind.function();
    let (entity_token, rest) = path.split_first().ok_or_else(|| {
        ValueError::InvalidArgument {
            function,
            reason: "empty path".to_string(),
            locator: None,
        }
    })?;

    let resolved = resolve_entity(scope, entity_token, function)?;
    match resolved {
        Resolved::Node(node) => {
            let guard: VisitKey = (Container::Node(node.id), rest.join("."));
            if !visited.insert(guard.clone()) {
                return Err(ValueError::CircularReference(format!(
                    "{}[{}]",
                    node.name,
                    rest.join(".")
                ))
                .into());
            }
            let result = node_path_value(scope, &node, rest, kind, visited);
            visited.remove(&guard);
            result
        }
        Resolved::Relationship(relationship) => {
            let guard: VisitKey = (Container::Relationship(relationship.id), rest.join("."));
            if !visited.insert(guard.clone()) {
                return Err(ValueError::CircularReference(format!(
                    "{}[{}]",
                    relationship.name,
                    rest.join(".")
                ))
                .into());
            }
            let result = relationship_path_value(scope, &relationship, rest, kind, visited);
            visited.remove(&guard);
            result
        }
    }
}

fn resolve_entity(
    scope: &Scope<'_>,
    token: &str,
    function: &'static str,
) -> Result<Resolved, FunctionError> {
    match token {
        SELF => match scope.container {
            Container::Node(id) => Ok(Resolved::Node(Box::new(lookup_node(scope, id)?))),
            Container::Relationship(id) => Ok(Resolved::Relationship(Box::new(
                lookup_relationship(scope, id)?,
            ))),
            Container::Service => Err(ValueError::InvalidArgument {
                function,
                reason: "SELF is not valid in service scope".to_string(),
                locator: None,
            }
            .into()),
        },

        HOST => match scope.container {
            Container::Node(id) => {
                let node = lookup_node(scope, id)?;
                let host = resolve_host(scope, &node)?.ok_or_else(|| {
                    FunctionError::cannot(function, format!("node '{}' is not yet hosted", node.name))
                })?;
                Ok(Resolved::Node(Box::new(host)))
            }
            _ => Err(ValueError::InvalidArgument {
                function,
                reason: "HOST is only valid for node containers".to_string(),
                locator: None,
            }
            .into()),
        },

        SOURCE | TARGET => match scope.container {
            Container::Relationship(id) => {
                let relationship = lookup_relationship(scope, id)?;
                let node_id = if token == SOURCE {
                    relationship.source_id
                } else {
                    relationship.target_id
                };
                Ok(Resolved::Node(Box::new(lookup_node(scope, node_id)?)))
            }
            _ => Err(ValueError::InvalidArgument {
                function,
                reason: format!("{} is only valid for relationship containers", token),
                locator: None,
            }
            .into()),
        },

        name => {
            for node_id in &scope.service.node_ids {
                let node = lookup_node(scope, *node_id)?;
                if node.template_name == name || node.name == name {
                    return Ok(Resolved::Node(Box::new(node)));
                }
            }
            Err(ValueError::UnknownEntity(name.to_string()).into())
        }
    }
}

/// Walk the host chain until the anchoring compute node is reached
pub fn resolve_host(scope: &Scope<'_>, node: &Node) -> Result<Option<Node>, FunctionError> {
    let mut seen = FxHashSet::default();
    let mut current = node.clone();
    loop {
        match current.host_id {
            None => return Ok(None),
            Some(host_id) if host_id == current.id => return Ok(Some(current)),
            Some(host_id) => {
                if !seen.insert(host_id) {
                    return Err(ValueError::CircularReference(format!(
                        "host chain of '{}'",
                        node.name
                    ))
                    .into());
                }
                current = lookup_node(scope, host_id)?;
            }
        }
    }
}

fn node_path_value(
    scope: &Scope<'_>,
    node: &Node,
    path: &[String],
    kind: PathKind,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Evaluation, FunctionError> {
    let function = kind.function();
    let (head, rest) = path.split_first().ok_or_else(|| ValueError::InvalidArgument {
        function,
        reason: "expected at least one path segment".to_string(),
        locator: None,
    })?;

    let node_scope = scope.with_container(Container::Node(node.id));

    match kind {
        PathKind::Property => {
            if let Some(value) = node.properties.get(head) {
                let value = descend(value, rest, function)?;
                return finish_value(&value, &node_scope, visited);
            }
            if let Some(capability) = node.capabilities.get(head) {
                let (cap_head, cap_rest) =
                    rest.split_first().ok_or_else(|| ValueError::InvalidArgument {
                        function,
                        reason: format!("capability '{}' needs a property segment", head),
                        locator: None,
                    })?;
                let value = capability.properties.get(cap_head).ok_or_else(|| {
                    ValueError::InvalidArgument {
                        function,
                        reason: format!("capability '{}' has no property '{}'", head, cap_head),
                        locator: None,
                    }
                })?;
                let value = descend(value, cap_rest, function)?;
                return finish_value(&value, &node_scope, visited);
            }
            if let Some(requirement) = node.requirements.iter().find(|r| r.name == *head) {
                let target_id = requirement.target_node_id.ok_or_else(|| {
                    FunctionError::cannot(
                        function,
                        format!("requirement '{}' is not yet resolved", head),
                    )
                })?;
                let target = lookup_node(scope, target_id)?;
                return node_path_value(scope, &target, rest, kind, visited);
            }
            Err(ValueError::InvalidArgument {
                function,
                reason: format!("'{}' has no property '{}'", node.name, head),
                locator: None,
            }
            .into())
        }

        PathKind::Attribute => {
            if let Some(value) = node.attributes.get(head) {
                let value = descend(value, rest, function)?;
                return finish_value(&value, &node_scope, visited);
            }
            if let Some(value) = node.runtime_properties.get(head) {
                let value = descend_json(value, rest, function)?;
                return Ok(Evaluation::new(value, false));
            }
            Err(FunctionError::cannot(
                function,
                format!("'{}' has no attribute '{}'", node.name, head),
            ))
        }
    }
}

fn relationship_path_value(
    scope: &Scope<'_>,
    relationship: &Relationship,
    path: &[String],
    kind: PathKind,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Evaluation, FunctionError> {
    let function = kind.function();
    let (head, rest) = path.split_first().ok_or_else(|| ValueError::InvalidArgument {
        function,
        reason: "expected at least one path segment".to_string(),
        locator: None,
    })?;

    let value = relationship.properties.get(head).ok_or_else(|| {
        ValueError::InvalidArgument {
            function,
            reason: format!("relationship '{}' has no property '{}'", relationship.name, head),
            locator: None,
        }
    })?;
    let value = descend(value, rest, function)?;
    let rel_scope = scope.with_container(Container::Relationship(relationship.id));
    let evaluation = finish_value(&value, &rel_scope, visited)?;
    match kind {
        PathKind::Property => Ok(evaluation),
        PathKind::Attribute => Ok(Evaluation::new(evaluation.value, false)),
    }
}

/// Evaluate a value found at the end of a path, in its owner's scope
fn finish_value(
    value: &ModelValue,
    owner_scope: &Scope<'_>,
    visited: &mut FxHashSet<VisitKey>,
) -> Result<Evaluation, FunctionError> {
    match evaluate_inner(value, owner_scope, visited)? {
        Some(evaluation) => Ok(evaluation),
        None => Ok(Evaluation::new(value.to_raw(), true)),
    }
}

/// Walk the remaining path segments through maps and list indices
fn descend<'v>(
    value: &'v ModelValue,
    path: &[String],
    function: &'static str,
) -> Result<ModelValue, FunctionError> {
    let mut current = value;
    for segment in path {
        current = match current {
            ModelValue::Map(map) => map.get(segment).ok_or_else(|| ValueError::InvalidArgument {
                function,
                reason: format!("no such key '{}'", segment),
                locator: None,
            })?,
            ModelValue::List(items) => {
                let index: usize =
                    segment.parse().map_err(|_| ValueError::InvalidArgument {
                        function,
                        reason: format!("'{}' is not a list index", segment),
                        locator: None,
                    })?;
                items.get(index).ok_or_else(|| ValueError::InvalidArgument {
                    function,
                    reason: format!("index {} out of range", index),
                    locator: None,
                })?
            }
            _ => {
                return Err(ValueError::InvalidArgument {
                    function,
                    reason: format!("cannot descend into a scalar with '{}'", segment),
                    locator: None,
                }
                .into())
            }
        };
    }
    Ok(current.clone())
}

fn descend_json(value: &Json, path: &[String], function: &'static str) -> Result<Json, FunctionError> {
    let mut current = value;
    for segment in path {
        current = match current {
            Json::Object(map) => map.get(segment).ok_or_else(|| ValueError::InvalidArgument {
                function,
                reason: format!("no such key '{}'", segment),
                locator: None,
            })?,
            Json::Array(items) => {
                let index: usize =
                    segment.parse().map_err(|_| ValueError::InvalidArgument {
                        function,
                        reason: format!("'{}' is not a list index", segment),
                        locator: None,
                    })?;
                items.get(index).ok_or_else(|| ValueError::InvalidArgument {
                    function,
                    reason: format!("index {} out of range", index),
                    locator: None,
                })?
            }
            _ => {
                return Err(ValueError::InvalidArgument {
                    function,
                    reason: format!("cannot descend into a scalar with '{}'", segment),
                    locator: None,
                }
                .into())
            }
        };
    }
    Ok(current.clone())
}

fn lookup_node(scope: &Scope<'_>, id: NodeId) -> Result<Node, FunctionError> {
    scope
        .model
        .node(id)
        .map_err(|_| ValueError::UnknownEntity(format!("node {}", id)).into())
}

fn lookup_relationship(
    scope: &Scope<'_>,
    id: RelationshipId,
) -> Result<Relationship, FunctionError> {
    scope
        .model
        .relationship(id)
        .map_err(|_| ValueError::UnknownEntity(format!("relationship {}", id)).into())
}

/// String rendering used by concat/token arguments
fn json_fragment(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::service::Capability;
    use crate::storage::ModelStorage;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn fixture() -> (ModelStorage, Service, NodeId, NodeId, RelationshipId) {
        let model = ModelStorage::in_memory();

        let mut service = Service::new("shop");
        service.inputs.insert(
            "domain".to_string(),
            ModelValue::literal(json!("shop.example.org")),
        );
        let service_id = crate::ids::ServiceId::new(model.services().put(service.clone()).unwrap());
        service.id = service_id;

        let mut host = Node::new("vm_1", "Compute");
        host.service_id = service_id;
        host.properties
            .insert("ip".to_string(), ModelValue::literal(json!("10.0.0.7")));
        host.capabilities.insert(
            "scalable".to_string(),
            Capability {
                name: "scalable".to_string(),
                type_name: "Scaling".to_string(),
                properties: [("max_instances".to_string(), ModelValue::literal(json!(5)))]
                    .into_iter()
                    .collect(),
                occurrences: 0,
                min_occurrences: 0,
                max_occurrences: None,
            },
        );
        let host_id = NodeId::new(model.nodes().put(host).unwrap());
        let mut host = model.node(host_id).unwrap();
        host.host_id = Some(host_id);
        model.nodes().update(&host).unwrap();

        let mut web = Node::new("web_1", "WebServer");
        web.service_id = service_id;
        web.host_id = Some(host_id);
        web.properties.insert(
            "port".to_string(),
            ModelValue::literal(json!(8080)),
        );
        web.properties.insert(
            "url".to_string(),
            ModelValue::parse(&json!({"concat": [
                "http://", {"get_input": "domain"}, ":", {"get_property": ["SELF", "port"]}
            ]}))
            .unwrap(),
        );
        web.attributes
            .insert("pid".to_string(), ModelValue::literal(json!(4242)));
        let web_id = NodeId::new(model.nodes().put(web).unwrap());

        let rel = Relationship {
            id: RelationshipId::new(0),
            name: "web_on_vm".to_string(),
            type_name: "HostedOn".to_string(),
            source_id: web_id,
            target_id: host_id,
            source_position: 0,
            target_position: 0,
            properties: [(
                "weight".to_string(),
                ModelValue::literal(json!(3)),
            )]
            .into_iter()
            .collect(),
            source_interfaces: BTreeMap::new(),
            target_interfaces: BTreeMap::new(),
        };
        let rel_id = RelationshipId::new(model.relationships().put(rel).unwrap());

        let mut web = model.node(web_id).unwrap();
        web.relationship_ids.push(rel_id);
        model.nodes().update(&web).unwrap();

        service.node_ids = vec![host_id, web_id];
        model.services().update(&service).unwrap();

        (model, service, host_id, web_id, rel_id)
    }

    #[test]
    fn literal_values_have_no_evaluation() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::literal(json!("plain"));
        assert!(evaluate(&value, &scope).unwrap().is_none());
    }

    #[test]
    fn get_property_self() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["SELF", "port"]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!(8080));
        assert!(evaluation.is_final);
    }

    #[test]
    fn get_property_host_walks_host_chain() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["HOST", "ip"]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!("10.0.0.7"));
    }

    #[test]
    fn get_property_capability_path() {
        let (model, service, host, _, _) = fixture();
        let scope = Scope::node(&model, &service, host);
        let value = ModelValue::parse(&json!({"get_property": [
            "SELF", "scalable", "max_instances"
        ]}))
        .unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!(5));
    }

    #[test]
    fn get_property_by_template_name() {
        let (model, service, host, _, _) = fixture();
        let scope = Scope::node(&model, &service, host);
        let value = ModelValue::parse(&json!({"get_property": ["web_1", "port"]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!(8080));
    }

    #[test]
    fn concat_chains_and_inputs_are_never_final() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["SELF", "url"]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!("http://shop.example.org:8080"));
        // get_input taints the whole chain
        assert!(!evaluation.is_final);
    }

    #[test]
    fn source_and_target_resolve_in_relationship_scope() {
        let (model, service, _, _, rel) = fixture();
        let scope = Scope::relationship(&model, &service, rel);

        let value = ModelValue::parse(&json!({"get_property": ["TARGET", "ip"]})).unwrap();
        assert_eq!(
            evaluate(&value, &scope).unwrap().unwrap().value,
            json!("10.0.0.7")
        );

        let value = ModelValue::parse(&json!({"get_property": ["SOURCE", "port"]})).unwrap();
        assert_eq!(evaluate(&value, &scope).unwrap().unwrap().value, json!(8080));

        let value = ModelValue::parse(&json!({"get_property": ["SELF", "weight"]})).unwrap();
        assert_eq!(evaluate(&value, &scope).unwrap().unwrap().value, json!(3));
    }

    #[test]
    fn source_outside_relationship_scope_is_invalid() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["SOURCE", "port"]})).unwrap();
        let err = evaluate(&value, &scope).unwrap_err();
        assert!(!err.is_cannot_evaluate());
    }

    #[test]
    fn get_attribute_is_never_final() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_attribute": ["SELF", "pid"]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!(4242));
        assert!(!evaluation.is_final);
    }

    #[test]
    fn get_attribute_reads_runtime_properties() {
        let (model, service, _, web, _) = fixture();
        let mut node = model.node(web).unwrap();
        node.runtime_properties
            .insert("bound_ip".to_string(), json!("10.0.0.9"));
        model.nodes().update(&node).unwrap();

        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_attribute": ["SELF", "bound_ip"]})).unwrap();
        assert_eq!(
            evaluate(&value, &scope).unwrap().unwrap().value,
            json!("10.0.0.9")
        );
    }

    #[test]
    fn unknown_input_is_a_validation_error() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_input": "missing"})).unwrap();
        let err = evaluate(&value, &scope).unwrap_err();
        assert!(matches!(
            err,
            FunctionError::Invalid(ValueError::UnknownInput(_))
        ));
    }

    #[test]
    fn token_splits_and_bounds_checks() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);

        let value =
            ModelValue::parse(&json!({"token": ["10.0.0.7:8080", ":.", 4]})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!("8080"));

        let value = ModelValue::parse(&json!({"token": ["a.b", ".", 7]})).unwrap();
        assert!(evaluate(&value, &scope).unwrap_err().is_cannot_evaluate());
    }

    #[test]
    fn placeholders_cannot_evaluate_at_plan_time() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(
            &json!({"get_operation_output": ["SELF", "lifecycle", "create", "out"]}),
        )
        .unwrap();
        assert!(evaluate(&value, &scope).unwrap_err().is_cannot_evaluate());
    }

    #[test]
    fn get_nodes_of_type_lists_matching_nodes() {
        let (model, service, _, _, _) = fixture();
        let scope = Scope::service(&model, &service);
        let value = ModelValue::parse(&json!({"get_nodes_of_type": "Compute"})).unwrap();
        let evaluation = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(evaluation.value, json!(["vm_1"]));
        assert!(!evaluation.is_final);
    }

    #[test]
    fn circular_property_references_are_reported() {
        let (model, service, _, web, _) = fixture();
        let mut node = model.node(web).unwrap();
        node.properties.insert(
            "loop_a".to_string(),
            ModelValue::parse(&json!({"get_property": ["SELF", "loop_b"]})).unwrap(),
        );
        node.properties.insert(
            "loop_b".to_string(),
            ModelValue::parse(&json!({"get_property": ["SELF", "loop_a"]})).unwrap(),
        );
        model.nodes().update(&node).unwrap();

        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["SELF", "loop_a"]})).unwrap();
        let err = evaluate(&value, &scope).unwrap_err();
        assert!(matches!(
            err,
            FunctionError::Invalid(ValueError::CircularReference(_))
        ));
    }

    #[test]
    fn evaluation_of_final_value_is_idempotent() {
        let (model, service, _, web, _) = fixture();
        let scope = Scope::node(&model, &service, web);
        let value = ModelValue::parse(&json!({"get_property": ["SELF", "port"]})).unwrap();

        let first = evaluate(&value, &scope).unwrap().unwrap();
        let second = evaluate(&value, &scope).unwrap().unwrap();
        assert_eq!(first, second);
        assert!(first.is_final);
    }
}
