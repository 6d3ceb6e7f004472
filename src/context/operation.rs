//! Operation context
//!
//! The object an operation implementation receives. Comes in a node and a
//! relationship variant, both wrapping the same plumbing: resolved inputs,
//! the actor reference, and optional storage handles. Runtime-property
//! mutation funnels through the model storage so concurrent executors on
//! different actors never share in-process state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::errors::StorageError;
use crate::ids::{ServiceId, TaskId};
use crate::model::{ActorKind, ActorRef, Node, Relationship, Service};
use crate::storage::{ModelStorage, ResourceStorage};

/// Context handed to an operation implementation
#[derive(Clone)]
pub struct OperationContext {
    pub name: String,
    pub service_id: ServiceId,
    pub task_id: TaskId,
    pub actor: ActorRef,
    /// Resolved operation inputs
    pub inputs: BTreeMap<String, Json>,
    model: Option<ModelStorage>,
    resource: Option<Arc<dyn ResourceStorage>>,
}

impl OperationContext {
    pub fn new(
        name: impl Into<String>,
        service_id: ServiceId,
        task_id: TaskId,
        actor: ActorRef,
        inputs: BTreeMap<String, Json>,
        model: Option<ModelStorage>,
        resource: Option<Arc<dyn ResourceStorage>>,
    ) -> Self {
        OperationContext {
            name: name.into(),
            service_id,
            task_id,
            actor,
            inputs,
            model,
            resource,
        }
    }

    /// The context variant name carried across process boundaries
    pub fn variant_name(&self) -> &'static str {
        match self.actor.kind() {
            ActorKind::Node => "maestro.context.NodeOperationContext",
            ActorKind::Relationship => "maestro.context.RelationshipOperationContext",
        }
    }

    pub fn model(&self) -> Result<&ModelStorage, StorageError> {
        self.model.as_ref().ok_or(StorageError::NotFound {
            kind: "model storage",
            id: 0,
        })
    }

    pub fn resource(&self) -> Result<&Arc<dyn ResourceStorage>, StorageError> {
        self.resource.as_ref().ok_or(StorageError::NotFound {
            kind: "resource storage",
            id: 0,
        })
    }

    pub fn service(&self) -> Result<Service, StorageError> {
        self.model()?.service(self.service_id)
    }

    /// The node this operation acts on (node contexts only)
    pub fn node(&self) -> Result<Node, StorageError> {
        match self.actor {
            ActorRef::Node(id) => self.model()?.node(id),
            ActorRef::Relationship(_) => Err(StorageError::NotFound {
                kind: "node actor",
                id: self.actor.raw_id(),
            }),
        }
    }

    /// The relationship this operation acts on (relationship contexts only)
    pub fn relationship(&self) -> Result<Relationship, StorageError> {
        match self.actor {
            ActorRef::Relationship(id) => self.model()?.relationship(id),
            ActorRef::Node(_) => Err(StorageError::NotFound {
                kind: "relationship actor",
                id: self.actor.raw_id(),
            }),
        }
    }

    pub fn source_node(&self) -> Result<Node, StorageError> {
        let relationship = self.relationship()?;
        self.model()?.node(relationship.source_id)
    }

    pub fn target_node(&self) -> Result<Node, StorageError> {
        let relationship = self.relationship()?;
        self.model()?.node(relationship.target_id)
    }

    /// Read one runtime property of the actor node
    pub fn runtime_property(&self, key: &str) -> Result<Option<Json>, StorageError> {
        Ok(self.node()?.runtime_properties.get(key).cloned())
    }

    /// Read-modify-write one runtime property of the actor node
    pub fn set_runtime_property(&self, key: &str, value: Json) -> Result<(), StorageError> {
        let mut node = self.node()?;
        node.runtime_properties.insert(key.to_string(), value);
        self.model()?.nodes().update(&node)
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("actor", &self.actor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;
    use crate::model::{Node, Service};
    use serde_json::json;

    fn node_context() -> OperationContext {
        let model = ModelStorage::in_memory();
        let service_id = ServiceId::new(model.services().put(Service::new("svc")).unwrap());
        let mut node = Node::new("web_1", "WebServer");
        node.service_id = service_id;
        let node_id = NodeId::new(model.nodes().put(node).unwrap());

        OperationContext::new(
            "create.web_1",
            service_id,
            TaskId::new(1),
            ActorRef::Node(node_id),
            BTreeMap::new(),
            Some(model),
            None,
        )
    }

    #[test]
    fn node_context_resolves_its_actor() {
        let ctx = node_context();
        assert_eq!(ctx.node().unwrap().name, "web_1");
        assert!(ctx.relationship().is_err());
        assert_eq!(ctx.variant_name(), "maestro.context.NodeOperationContext");
    }

    #[test]
    fn runtime_properties_round_trip_through_storage() {
        let ctx = node_context();
        assert_eq!(ctx.runtime_property("ip").unwrap(), None);

        ctx.set_runtime_property("ip", json!("10.0.0.3")).unwrap();
        assert_eq!(ctx.runtime_property("ip").unwrap(), Some(json!("10.0.0.3")));

        // Visible through a fresh fetch, not just this context
        let node = ctx.node().unwrap();
        assert_eq!(node.runtime_properties["ip"], json!("10.0.0.3"));
    }

    #[test]
    fn missing_storage_is_an_error_not_a_panic() {
        let ctx = OperationContext::new(
            "orphan",
            ServiceId::new(1),
            TaskId::new(1),
            ActorRef::Node(NodeId::new(1)),
            BTreeMap::new(),
            None,
            None,
        );
        assert!(ctx.model().is_err());
        assert!(ctx.node().is_err());
    }
}
