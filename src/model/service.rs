//! Topology instance entities
//!
//! The in-memory representation of an instantiated service: nodes,
//! relationships, interfaces, operations, capabilities, requirements,
//! groups and policies. The structures are naturally cyclic (nodes point at
//! relationships point at nodes), so every cross-reference is id-valued and
//! resolved through the model storage.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ids::{NodeId, RelationshipId, ServiceId};
use crate::model::value::ModelValue;

// ============================================================================
// SERVICE
// ============================================================================

/// Top-level container of a topology instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Service inputs; values may be unevaluated functions
    #[serde(default)]
    pub inputs: BTreeMap<String, ModelValue>,
    /// Service outputs; typically function-valued until the end of install
    #[serde(default)]
    pub outputs: BTreeMap<String, ModelValue>,
    /// Member nodes, in instantiation order
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            id: ServiceId::new(0),
            name: name.into(),
            description: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            node_ids: Vec::new(),
            groups: BTreeMap::new(),
            policies: Vec::new(),
        }
    }
}

/// A named set of member nodes with shared properties
///
/// Scaling groups are plain groups whose properties carry the instance
/// counts the scale workflow reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub member_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
}

impl Group {
    /// Current instance count, when this group is a scaling group
    pub fn current_instances(&self) -> Option<u64> {
        self.properties.get("current_instances").and_then(Json::as_u64)
    }
}

/// A policy targeting groups or nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
    #[serde(default)]
    pub target_group_names: Vec<String>,
    #[serde(default)]
    pub target_node_ids: Vec<NodeId>,
}

// ============================================================================
// NODE
// ============================================================================

/// Lifecycle state of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Initial,
    Creating,
    Created,
    Configuring,
    Configured,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Error,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Initial
    }
}

/// An instantiation of a node template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Unique instance name, e.g. `web_server_1`
    pub name: String,
    pub type_name: String,
    /// Type names root-first, ending with `type_name`
    #[serde(default)]
    pub type_hierarchy: Vec<String>,
    pub template_name: String,
    pub service_id: ServiceId,
    #[serde(default)]
    pub state: NodeState,
    /// Hosting anchor: self for a compute node, None when unhosted,
    /// otherwise the first hop of the HostedOn chain
    #[serde(default)]
    pub host_id: Option<NodeId>,
    /// Outbound relationships in `source_position` order
    #[serde(default)]
    pub relationship_ids: Vec<RelationshipId>,
    #[serde(default)]
    pub properties: BTreeMap<String, ModelValue>,
    #[serde(default)]
    pub attributes: BTreeMap<String, ModelValue>,
    /// Mutable bag owned by operation implementations
    #[serde(default)]
    pub runtime_properties: BTreeMap<String, Json>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Capability>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,
}

impl Node {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        let type_name = type_name.into();
        Node {
            id: NodeId::new(0),
            template_name: name.clone(),
            name,
            type_hierarchy: vec![type_name.clone()],
            type_name,
            service_id: ServiceId::new(0),
            state: NodeState::Initial,
            host_id: None,
            relationship_ids: Vec::new(),
            properties: BTreeMap::new(),
            attributes: BTreeMap::new(),
            runtime_properties: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            requirements: Vec::new(),
            artifacts: BTreeMap::new(),
            interfaces: BTreeMap::new(),
        }
    }

    /// A compute node hosts itself
    pub fn is_compute(&self) -> bool {
        self.host_id == Some(self.id)
    }

    /// True when this node's type hierarchy contains `type_name`
    pub fn is_of_type(&self, type_name: &str) -> bool {
        self.type_name == type_name || self.type_hierarchy.iter().any(|t| t == type_name)
    }

    /// Look up an operation by `interface.operation` dotted name
    pub fn operation(&self, dotted: &str) -> Option<&Operation> {
        let (interface, operation) = dotted.rsplit_once('.')?;
        self.interfaces.get(interface)?.operations.get(operation)
    }
}

// ============================================================================
// RELATIONSHIP
// ============================================================================

/// A directed edge from a source node to a target node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub name: String,
    pub type_name: String,
    pub source_id: NodeId,
    pub target_id: NodeId,
    /// Position among the source node's outbound relationships; contiguous
    /// `0..N-1` within a source
    pub source_position: usize,
    /// Position among the target node's inbound relationships
    pub target_position: usize,
    #[serde(default)]
    pub properties: BTreeMap<String, ModelValue>,
    /// Operations run on the source node
    #[serde(default)]
    pub source_interfaces: BTreeMap<String, Interface>,
    /// Operations run on the target node
    #[serde(default)]
    pub target_interfaces: BTreeMap<String, Interface>,
}

impl Relationship {
    /// Look up a source-side operation by `interface.operation` dotted name
    pub fn source_operation(&self, dotted: &str) -> Option<&Operation> {
        let (interface, operation) = dotted.rsplit_once('.')?;
        self.source_interfaces
            .get(interface)?
            .operations
            .get(operation)
    }

    /// Look up a target-side operation by `interface.operation` dotted name
    pub fn target_operation(&self, dotted: &str) -> Option<&Operation> {
        let (interface, operation) = dotted.rsplit_once('.')?;
        self.target_interfaces
            .get(interface)?
            .operations
            .get(operation)
    }
}

// ============================================================================
// INTERFACES & OPERATIONS
// ============================================================================

/// A named bundle of operations attached to a node or relationship
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub operations: BTreeMap<String, Operation>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Interface {
            name: name.into(),
            type_name: None,
            operations: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.insert(operation.name.clone(), operation);
        self
    }
}

/// A single operation an executor can run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    /// Dotted path resolved against the operation registry
    #[serde(default)]
    pub implementation: Option<String>,
    /// Opaque strings the executor may interpret
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Backend selector; None means the engine default
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before a retry attempt
    #[serde(default, with = "duration_secs")]
    pub retry_interval: Duration,
    #[serde(default)]
    pub inputs: BTreeMap<String, ModelValue>,
    #[serde(default)]
    pub plugin: Option<Plugin>,
}

impl Operation {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Operation {
            name: name.into(),
            implementation: Some(implementation.into()),
            dependencies: Vec::new(),
            executor: None,
            max_retries: 0,
            retry_interval: Duration::ZERO,
            inputs: BTreeMap::new(),
            plugin: None,
        }
    }

    /// Total dispatch budget: the first attempt plus the retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Seconds-valued serde for retry intervals
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Plugin coordinates carried opaquely to the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub package_version: Option<String>,
}

// ============================================================================
// CAPABILITIES & REQUIREMENTS
// ============================================================================

/// A capability with occurrence bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ModelValue>,
    /// How many requirements are currently relating to this capability
    #[serde(default)]
    pub occurrences: u32,
    #[serde(default)]
    pub min_occurrences: u32,
    /// None means unbounded
    #[serde(default)]
    pub max_occurrences: Option<u32>,
}

impl Capability {
    /// A requirement is satisfiable iff occurrences are below the bound
    pub fn has_capacity(&self) -> bool {
        match self.max_occurrences {
            Some(max) => self.occurrences < max,
            None => true,
        }
    }

    /// Record one more relating requirement
    pub fn relate(&mut self) -> bool {
        if self.has_capacity() {
            self.occurrences += 1;
            true
        } else {
            false
        }
    }
}

/// A requirement, resolved (or not) to a target capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub target_capability_name: Option<String>,
}

// ============================================================================
// ARTIFACTS
// ============================================================================

/// A deployable artifact attached to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub type_name: String,
    pub source_path: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, ModelValue>,
}
