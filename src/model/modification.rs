//! Service modifications
//!
//! A [`ServiceModification`] records an in-flight change to a service's
//! instance set: which nodes were added, which are marked for removal, and
//! which are merely related to the change. The scale workflow opens one,
//! builds its graph over the partitioned node sets, and then finishes or
//! rolls the modification back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::WorkflowError;
use crate::ids::{ModificationId, NodeId, RelationshipId, ServiceId};
use crate::model::service::{Node, NodeState, Relationship};
use crate::storage::ModelStorage;

/// Status of a service modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModificationStatus {
    Started,
    Finished,
    Rolledback,
}

/// Role of a node within a modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModificationRole {
    Added,
    Removed,
    Related,
}

/// A node touched by a modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedNode {
    pub node_id: NodeId,
    pub role: ModificationRole,
}

/// One row per opened modification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceModification {
    pub id: ModificationId,
    pub service_id: ServiceId,
    pub status: ModificationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Requested planned instance counts, keyed by template or group name
    #[serde(default)]
    pub changes: BTreeMap<String, u64>,
    /// Added nodes plus the unchanged nodes they relate to
    #[serde(default)]
    pub added_and_related: Vec<ModifiedNode>,
    /// Removal-marked nodes plus the unchanged nodes they relate to
    #[serde(default)]
    pub removed_and_related: Vec<ModifiedNode>,
}

impl ServiceModification {
    fn ids_with_role(list: &[ModifiedNode], role: ModificationRole) -> Vec<NodeId> {
        list.iter()
            .filter(|m| m.role == role)
            .map(|m| m.node_id)
            .collect()
    }

    pub fn added(&self) -> Vec<NodeId> {
        Self::ids_with_role(&self.added_and_related, ModificationRole::Added)
    }

    pub fn removed(&self) -> Vec<NodeId> {
        Self::ids_with_role(&self.removed_and_related, ModificationRole::Removed)
    }
}

/// Open a modification that grows or shrinks instance sets to the planned
/// counts in `changes`
///
/// Growth clones existing instances of the named template (including their
/// outbound relationships); shrinkage marks the youngest instances for
/// removal. Actual deletion is deferred to [`finish_modification`] so a
/// rollback can restore the previous shape.
pub fn modify_service(
    model: &ModelStorage,
    service_id: ServiceId,
    changes: BTreeMap<String, u64>,
) -> Result<ServiceModification, WorkflowError> {
    let service = model.service(service_id)?;

    let mut modification = ServiceModification {
        id: ModificationId::new(0),
        service_id,
        status: ModificationStatus::Started,
        created_at: Utc::now(),
        ended_at: None,
        changes: changes.clone(),
        added_and_related: Vec::new(),
        removed_and_related: Vec::new(),
    };

    for (entity_name, planned) in &changes {
        let instances = entity_instances(model, service_id, entity_name)?;
        if instances.is_empty() {
            return Err(WorkflowError::UnknownScalableEntity(entity_name.clone()));
        }
        let current = instances.len() as u64;

        if *planned > current {
            let template = &instances[0];
            for _ in current..*planned {
                let added_id = clone_node_instance(model, template)?;
                modification.added_and_related.push(ModifiedNode {
                    node_id: added_id,
                    role: ModificationRole::Added,
                });
            }
        } else if *planned < current {
            // Youngest instances go first
            for instance in instances.iter().rev().take((current - *planned) as usize) {
                modification.removed_and_related.push(ModifiedNode {
                    node_id: instance.id,
                    role: ModificationRole::Removed,
                });
            }
        }
    }

    attach_related(model, &mut modification)?;

    let id = model.modifications().put(modification.clone())?;
    modification.id = ModificationId::new(id);
    debug!(modification = %modification.id, service = %service.name, "opened service modification");
    Ok(modification)
}

/// Commit a modification: removal-marked nodes are deleted for real
pub fn finish_modification(
    model: &ModelStorage,
    id: ModificationId,
) -> Result<(), WorkflowError> {
    let mut modification = model.modification(id)?;
    for node_id in modification.removed() {
        delete_node_instance(model, node_id)?;
    }
    modification.status = ModificationStatus::Finished;
    modification.ended_at = Some(Utc::now());
    model.modifications().update(&modification)?;
    debug!(modification = %id, "service modification finished");
    Ok(())
}

/// Undo a modification: added nodes are deleted, removal marks are dropped
pub fn rollback_modification(
    model: &ModelStorage,
    id: ModificationId,
) -> Result<(), WorkflowError> {
    let mut modification = model.modification(id)?;
    for node_id in modification.added() {
        delete_node_instance(model, node_id)?;
    }
    modification.status = ModificationStatus::Rolledback;
    modification.ended_at = Some(Utc::now());
    model.modifications().update(&modification)?;
    debug!(modification = %id, "service modification rolled back");
    Ok(())
}

/// Instances of a template or group within a service, in instantiation order
fn entity_instances(
    model: &ModelStorage,
    service_id: ServiceId,
    entity_name: &str,
) -> Result<Vec<Node>, WorkflowError> {
    let service = model.service(service_id)?;

    if let Some(group) = service.groups.get(entity_name) {
        let mut members = Vec::with_capacity(group.member_node_ids.len());
        for node_id in &group.member_node_ids {
            members.push(model.node(*node_id)?);
        }
        return Ok(members);
    }

    let mut instances = Vec::new();
    for node_id in &service.node_ids {
        let node = model.node(*node_id)?;
        if node.template_name == entity_name {
            instances.push(node);
        }
    }
    Ok(instances)
}

/// Clone a node instance (fresh ids, initial state) with its outbound
/// relationships re-created against the same targets
fn clone_node_instance(model: &ModelStorage, template: &Node) -> Result<NodeId, WorkflowError> {
    let mut clone = template.clone();
    clone.id = NodeId::new(0);
    clone.state = NodeState::Initial;
    clone.runtime_properties.clear();
    clone.relationship_ids.clear();
    clone.host_id = None;

    let id = NodeId::new(model.nodes().put(clone.clone())?);
    clone.id = id;
    clone.name = format!("{}_{}", template.template_name, id);
    if template.is_compute() {
        clone.host_id = Some(id);
    } else {
        clone.host_id = template.host_id;
    }

    for rel_id in &template.relationship_ids {
        let template_rel = model.relationship(*rel_id)?;
        let rel = Relationship {
            id: RelationshipId::new(0),
            source_id: id,
            ..template_rel
        };
        let rel_id = RelationshipId::new(model.relationships().put(rel)?);
        clone.relationship_ids.push(rel_id);
    }
    model.nodes().update(&clone)?;

    let mut service = model.service(clone.service_id)?;
    service.node_ids.push(id);
    if let Some(group) = service
        .groups
        .values_mut()
        .find(|g| g.member_node_ids.contains(&template.id))
    {
        group.member_node_ids.push(id);
    }
    model.services().update(&service)?;

    Ok(id)
}

/// Remove a node instance and its outbound relationships from the model
fn delete_node_instance(model: &ModelStorage, node_id: NodeId) -> Result<(), WorkflowError> {
    let node = model.node(node_id)?;
    for rel_id in &node.relationship_ids {
        model.relationships().delete(rel_id.get())?;
    }

    let mut service = model.service(node.service_id)?;
    service.node_ids.retain(|id| *id != node_id);
    for group in service.groups.values_mut() {
        group.member_node_ids.retain(|id| *id != node_id);
    }
    model.services().update(&service)?;

    model.nodes().delete(node_id.get())?;
    Ok(())
}

/// Fill in the `related` entries: unchanged neighbors of the changed nodes
fn attach_related(
    model: &ModelStorage,
    modification: &mut ServiceModification,
) -> Result<(), WorkflowError> {
    let service = model.service(modification.service_id)?;

    let added = modification.added();
    let removed = modification.removed();

    let mut added_related = Vec::new();
    for node_id in &added {
        let node = model.node(*node_id)?;
        for rel_id in &node.relationship_ids {
            let rel = model.relationship(*rel_id)?;
            if !added.contains(&rel.target_id) && !added_related.contains(&rel.target_id) {
                added_related.push(rel.target_id);
            }
        }
    }

    let mut removed_related = Vec::new();
    for node_id in &service.node_ids {
        let node = model.node(*node_id)?;
        if removed.contains(&node.id) {
            for rel_id in &node.relationship_ids {
                let rel = model.relationship(*rel_id)?;
                if !removed.contains(&rel.target_id) && !removed_related.contains(&rel.target_id) {
                    removed_related.push(rel.target_id);
                }
            }
        } else {
            // An unchanged node pointing into the removed set is related too
            for rel_id in &node.relationship_ids {
                let rel = model.relationship(*rel_id)?;
                if removed.contains(&rel.target_id) && !removed_related.contains(&node.id) {
                    removed_related.push(node.id);
                }
            }
        }
    }

    modification.added_and_related.extend(
        added_related
            .into_iter()
            .map(|node_id| ModifiedNode {
                node_id,
                role: ModificationRole::Related,
            }),
    );
    modification.removed_and_related.extend(
        removed_related
            .into_iter()
            .map(|node_id| ModifiedNode {
                node_id,
                role: ModificationRole::Related,
            }),
    );
    Ok(())
}
