//! Operation-context serialization for process boundaries
//!
//! The envelope carries the connection strings of the storages, never the
//! connections. A worker rebuilds its storages from the specs, then
//! refetches the task row for the operation mapping and inputs. In-memory
//! storages have no spec and are refused here, which is what lets the
//! process-pool executor fail fast at configuration time.

use serde::{Deserialize, Serialize};

use crate::context::OperationContext;
use crate::errors::StorageError;
use crate::ids::{NodeId, RelationshipId, ServiceId, TaskId};
use crate::model::ActorRef;
use crate::storage::{FileResourceStorage, ModelStorage, ResourceSpec, StorageSpec};

/// Wire form of an [`OperationContext`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEnvelope {
    pub context_cls: String,
    pub context: ContextFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFields {
    pub name: String,
    pub deployment_id: u64,
    pub task_id: u64,
    pub actor_id: u64,
    pub model_storage: Option<StorageApiSpec>,
    pub resource_storage: Option<ResourceApiSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageApiSpec {
    pub api_cls: String,
    pub api_kwargs: StorageKwargs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageKwargs {
    pub engine_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceApiSpec {
    pub api_cls: String,
    pub api_kwargs: ResourceKwargs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceKwargs {
    pub directory: String,
}

/// Serialize a context to its wire form
///
/// Fails with [`StorageError::NotSerializable`] when the model storage has
/// no connection string (the in-memory backend).
pub fn context_to_envelope(ctx: &OperationContext) -> Result<ContextEnvelope, StorageError> {
    let model_storage = match ctx.model() {
        Ok(model) => {
            let spec = model.serial_spec().ok_or(StorageError::NotSerializable)?;
            Some(StorageApiSpec {
                api_cls: spec.api.clone(),
                api_kwargs: StorageKwargs {
                    engine_url: spec.url.clone(),
                },
            })
        }
        Err(_) => None,
    };

    let resource_storage = match ctx.resource() {
        Ok(resource) => {
            let spec = resource.serial_spec().ok_or(StorageError::NotSerializable)?;
            Some(ResourceApiSpec {
                api_cls: spec.api,
                api_kwargs: ResourceKwargs {
                    directory: spec.directory,
                },
            })
        }
        Err(_) => None,
    };

    Ok(ContextEnvelope {
        context_cls: ctx.variant_name().to_string(),
        context: ContextFields {
            name: ctx.name.clone(),
            deployment_id: ctx.service_id.get(),
            task_id: ctx.task_id.get(),
            actor_id: ctx.actor.raw_id(),
            model_storage,
            resource_storage,
        },
    })
}

/// Rebuild a context on the worker side of the boundary
///
/// Storages are re-instantiated from their connection strings; the task row
/// is refetched for the resolved inputs.
pub fn context_from_envelope(envelope: &ContextEnvelope) -> Result<OperationContext, StorageError> {
    let fields = &envelope.context;

    let model = match &fields.model_storage {
        Some(spec) => Some(ModelStorage::from_spec(&StorageSpec {
            api: spec.api_cls.clone(),
            url: spec.api_kwargs.engine_url.clone(),
        })?),
        None => None,
    };

    let resource = match &fields.resource_storage {
        Some(spec) => Some(FileResourceStorage::from_spec(&ResourceSpec {
            api: spec.api_cls.clone(),
            directory: spec.api_kwargs.directory.clone(),
        })?),
        None => None,
    };

    let actor = if envelope.context_cls.ends_with("RelationshipOperationContext") {
        ActorRef::Relationship(RelationshipId::new(fields.actor_id))
    } else {
        ActorRef::Node(NodeId::new(fields.actor_id))
    };

    let task_id = TaskId::new(fields.task_id);
    let inputs = match &model {
        Some(model) => model.task(task_id)?.inputs,
        None => Default::default(),
    };

    Ok(OperationContext::new(
        fields.name.clone(),
        ServiceId::new(fields.deployment_id),
        task_id,
        actor,
        inputs,
        model,
        resource,
    ))
}
