//! Model storage
//!
//! The single source of truth for every entity. Each entity kind is served
//! through the same [`EntityStore`] contract regardless of backend; the
//! in-memory and directory-backed backends below must stay observably
//! identical. Callers hold ids and refetch - entities cross process
//! boundaries as rows, never as live references.

mod file;
mod memory;
pub mod resource;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::ids::{
    ExecutionId, ModificationId, NodeId, RelationshipId, ServiceId, TaskId,
};
use crate::model::{
    Execution, Node, Relationship, Service, ServiceModification, TaskModel,
};

pub use file::FileModelStorage;
pub use memory::InMemoryStore;
pub use resource::{FileResourceStorage, ResourceKind, ResourceSpec, ResourceStorage};

/// Implemented by every persistable entity kind
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn entity_id(&self) -> u64;
    fn set_entity_id(&mut self, id: u64);
    fn entity_name(&self) -> &str;
}

/// Per-kind storage contract
///
/// `put` assigns a fresh id when the entity carries id 0 and returns the
/// effective id. Each call is its own transaction.
pub trait EntityStore<T: Entity>: Send + Sync {
    fn get(&self, id: u64) -> Result<T, StorageError>;
    fn get_by_name(&self, name: &str) -> Result<T, StorageError>;
    /// All entities, ordered by id
    fn list(&self) -> Result<Vec<T>, StorageError>;
    fn put(&self, entity: T) -> Result<u64, StorageError>;
    fn update(&self, entity: &T) -> Result<(), StorageError>;
    fn delete(&self, id: u64) -> Result<(), StorageError>;

    /// Filtered listing; the default funnels through `list`
    fn list_where(&self, pred: &dyn Fn(&T) -> bool) -> Result<Vec<T>, StorageError> {
        Ok(self.list()?.into_iter().filter(|e| pred(e)).collect())
    }
}

macro_rules! entity {
    ($type:ty, $kind:literal) => {
        impl Entity for $type {
            const KIND: &'static str = $kind;

            fn entity_id(&self) -> u64 {
                self.id.get()
            }

            fn set_entity_id(&mut self, id: u64) {
                self.id = id.into();
            }

            fn entity_name(&self) -> &str {
                &self.name
            }
        }
    };
}

entity!(Service, "service");
entity!(Node, "node");
entity!(Relationship, "relationship");

impl Entity for Execution {
    const KIND: &'static str = "execution";

    fn entity_id(&self) -> u64 {
        self.id.get()
    }

    fn set_entity_id(&mut self, id: u64) {
        self.id = id.into();
    }

    fn entity_name(&self) -> &str {
        &self.workflow_name
    }
}

impl Entity for TaskModel {
    const KIND: &'static str = "task";

    fn entity_id(&self) -> u64 {
        self.id.get()
    }

    fn set_entity_id(&mut self, id: u64) {
        self.id = id.into();
    }

    fn entity_name(&self) -> &str {
        self.api_id.as_str()
    }
}

impl Entity for ServiceModification {
    const KIND: &'static str = "modification";

    fn entity_id(&self) -> u64 {
        self.id.get()
    }

    fn set_entity_id(&mut self, id: u64) {
        self.id = id.into();
    }

    fn entity_name(&self) -> &str {
        ""
    }
}

/// Serializable pointer to a storage backend, for crossing process
/// boundaries; carries the connection string, never the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub api: String,
    pub url: String,
}

/// Typed access to every entity kind through one backend
#[derive(Clone)]
pub struct ModelStorage {
    services: Arc<dyn EntityStore<Service>>,
    nodes: Arc<dyn EntityStore<Node>>,
    relationships: Arc<dyn EntityStore<Relationship>>,
    executions: Arc<dyn EntityStore<Execution>>,
    tasks: Arc<dyn EntityStore<TaskModel>>,
    modifications: Arc<dyn EntityStore<ServiceModification>>,
    spec: Option<StorageSpec>,
}

impl ModelStorage {
    /// Volatile storage for tests and single-process runs; refuses to
    /// serialize across process boundaries
    pub fn in_memory() -> Self {
        ModelStorage {
            services: Arc::new(InMemoryStore::<Service>::new()),
            nodes: Arc::new(InMemoryStore::<Node>::new()),
            relationships: Arc::new(InMemoryStore::<Relationship>::new()),
            executions: Arc::new(InMemoryStore::<Execution>::new()),
            tasks: Arc::new(InMemoryStore::<TaskModel>::new()),
            modifications: Arc::new(InMemoryStore::<ServiceModification>::new()),
            spec: None,
        }
    }

    /// Directory-backed storage; the root path doubles as the connection
    /// string handed to worker processes
    pub fn on_disk(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        Ok(ModelStorage {
            services: Arc::new(FileModelStorage::<Service>::open(root)?),
            nodes: Arc::new(FileModelStorage::<Node>::open(root)?),
            relationships: Arc::new(FileModelStorage::<Relationship>::open(root)?),
            executions: Arc::new(FileModelStorage::<Execution>::open(root)?),
            tasks: Arc::new(FileModelStorage::<TaskModel>::open(root)?),
            modifications: Arc::new(FileModelStorage::<ServiceModification>::open(root)?),
            spec: Some(StorageSpec {
                api: "file".to_string(),
                url: root.to_string_lossy().into_owned(),
            }),
        })
    }

    /// Rebuild a storage from its serialized spec (worker side of IPC)
    pub fn from_spec(spec: &StorageSpec) -> Result<Self, StorageError> {
        match spec.api.as_str() {
            "file" => Self::on_disk(&spec.url),
            other => Err(StorageError::NameNotFound {
                kind: "storage api",
                name: other.to_string(),
            }),
        }
    }

    /// The serializable pointer to this storage, if it has one
    pub fn serial_spec(&self) -> Option<&StorageSpec> {
        self.spec.as_ref()
    }

    // ------------------------------------------------------------------
    // Per-kind stores
    // ------------------------------------------------------------------

    pub fn services(&self) -> &dyn EntityStore<Service> {
        self.services.as_ref()
    }

    pub fn nodes(&self) -> &dyn EntityStore<Node> {
        self.nodes.as_ref()
    }

    pub fn relationships(&self) -> &dyn EntityStore<Relationship> {
        self.relationships.as_ref()
    }

    pub fn executions(&self) -> &dyn EntityStore<Execution> {
        self.executions.as_ref()
    }

    pub fn tasks(&self) -> &dyn EntityStore<TaskModel> {
        self.tasks.as_ref()
    }

    pub fn modifications(&self) -> &dyn EntityStore<ServiceModification> {
        self.modifications.as_ref()
    }

    // ------------------------------------------------------------------
    // Typed convenience getters
    // ------------------------------------------------------------------

    pub fn service(&self, id: ServiceId) -> Result<Service, StorageError> {
        self.services.get(id.get())
    }

    pub fn node(&self, id: NodeId) -> Result<Node, StorageError> {
        self.nodes.get(id.get())
    }

    pub fn relationship(&self, id: RelationshipId) -> Result<Relationship, StorageError> {
        self.relationships.get(id.get())
    }

    pub fn execution(&self, id: ExecutionId) -> Result<Execution, StorageError> {
        self.executions.get(id.get())
    }

    pub fn task(&self, id: TaskId) -> Result<TaskModel, StorageError> {
        self.tasks.get(id.get())
    }

    pub fn modification(&self, id: ModificationId) -> Result<ServiceModification, StorageError> {
        self.modifications.get(id.get())
    }

    /// A service's member nodes in instantiation order
    pub fn service_nodes(&self, service: &Service) -> Result<Vec<Node>, StorageError> {
        service
            .node_ids
            .iter()
            .map(|id| self.node(*id))
            .collect()
    }

    /// All tasks of an execution, ordered by id
    pub fn execution_tasks(&self, execution_id: ExecutionId) -> Result<Vec<TaskModel>, StorageError> {
        self.tasks
            .list_where(&|task: &TaskModel| task.execution_id == execution_id)
    }

    /// Delete an execution together with the tasks it owns
    pub fn delete_execution(&self, execution_id: ExecutionId) -> Result<(), StorageError> {
        for task in self.execution_tasks(execution_id)? {
            self.tasks.delete(task.id.get())?;
        }
        self.executions.delete(execution_id.get())
    }
}

impl std::fmt::Debug for ModelStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStorage")
            .field("spec", &self.spec)
            .finish()
    }
}
