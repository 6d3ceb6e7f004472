//! In-memory representation of a topology instance
//!
//! - [`service`] - nodes, relationships, interfaces, operations
//! - [`value`] / [`functions`] - deferred values and their evaluator
//! - [`execution`] - executions and execution-graph tasks
//! - [`modification`] - instance-set changes driven by scale

pub mod execution;
pub mod functions;
pub mod modification;
pub mod service;
pub mod value;

pub use execution::{
    ActorKind, ActorRef, Execution, ExecutionStatus, StubType, TaskModel, TaskStatus,
};
pub use functions::{Container, Evaluation, Scope};
pub use modification::{
    finish_modification, modify_service, rollback_modification, ModificationRole,
    ModificationStatus, ModifiedNode, ServiceModification,
};
pub use service::{
    Artifact, Capability, Group, Interface, Node, NodeState, Operation, Plugin, Policy,
    Relationship, Requirement, Service,
};
pub use value::{IntrinsicFunction, ModelValue};
