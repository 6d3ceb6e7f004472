//! # Maestro
//!
//! Workflow execution core for declarative service topologies.
//!
//! ## Overview
//!
//! Maestro takes an already-instantiated service model (nodes,
//! relationships, interfaces, operations) and turns any named workflow into
//! a DAG of tasks it then drives to completion across pluggable execution
//! backends. This crate is the core only: the DSL parser, CLI front-end and
//! storage drivers are external collaborators consuming the interfaces
//! defined here.
//!
//! ## Architecture
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Model | [`model`] | Topology entities + intrinsic-function evaluator |
//! | Storage | [`storage`] | Model/resource storage contracts and backends |
//! | Graph | [`graph`] | User-facing task-graph API |
//! | Compiler | [`compiler`] | API graph -> persisted execution graph |
//! | Engine | [`engine`] | Cooperative driver over the execution graph |
//! | Executors | [`executor`] | In-thread, thread-pool, process-pool, remote |
//! | Contexts | [`context`] | Workflow/operation contexts + IPC envelope |
//! | Built-ins | [`builtin`] | install, uninstall, heal, scale, execute_operation |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use maestro::{
//!     builtin, compiler, Engine, EventBus, CurrentThreadExecutor,
//!     OperationRegistry, TaskGraph, WorkflowContext,
//! };
//!
//! let registry = Arc::new(OperationRegistry::new());
//! registry.register("web.create", |ctx| {
//!     ctx.set_runtime_property("created", serde_json::json!(true))?;
//!     Ok(())
//! });
//!
//! let (bus, events) = EventBus::channel();
//! let ctx = WorkflowContext::new("install", model, None, service_id, execution_id);
//!
//! let mut graph = TaskGraph::new("install");
//! builtin::install(&ctx, &mut graph)?;
//! compiler::create_execution_tasks(&ctx, &graph)?;
//!
//! let executor = Arc::new(CurrentThreadExecutor::new(registry, bus.clone()));
//! Engine::new(ctx, executor, bus, events).execute()?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Concurrency model
//!
//! The engine is a single-threaded cooperative driver; parallelism comes
//! exclusively from executors. Backends publish lifecycle signals into an
//! [`EventBus`] owned by the engine, which is the sole subscriber and the
//! only mutator of task state.

pub mod builtin;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph;
pub mod ids;
pub mod model;
pub mod storage;

// Re-export the main types
pub use compiler::{create_execution_tasks, CompiledWorkflow};
pub use context::{OperationContext, WorkflowContext};
pub use engine::{request_cancel, Engine};
pub use errors::{
    EngineError, ExecutorError, FunctionError, GraphError, OrchestratorError, StorageError,
    ValueError, WorkflowError,
};
pub use events::{Event, EventBus, EventKind};
pub use executor::{
    Broker, CurrentThreadExecutor, Executor, ExecutorTask, InProcessBroker, OperationRegistry,
    ProcessPoolExecutor, RemoteExecutor, ThreadPoolExecutor,
};
pub use graph::{ApiTask, OperationTask, StubTask, TaskGraph, WorkflowTask};
pub use ids::{
    ApiId, ExecutionId, ModificationId, NodeId, RelationshipId, ServiceId, TaskId,
};
pub use model::{
    ActorRef, Evaluation, Execution, ExecutionStatus, IntrinsicFunction, ModelValue, Node,
    NodeState, Operation, Relationship, Service, StubType, TaskModel, TaskStatus,
};
pub use storage::{
    EntityStore, FileResourceStorage, ModelStorage, ResourceKind, ResourceStorage,
};
