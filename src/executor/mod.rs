//! Executor abstraction
//!
//! Every backend takes tasks through the same two-method contract:
//! `execute` schedules without blocking the engine, `close` drains and is
//! idempotent. Backends publish lifecycle signals into the engine's event
//! bus - per attempt, exactly `started` then one terminal signal.

mod blocking;
mod process_pool;
pub mod registry;
mod remote;
mod thread_pool;

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::context::OperationContext;
use crate::errors::ExecutorError;
use crate::events::EventBus;
use crate::ids::TaskId;

pub use blocking::CurrentThreadExecutor;
pub use process_pool::{worker_main, ProcessPoolExecutor, WorkerMessage, WorkerRequest};
pub use registry::{OperationFn, OperationRegistry};
pub use remote::{
    Broker, InProcessBroker, RemoteExecutor, RemoteLifecycleKind, RemoteLifecycleMessage,
    RemoteTaskEnvelope,
};
pub use thread_pool::ThreadPoolExecutor;

/// A dispatched unit of work
#[derive(Debug, Clone)]
pub struct ExecutorTask {
    pub task_id: TaskId,
    pub operation_mapping: String,
    pub context: OperationContext,
}

/// Contract every execution backend satisfies
pub trait Executor: Send + Sync {
    /// Schedule the task; must not block on the task itself
    ///
    /// Emits `task_started` when work begins and exactly one of
    /// `task_succeeded` / `task_failed` when done.
    fn execute(&self, task: ExecutorTask) -> Result<(), ExecutorError>;

    /// Idempotent teardown; blocks until in-flight tasks have drained and
    /// no further signals will fire
    fn close(&self);
}

/// Shared worker body: resolve the mapping and run it, emitting the
/// per-attempt lifecycle signals
pub(crate) fn run_operation(registry: &OperationRegistry, bus: &EventBus, task: &ExecutorTask) {
    bus.task_started(task.task_id);
    debug!(task = %task.task_id, mapping = %task.operation_mapping, "running operation");

    let operation = match registry.resolve(&task.operation_mapping) {
        Ok(operation) => operation,
        Err(err) => {
            bus.task_failed(task.task_id, err.to_string());
            return;
        }
    };

    // A panicking implementation fails the attempt instead of taking the
    // worker thread down with it
    let outcome = catch_unwind(AssertUnwindSafe(|| operation(&task.context)));
    match outcome {
        Ok(Ok(())) => bus.task_succeeded(task.task_id),
        Ok(Err(err)) => bus.task_failed(task.task_id, err.to_string()),
        Err(panic) => {
            let message = panic_message(&panic);
            warn!(task = %task.task_id, %message, "operation panicked");
            bus.task_failed(task.task_id, format!("operation panicked: {}", message));
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ids::{NodeId, ServiceId};
    use crate::model::ActorRef;

    /// A bare task with no storage attached, enough for backend tests
    pub fn bare_task(task_id: u64, mapping: &str) -> ExecutorTask {
        ExecutorTask {
            task_id: TaskId::new(task_id),
            operation_mapping: mapping.to_string(),
            context: OperationContext::new(
                format!("op-{}", task_id),
                ServiceId::new(1),
                TaskId::new(task_id),
                ActorRef::Node(NodeId::new(1)),
                BTreeMap::new(),
                None,
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::bare_task;
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn run_operation_emits_started_then_success() {
        let registry = OperationRegistry::new();
        registry.register("ok", |_| Ok(()));
        let bus = EventBus::recorded();

        run_operation(&registry, &bus, &bare_task(1, "ok"));

        let kinds: Vec<_> = bus.events().into_iter().map(|e| e.kind).collect();
        assert!(matches!(kinds[0], EventKind::TaskStarted { .. }));
        assert!(matches!(kinds[1], EventKind::TaskSucceeded { .. }));
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn failing_operation_emits_exactly_one_terminal() {
        let registry = OperationRegistry::new();
        registry.register("boom", |_| anyhow::bail!("kaput"));
        let bus = EventBus::recorded();

        run_operation(&registry, &bus, &bare_task(2, "boom"));

        let terminals: Vec<_> = bus
            .events()
            .into_iter()
            .filter(|e| e.kind.is_terminal_task_event())
            .collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            &terminals[0].kind,
            EventKind::TaskFailed { error, .. } if error.contains("kaput")
        ));
    }

    #[test]
    fn unknown_mapping_fails_the_attempt() {
        let registry = OperationRegistry::new();
        let bus = EventBus::recorded();

        run_operation(&registry, &bus, &bare_task(3, "nope"));

        let kinds: Vec<_> = bus.events().into_iter().map(|e| e.kind).collect();
        assert!(matches!(kinds[1], EventKind::TaskFailed { .. }));
    }

    #[test]
    fn panicking_operation_fails_instead_of_unwinding() {
        let registry = OperationRegistry::new();
        registry.register("panics", |_| panic!("blew up"));
        let bus = EventBus::recorded();

        run_operation(&registry, &bus, &bare_task(4, "panics"));

        let kinds: Vec<_> = bus.events().into_iter().map(|e| e.kind).collect();
        assert!(matches!(
            &kinds[1],
            EventKind::TaskFailed { error, .. } if error.contains("blew up")
        ));
    }
}
