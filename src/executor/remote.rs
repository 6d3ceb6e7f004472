//! Remote task executor
//!
//! Schedules tasks on an external broker and maps the broker's lifecycle
//! stream back onto the engine's event bus. The broker client itself is an
//! external collaborator behind the [`Broker`] trait; the in-process
//! implementation below exists for tests and single-host setups. Startup is
//! synchronized through a one-shot ready signal with a 30-second timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{context_from_envelope, context_to_envelope, ContextEnvelope};
use crate::errors::ExecutorError;
use crate::events::EventBus;
use crate::ids::TaskId;

use super::{Executor, ExecutorTask, OperationRegistry};

/// How long to wait for the receiver thread to come up
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `close` waits for in-flight remote tasks to report back
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A task as published to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTaskEnvelope {
    pub task_id: u64,
    pub operation_mapping: String,
    pub context: ContextEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteLifecycleKind {
    Started,
    Succeeded,
    Failed,
}

/// A lifecycle message consumed from the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLifecycleMessage {
    pub task_id: u64,
    pub kind: RemoteLifecycleKind,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client contract for the external broker
pub trait Broker: Send + Sync {
    fn publish(&self, envelope: RemoteTaskEnvelope) -> Result<(), ExecutorError>;

    /// Subscribe to the task lifecycle stream; called once by the executor
    fn subscribe(&self) -> Result<Receiver<RemoteLifecycleMessage>, ExecutorError>;
}

pub struct RemoteExecutor {
    broker: Arc<dyn Broker>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Sender<()>,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl RemoteExecutor {
    pub fn new(broker: Arc<dyn Broker>, bus: EventBus) -> Result<Self, ExecutorError> {
        let (ready_tx, ready_rx) = bounded::<Result<(), ExecutorError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let receiver = {
            let broker = Arc::clone(&broker);
            let in_flight = Arc::clone(&in_flight);
            std::thread::Builder::new()
                .name("maestro-remote-recv".to_string())
                .spawn(move || {
                    let messages = match broker.subscribe() {
                        Ok(messages) => {
                            let _ = ready_tx.send(Ok(()));
                            messages
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    receive_loop(&messages, &stop_rx, &bus, &in_flight);
                })
                .expect("failed to spawn receiver thread")
        };

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => debug!("remote executor receiver ready"),
            Ok(Err(err)) => {
                let _ = receiver.join();
                return Err(err);
            }
            Err(_) => return Err(ExecutorError::ReadyTimeout(READY_TIMEOUT)),
        }

        Ok(RemoteExecutor {
            broker,
            receiver: Mutex::new(Some(receiver)),
            stop_tx,
            in_flight,
            closed: AtomicBool::new(false),
        })
    }
}

fn receive_loop(
    messages: &Receiver<RemoteLifecycleMessage>,
    stop_rx: &Receiver<()>,
    bus: &EventBus,
    in_flight: &AtomicUsize,
) {
    loop {
        crossbeam_channel::select! {
            recv(messages) -> message => match message {
                Ok(message) => {
                    let task_id = TaskId::new(message.task_id);
                    match message.kind {
                        RemoteLifecycleKind::Started => bus.task_started(task_id),
                        RemoteLifecycleKind::Succeeded => {
                            bus.task_succeeded(task_id);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        RemoteLifecycleKind::Failed => {
                            bus.task_failed(
                                task_id,
                                message.error.unwrap_or_else(|| "remote task failed".to_string()),
                            );
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                }
                // Broker side went away
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }
    }
}

impl Executor for RemoteExecutor {
    fn execute(&self, task: ExecutorTask) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }
        let envelope = RemoteTaskEnvelope {
            task_id: task.task_id.get(),
            operation_mapping: task.operation_mapping.clone(),
            context: context_to_envelope(&task.context)?,
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.broker.publish(envelope) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Second close: the receiver is already being torn down
        }

        // Drain: wait for every published task to report a terminal state
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "closing remote executor with unreported tasks"
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = self.stop_tx.try_send(());
        if let Some(receiver) = self.receiver.lock().take() {
            let _ = receiver.join();
        }
    }
}

impl Drop for RemoteExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// IN-PROCESS BROKER
// ============================================================================

/// Channel-backed broker running tasks on its own worker thread
///
/// Stands in for the real AMQP client in tests and single-host setups; the
/// envelope/lifecycle traffic is byte-for-byte what a remote worker would
/// see.
pub struct InProcessBroker {
    task_tx: Mutex<Option<Sender<RemoteTaskEnvelope>>>,
    lifecycle_rx: Mutex<Option<Receiver<RemoteLifecycleMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessBroker {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        let (task_tx, task_rx) = unbounded::<RemoteTaskEnvelope>();
        let (lifecycle_tx, lifecycle_rx) = unbounded::<RemoteLifecycleMessage>();

        let worker = std::thread::Builder::new()
            .name("maestro-broker-worker".to_string())
            .spawn(move || {
                for envelope in task_rx.iter() {
                    let _ = lifecycle_tx.send(RemoteLifecycleMessage {
                        task_id: envelope.task_id,
                        kind: RemoteLifecycleKind::Started,
                        error: None,
                    });
                    let message = match run_remote(&registry, &envelope) {
                        Ok(()) => RemoteLifecycleMessage {
                            task_id: envelope.task_id,
                            kind: RemoteLifecycleKind::Succeeded,
                            error: None,
                        },
                        Err(error) => RemoteLifecycleMessage {
                            task_id: envelope.task_id,
                            kind: RemoteLifecycleKind::Failed,
                            error: Some(error),
                        },
                    };
                    let _ = lifecycle_tx.send(message);
                }
            })
            .expect("failed to spawn broker worker");

        InProcessBroker {
            task_tx: Mutex::new(Some(task_tx)),
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop the worker thread; pending tasks are abandoned
    pub fn shutdown(&self) {
        self.task_tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_remote(registry: &OperationRegistry, envelope: &RemoteTaskEnvelope) -> Result<(), String> {
    let context = context_from_envelope(&envelope.context).map_err(|e| e.to_string())?;
    let operation = registry
        .resolve(&envelope.operation_mapping)
        .map_err(|e| e.to_string())?;
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| operation(&context))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("operation panicked".to_string()),
    }
}

impl Broker for InProcessBroker {
    fn publish(&self, envelope: RemoteTaskEnvelope) -> Result<(), ExecutorError> {
        match self.task_tx.lock().as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| ExecutorError::Broker("broker worker is gone".to_string())),
            None => Err(ExecutorError::Broker("broker is shut down".to_string())),
        }
    }

    fn subscribe(&self) -> Result<Receiver<RemoteLifecycleMessage>, ExecutorError> {
        self.lifecycle_rx
            .lock()
            .take()
            .ok_or_else(|| ExecutorError::Broker("lifecycle stream already subscribed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OperationContext;
    use crate::events::EventKind;
    use crate::ids::{ApiId, ExecutionId, NodeId, ServiceId};
    use crate::model::{ActorRef, Execution, Node, Service, StubType, TaskModel};
    use crate::storage::ModelStorage;
    use std::collections::BTreeMap;

    fn disk_task(mapping: &str) -> (tempfile::TempDir, ExecutorTask) {
        let dir = tempfile::tempdir().unwrap();
        let model = ModelStorage::on_disk(dir.path()).unwrap();

        let service_id = ServiceId::new(model.services().put(Service::new("svc")).unwrap());
        let node_id = NodeId::new(model.nodes().put(Node::new("web_1", "T")).unwrap());
        let execution_id = ExecutionId::new(
            model
                .executions()
                .put(Execution::new(service_id, "install"))
                .unwrap(),
        );
        let task_id = TaskId::new(
            model
                .tasks()
                .put(TaskModel::stub(
                    execution_id,
                    ApiId::new("remote.op").unwrap(),
                    StubType::None,
                    vec![],
                ))
                .unwrap(),
        );

        let task = ExecutorTask {
            task_id,
            operation_mapping: mapping.to_string(),
            context: OperationContext::new(
                "remote.op",
                service_id,
                task_id,
                ActorRef::Node(node_id),
                BTreeMap::new(),
                Some(model),
                None,
            ),
        };
        (dir, task)
    }

    #[test]
    fn remote_round_trip_success() {
        let registry = Arc::new(OperationRegistry::new());
        registry.register("tests.remote_ok", |_| Ok(()));
        let broker = Arc::new(InProcessBroker::new(registry));
        let (bus, _rx) = EventBus::channel();
        let executor = RemoteExecutor::new(broker.clone(), bus.clone()).unwrap();

        let (_dir, task) = disk_task("tests.remote_ok");
        executor.execute(task.clone()).unwrap();
        executor.close();
        broker.shutdown();

        let events = bus.task_events(task.task_id);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, EventKind::TaskStarted { .. }));
        assert!(matches!(events[1].kind, EventKind::TaskSucceeded { .. }));
    }

    #[test]
    fn remote_failures_carry_the_error() {
        let registry = Arc::new(OperationRegistry::new());
        registry.register("tests.remote_bad", |_| anyhow::bail!("remote kaput"));
        let broker = Arc::new(InProcessBroker::new(registry));
        let (bus, _rx) = EventBus::channel();
        let executor = RemoteExecutor::new(broker.clone(), bus.clone()).unwrap();

        let (_dir, task) = disk_task("tests.remote_bad");
        executor.execute(task.clone()).unwrap();
        executor.close();
        broker.shutdown();

        let events = bus.task_events(task.task_id);
        assert!(matches!(
            &events[1].kind,
            EventKind::TaskFailed { error, .. } if error.contains("remote kaput")
        ));
    }

    #[test]
    fn double_subscribe_is_rejected() {
        let registry = Arc::new(OperationRegistry::new());
        let broker = InProcessBroker::new(registry);
        let first = broker.subscribe();
        assert!(first.is_ok());
        assert!(broker.subscribe().is_err());
        broker.shutdown();
    }

    #[test]
    fn close_after_close_is_a_no_op() {
        let registry = Arc::new(OperationRegistry::new());
        let broker = Arc::new(InProcessBroker::new(registry));
        let (bus, _rx) = EventBus::channel();
        let executor = RemoteExecutor::new(broker.clone(), bus).unwrap();

        executor.close();
        executor.close();
        broker.shutdown();
    }
}
