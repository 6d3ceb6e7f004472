//! Out-of-process worker pool executor
//!
//! Each task runs in a fresh worker process (one task per child). The
//! operation context crosses the boundary as a JSON envelope carrying
//! storage connection strings; lifecycle messages come back as JSON lines
//! on the child's stdout. Combining this executor with an in-memory model
//! storage is refused at construction time - there is no connection string
//! to hand the child.
//!
//! The host binary must route itself into [`worker_main`] when it is
//! started as a worker (the spawn sets `MAESTRO_WORKER=1`), after running
//! the same operation-registration code as the parent.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{context_from_envelope, context_to_envelope, ContextEnvelope};
use crate::errors::ExecutorError;
use crate::events::EventBus;
use crate::ids::TaskId;
use crate::storage::ModelStorage;

use super::{Executor, ExecutorTask, OperationRegistry};

/// Environment variable marking a spawned worker process
pub const WORKER_ENV_VAR: &str = "MAESTRO_WORKER";

/// One task request on the worker's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: u64,
    pub operation_mapping: String,
    pub context: ContextEnvelope,
}

/// Lifecycle messages on the worker's stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    TaskStarted { task_id: u64 },
    TaskSucceeded { task_id: u64 },
    TaskFailed { task_id: u64, error: String },
}

pub struct ProcessPoolExecutor {
    command: Vec<String>,
    bus: EventBus,
    slot_rx: Receiver<()>,
    slot_tx: Sender<()>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProcessPoolExecutor {
    /// Pool over the current executable re-run in worker mode
    pub fn new(
        pool_size: usize,
        model: &ModelStorage,
        bus: EventBus,
    ) -> Result<Self, ExecutorError> {
        let exe = std::env::current_exe()
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        Self::with_command(pool_size, vec![exe], model, bus)
    }

    /// Pool over an explicit worker command line
    pub fn with_command(
        pool_size: usize,
        command: Vec<String>,
        model: &ModelStorage,
        bus: EventBus,
    ) -> Result<Self, ExecutorError> {
        assert!(pool_size >= 1, "pool size must be at least 1");
        if command.is_empty() {
            return Err(ExecutorError::Spawn("empty worker command".to_string()));
        }
        // Fail fast: an unserializable storage can never reach a child
        if model.serial_spec().is_none() {
            return Err(ExecutorError::Storage(
                crate::errors::StorageError::NotSerializable,
            ));
        }

        let (slot_tx, slot_rx) = bounded(pool_size);
        for _ in 0..pool_size {
            slot_tx.send(()).expect("fresh channel has capacity");
        }

        Ok(ProcessPoolExecutor {
            command,
            bus,
            slot_rx,
            slot_tx,
            monitors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn spawn_monitor(&self, request: WorkerRequest) {
        let command = self.command.clone();
        let bus = self.bus.clone();
        let slot_rx = self.slot_rx.clone();
        let slot_tx = self.slot_tx.clone();

        let handle = std::thread::Builder::new()
            .name(format!("maestro-proc-{}", request.task_id))
            .spawn(move || {
                // Bound concurrent children by the pool size
                if slot_rx.recv().is_err() {
                    return;
                }
                run_child(&command, &request, &bus);
                let _ = slot_tx.send(());
            })
            .expect("failed to spawn monitor thread");

        self.monitors.lock().push(handle);
    }
}

impl Executor for ProcessPoolExecutor {
    fn execute(&self, task: ExecutorTask) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }

        let envelope = context_to_envelope(&task.context)?;
        let request = WorkerRequest {
            task_id: task.task_id.get(),
            operation_mapping: task.operation_mapping.clone(),
            context: envelope,
        };
        self.spawn_monitor(request);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let monitors = std::mem::take(&mut *self.monitors.lock());
        for monitor in monitors {
            let _ = monitor.join();
        }
    }
}

impl Drop for ProcessPoolExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drive one child process through one task
fn run_child(command: &[String], request: &WorkerRequest, bus: &EventBus) {
    let task_id = TaskId::new(request.task_id);

    let mut child = match Command::new(&command[0])
        .args(&command[1..])
        .env(WORKER_ENV_VAR, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            // Per-attempt contract: started, then exactly one terminal
            bus.task_started(task_id);
            bus.task_failed(task_id, format!("failed to spawn worker process: {}", err));
            return;
        }
    };

    let wrote = child.stdin.take().map(|mut stdin| {
        serde_json::to_string(request)
            .map_err(|e| e.to_string())
            .and_then(|line| {
                writeln!(stdin, "{}", line).map_err(|e| e.to_string())
            })
    });
    if let Some(Err(err)) = wrote {
        bus.task_started(task_id);
        bus.task_failed(task_id, format!("worker ipc failure: {}", err));
        let _ = child.kill();
        let _ = child.wait();
        return;
    }

    let stdout = child.stdout.take().expect("stdout was piped");
    let mut saw_started = false;
    let mut saw_terminal = false;
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => line,
            Err(_) => break,
        };
        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::TaskStarted { task_id }) => {
                saw_started = true;
                bus.task_started(TaskId::new(task_id));
            }
            Ok(WorkerMessage::TaskSucceeded { task_id }) => {
                saw_terminal = true;
                bus.task_succeeded(TaskId::new(task_id));
            }
            Ok(WorkerMessage::TaskFailed { task_id, error }) => {
                saw_terminal = true;
                bus.task_failed(TaskId::new(task_id), error);
            }
            Err(err) => {
                warn!(task = %task_id, %err, "undecodable worker message");
                if !saw_started {
                    bus.task_started(task_id);
                    saw_started = true;
                }
                if !saw_terminal {
                    bus.task_failed(
                        task_id,
                        format!(
                            "Could not de-serialize exception of task {}: {}",
                            request.task_id, err
                        ),
                    );
                    saw_terminal = true;
                }
            }
        }
    }

    let status = child.wait();
    if !saw_terminal {
        if !saw_started {
            bus.task_started(task_id);
        }
        let detail = match status {
            Ok(status) => format!("worker exited with {} before reporting", status),
            Err(err) => format!("failed to reap worker: {}", err),
        };
        bus.task_failed(task_id, detail);
    }
    debug!(task = %task_id, "worker process finished");
}

/// Worker-side entry point
///
/// Reads one [`WorkerRequest`] line from `input`, runs the operation from
/// `registry`, and writes lifecycle messages to `output`. The host binary
/// calls this (with stdin/stdout) when `MAESTRO_WORKER` is set, after
/// registering its operations.
pub fn worker_main<R: BufRead, W: Write>(
    registry: &OperationRegistry,
    input: R,
    mut output: W,
) -> Result<(), ExecutorError> {
    let mut lines = input.lines();
    let line = match lines.next() {
        Some(line) => line.map_err(|e| ExecutorError::Ipc(e.to_string()))?,
        None => return Ok(()),
    };
    let request: WorkerRequest =
        serde_json::from_str(&line).map_err(|e| ExecutorError::Ipc(e.to_string()))?;

    emit(&mut output, &WorkerMessage::TaskStarted {
        task_id: request.task_id,
    })?;

    let outcome = run_request(registry, &request);
    let message = match outcome {
        Ok(()) => WorkerMessage::TaskSucceeded {
            task_id: request.task_id,
        },
        Err(error) => WorkerMessage::TaskFailed {
            task_id: request.task_id,
            error,
        },
    };
    emit(&mut output, &message)
}

fn run_request(registry: &OperationRegistry, request: &WorkerRequest) -> Result<(), String> {
    let context = context_from_envelope(&request.context).map_err(|e| e.to_string())?;
    let operation = registry
        .resolve(&request.operation_mapping)
        .map_err(|e| e.to_string())?;
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| operation(&context)));
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("operation panicked".to_string()),
    }
}

fn emit<W: Write>(output: &mut W, message: &WorkerMessage) -> Result<(), ExecutorError> {
    let line = serde_json::to_string(message).map_err(|e| ExecutorError::Ipc(e.to_string()))?;
    writeln!(output, "{}", line).map_err(|e| ExecutorError::Ipc(e.to_string()))?;
    output.flush().map_err(|e| ExecutorError::Ipc(e.to_string()))
}
