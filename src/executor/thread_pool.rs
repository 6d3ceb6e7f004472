//! Worker-thread pool executor
//!
//! A fixed pool pulling from a bounded queue. `execute` enqueues and
//! returns; workers resolve the mapping, invoke the implementation and emit
//! the lifecycle signals. Retries stay the engine's responsibility - a
//! worker never re-runs a task on its own.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::ExecutorError;
use crate::events::EventBus;

use super::{run_operation, Executor, ExecutorTask, OperationRegistry};

/// Queue capacity used when the caller does not pick one
const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub struct ThreadPoolExecutor {
    sender: Mutex<Option<Sender<ExecutorTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(pool_size: usize, registry: Arc<OperationRegistry>, bus: EventBus) -> Self {
        Self::with_queue_capacity(pool_size, DEFAULT_QUEUE_CAPACITY, registry, bus)
    }

    pub fn with_queue_capacity(
        pool_size: usize,
        queue_capacity: usize,
        registry: Arc<OperationRegistry>,
        bus: EventBus,
    ) -> Self {
        assert!(pool_size >= 1, "pool size must be at least 1");
        let (tx, rx) = bounded::<ExecutorTask>(queue_capacity.max(1));

        let workers = (0..pool_size)
            .map(|index| {
                let rx = rx.clone();
                let registry = Arc::clone(&registry);
                let bus = bus.clone();
                std::thread::Builder::new()
                    .name(format!("maestro-worker-{}", index + 1))
                    .spawn(move || {
                        // The iterator ends when the sender side is dropped
                        for task in rx.iter() {
                            run_operation(&registry, &bus, &task);
                        }
                        debug!(worker = index + 1, "worker thread drained");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        ThreadPoolExecutor {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: ExecutorTask) -> Result<(), ExecutorError> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            // Bounded queue: applies backpressure to the engine when full
            Some(tx) => tx.send(task).map_err(|_| ExecutorError::Closed),
            None => Err(ExecutorError::Closed),
        }
    }

    fn close(&self) {
        // Dropping the sender lets workers drain the queue and exit
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.close();
    }
}
