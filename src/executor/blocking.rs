//! In-thread blocking executor
//!
//! Runs the operation synchronously inside `execute`; the full signal
//! sequence has fired before the call returns. The simplest backend - used
//! by tests and single-task workflows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::ExecutorError;
use crate::events::EventBus;

use super::{run_operation, Executor, ExecutorTask, OperationRegistry};

pub struct CurrentThreadExecutor {
    registry: Arc<OperationRegistry>,
    bus: EventBus,
    closed: AtomicBool,
}

impl CurrentThreadExecutor {
    pub fn new(registry: Arc<OperationRegistry>, bus: EventBus) -> Self {
        CurrentThreadExecutor {
            registry,
            bus,
            closed: AtomicBool::new(false),
        }
    }
}

impl Executor for CurrentThreadExecutor {
    fn execute(&self, task: ExecutorTask) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }
        run_operation(&self.registry, &self.bus, &task);
        Ok(())
    }

    fn close(&self) {
        // No in-flight work can exist: execute is synchronous
        self.closed.store(true, Ordering::SeqCst);
    }
}
