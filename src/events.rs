//! Task and workflow lifecycle signals
//!
//! The engine owns an [`EventBus`] and hands clones to executors at
//! construction time; backends publish into it from their worker threads
//! and the engine is the sole subscriber. Every signal is also appended to
//! a recorded log so tests can assert on ordering after the fact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, TaskId};

/// Single signal in the lifecycle stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence id (for ordering)
    pub id: u64,
    /// Time since bus creation (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All lifecycle signals, workflow level and task level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted {
        execution_id: ExecutionId,
    },
    WorkflowSucceeded {
        execution_id: ExecutionId,
    },
    WorkflowFailed {
        execution_id: ExecutionId,
        error: String,
        failed_task: Option<TaskId>,
    },
    WorkflowCancelled {
        execution_id: ExecutionId,
    },

    /// The engine handed the task to an executor
    TaskSent {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskSucceeded {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
}

impl EventKind {
    /// Extract the task id if this is a task-level signal
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskSent { task_id }
            | Self::TaskStarted { task_id }
            | Self::TaskSucceeded { task_id }
            | Self::TaskFailed { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    pub fn is_workflow_event(&self) -> bool {
        matches!(
            self,
            Self::WorkflowStarted { .. }
                | Self::WorkflowSucceeded { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Terminal task signals: exactly one per attempt
    pub fn is_terminal_task_event(&self) -> bool {
        matches!(self, Self::TaskSucceeded { .. } | Self::TaskFailed { .. })
    }
}

/// Thread-safe signal bus with an append-only recorded log
#[derive(Clone)]
pub struct EventBus {
    log: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
    tx: Option<Sender<Event>>,
}

impl EventBus {
    /// A bus wired to a subscriber channel; the engine holds the receiver
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = unbounded();
        (
            EventBus {
                log: Arc::new(RwLock::new(Vec::new())),
                start_time: Instant::now(),
                next_id: Arc::new(AtomicU64::new(0)),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// A record-only bus for tests and one-shot tools
    pub fn recorded() -> Self {
        EventBus {
            log: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
            tx: None,
        }
    }

    /// Emit a signal (thread-safe, returns the sequence id)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.log.write().push(event.clone());
        if let Some(tx) = &self.tx {
            // The subscriber may already be gone during teardown
            let _ = tx.send(event);
        }
        id
    }

    // ------------------------------------------------------------------
    // Executor-facing helpers: one call per lifecycle transition
    // ------------------------------------------------------------------

    pub fn task_started(&self, task_id: TaskId) {
        self.emit(EventKind::TaskStarted { task_id });
    }

    pub fn task_succeeded(&self, task_id: TaskId) {
        self.emit(EventKind::TaskSucceeded { task_id });
    }

    pub fn task_failed(&self, task_id: TaskId, error: impl Into<String>) {
        self.emit(EventKind::TaskFailed {
            task_id,
            error: error.into(),
        });
    }

    // ------------------------------------------------------------------
    // Recorded-log accessors
    // ------------------------------------------------------------------

    pub fn events(&self) -> Vec<Event> {
        self.log.read().clone()
    }

    pub fn task_events(&self, task_id: TaskId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.task_id() == Some(task_id))
            .collect()
    }

    pub fn workflow_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_workflow_event())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_delivers_to_subscriber_and_log() {
        let (bus, rx) = EventBus::channel();
        bus.task_started(TaskId::new(1));
        bus.task_succeeded(TaskId::new(1));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::TaskStarted { task_id: TaskId::new(1) });
        let second = rx.try_recv().unwrap();
        assert!(second.kind.is_terminal_task_event());
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn sequence_ids_are_monotonic() {
        let bus = EventBus::recorded();
        let a = bus.emit(EventKind::WorkflowStarted {
            execution_id: ExecutionId::new(1),
        });
        bus.task_started(TaskId::new(1));
        let c = bus.emit(EventKind::WorkflowSucceeded {
            execution_id: ExecutionId::new(1),
        });
        assert_eq!(a, 0);
        assert_eq!(c, 2);
    }

    #[test]
    fn task_filter_picks_only_matching_signals() {
        let bus = EventBus::recorded();
        bus.task_started(TaskId::new(1));
        bus.task_started(TaskId::new(2));
        bus.task_failed(TaskId::new(1), "boom");

        let events = bus.task_events(TaskId::new(1));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind.task_id() == Some(TaskId::new(1))));
    }

    #[test]
    fn serializes_with_type_tag() {
        let kind = EventKind::TaskFailed {
            task_id: TaskId::new(3),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "task_failed");
        assert_eq!(json["task_id"], 3);
    }

    #[test]
    fn emit_survives_dropped_subscriber() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.task_started(TaskId::new(9));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn concurrent_emits_get_unique_ids() {
        let bus = EventBus::recorded();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bus = bus.clone();
                std::thread::spawn(move || bus.task_started(TaskId::new(i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut ids: Vec<u64> = bus.events().iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
