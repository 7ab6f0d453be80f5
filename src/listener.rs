//! Listener interface for task lifecycle notifications.
//!
//! Listeners are registered with [`Runner::subscribe`](crate::Runner::subscribe)
//! (every task) or [`Runner::subscribe_task`](crate::Runner::subscribe_task)
//! (one task id). The runner only keeps a weak reference: drop your `Arc` or
//! call [`Runner::unsubscribe`](crate::Runner::unsubscribe) to stop receiving
//! events.
//!
//! Each subscription is served by its own tokio task, so a slow listener never
//! holds up the runner. Events reach one listener in the order they were
//! produced; there is no ordering between different listeners.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::runner::{StoredTask, TaskId};

/// Why the runner passed over a task without executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// Not the head of its group, or the handler's `can_run` returned false.
    NotReadyToRun,
    /// An error is recorded for the task and has not been resolved.
    UnresolvedRecordedError,
    /// An earlier member of the task's group failed or was skipped this pass.
    PartOfFailedGroup,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotReadyToRun => "NOT_READY_TO_RUN",
            Self::UnresolvedRecordedError => "UNRESOLVED_RECORDED_ERROR",
            Self::PartOfFailedGroup => "PART_OF_FAILED_GROUP",
        };
        f.write_str(name)
    }
}

/// A state transition reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    TaskAdded {
        task: StoredTask,
    },
    TaskRunning {
        task: StoredTask,
    },
    TaskSkipped {
        task: StoredTask,
        reason: SkipReason,
    },
    TaskComplete {
        task: StoredTask,
        success: bool,
        rescheduled: bool,
    },
    ErrorRecorded {
        task: StoredTask,
        message: Option<String>,
        error_id: Option<String>,
    },
    ErrorResolved {
        task: StoredTask,
    },
    AllTasksComplete,
}

impl RunnerEvent {
    /// The task this event concerns, if any.
    pub fn task(&self) -> Option<&StoredTask> {
        match self {
            Self::TaskAdded { task }
            | Self::TaskRunning { task }
            | Self::TaskSkipped { task, .. }
            | Self::TaskComplete { task, .. }
            | Self::ErrorRecorded { task, .. }
            | Self::ErrorResolved { task } => Some(task),
            Self::AllTasksComplete => None,
        }
    }
}

/// Receives task lifecycle callbacks. Every method defaults to doing nothing.
pub trait RunnerListener: Send + Sync {
    /// A new row was written by admission.
    fn on_task_added(&self, _task: &StoredTask) {}

    /// The task's handler is about to run.
    fn on_task_running(&self, _task: &StoredTask) {}

    /// The task was passed over.
    fn on_task_skipped(&self, _task: &StoredTask, _reason: SkipReason) {}

    /// The handler returned. `rescheduled` is true when the row was kept.
    fn on_task_complete(&self, _task: &StoredTask, _success: bool, _rescheduled: bool) {}

    /// An error was recorded for the task.
    fn on_error_recorded(&self, _task: &StoredTask, _message: Option<&str>, _error_id: Option<&str>) {}

    /// A recorded error was resolved.
    fn on_error_resolved(&self, _task: &StoredTask) {}

    /// A drain pass found nothing left to run. Only sent to global listeners.
    fn on_all_tasks_complete(&self) {}
}

/// A listener that ignores all events.
#[derive(Debug, Clone, Default)]
pub struct NoopListener;

impl NoopListener {
    /// Create a new no-op listener.
    pub fn new() -> Self {
        Self
    }
}

impl RunnerListener for NoopListener {}

fn deliver(listener: &dyn RunnerListener, event: &RunnerEvent) {
    match event {
        RunnerEvent::TaskAdded { task } => listener.on_task_added(task),
        RunnerEvent::TaskRunning { task } => listener.on_task_running(task),
        RunnerEvent::TaskSkipped { task, reason } => listener.on_task_skipped(task, *reason),
        RunnerEvent::TaskComplete {
            task,
            success,
            rescheduled,
        } => listener.on_task_complete(task, *success, *rescheduled),
        RunnerEvent::ErrorRecorded {
            task,
            message,
            error_id,
        } => listener.on_error_recorded(task, message.as_deref(), error_id.as_deref()),
        RunnerEvent::ErrorResolved { task } => listener.on_error_resolved(task),
        RunnerEvent::AllTasksComplete => listener.on_all_tasks_complete(),
    }
}

/// Handle for a registered listener, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    All,
    Task(TaskId),
}

impl Scope {
    fn wants(&self, event: &RunnerEvent) -> bool {
        match self {
            Self::All => true,
            Self::Task(id) => event.task().is_some_and(|task| task.id == *id),
        }
    }
}

struct Entry {
    scope: Scope,
    tx: mpsc::UnboundedSender<(u64, RunnerEvent)>,
}

/// Fans events out to subscriptions.
///
/// Every event is stamped with the current epoch. Workers drop events whose
/// epoch is stale, which is how a clear discards already queued events.
pub(crate) struct Notifier {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    epoch: Arc<AtomicU64>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a listener. Must be called from within a tokio runtime.
    pub(crate) fn subscribe(&self, scope: Scope, listener: Weak<dyn RunnerListener>) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, RunnerEvent)>();
        let epoch = self.epoch.clone();

        tokio::spawn(async move {
            while let Some((produced_in, event)) = rx.recv().await {
                if produced_in != epoch.load(Ordering::SeqCst) {
                    continue;
                }
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                deliver(listener.as_ref(), &event);
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries().insert(id, Entry { scope, tx });
        Subscription(id)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub(crate) fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.entries().remove(&subscription.0).is_some()
    }

    /// Send an event to one subscription only.
    pub(crate) fn send_to(&self, subscription: Subscription, event: RunnerEvent) {
        let epoch = self.epoch();
        let mut entries = self.entries();
        let closed = match entries.get(&subscription.0) {
            Some(entry) => entry.tx.send((epoch, event)).is_err(),
            None => false,
        };
        if closed {
            entries.remove(&subscription.0);
        }
    }

    /// Send an event to every interested subscription.
    pub(crate) fn emit(&self, event: RunnerEvent) {
        let epoch = self.epoch();
        // A failed send means the worker stopped because its listener was dropped.
        self.entries().retain(|_, entry| {
            if entry.scope.wants(&event) {
                entry.tx.send((epoch, event.clone())).is_ok()
            } else {
                !entry.tx.is_closed()
            }
        });
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidate every event queued so far.
    pub(crate) fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
