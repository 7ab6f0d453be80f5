//! Task handler trait and result types.

use std::sync::Arc;

use async_trait::async_trait;

use crate::runner::{RecordedError, RunnerError, StoredTask, TaskId};

/// Terminal result of a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// The work is done. The row is deleted unless new input arrived mid-run.
    Success,
    /// The work did not complete. The row is kept and retried on the next pass.
    ///
    /// If the failure needs the user to act, record an error through
    /// [`TaskContext::record_error`] first: the task is then skipped until the
    /// error is resolved.
    Failed,
}

/// The work body for one kind of task, identified by its tag.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The tag this handler runs. Must not be blank.
    fn tag(&self) -> &'static str;

    /// Perform the work for `task`.
    ///
    /// An `Err` is logged and handled like [`TaskResult::Failed`].
    async fn run(&self, task: &StoredTask, ctx: &TaskContext) -> anyhow::Result<TaskResult>;

    /// Whether `task` may run right now. Checked every time the task is
    /// considered; must not have side effects.
    fn can_run(&self, _task: &StoredTask) -> bool {
        true
    }
}

/// Error operations available to a running task.
///
/// Implemented by [`Runner`](crate::Runner); kept object safe so the handler
/// does not need to know the store type.
#[async_trait]
pub(crate) trait ErrorGate: Send + Sync {
    async fn record_error(
        &self,
        task_id: TaskId,
        message: Option<String>,
        error_id: Option<String>,
    ) -> Result<RecordedError, RunnerError>;

    async fn resolve_error(&self, task_id: TaskId) -> Result<bool, RunnerError>;

    async fn latest_error(&self, task_id: TaskId) -> Result<Option<RecordedError>, RunnerError>;
}

/// Handed to [`TaskHandler::run`] for calling back into the queue.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    errors: Arc<dyn ErrorGate>,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, errors: Arc<dyn ErrorGate>) -> Self {
        Self { task_id, errors }
    }

    /// Id of the task being run.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Record an error for the running task that needs the user to fix.
    pub async fn record_error(
        &self,
        message: Option<&str>,
        error_id: Option<&str>,
    ) -> Result<RecordedError, RunnerError> {
        self.errors
            .record_error(
                self.task_id,
                message.map(str::to_string),
                error_id.map(str::to_string),
            )
            .await
    }

    /// Resolve the running task's recorded error, if any.
    pub async fn resolve_error(&self) -> Result<bool, RunnerError> {
        self.errors.resolve_error(self.task_id).await
    }

    /// The running task's recorded error, if any.
    pub async fn latest_error(&self) -> Result<Option<RecordedError>, RunnerError> {
        self.errors.latest_error(self.task_id).await
    }
}
