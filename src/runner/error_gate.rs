//! Recorded errors: blocking a task until the user resolves it.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info};

use super::runner::{Runner, RunnerError};
use super::store::{RecordedError, RunFilter, StoredTask, TaskId, TaskStore};
use crate::listener::RunnerEvent;
use crate::task::ErrorGate;

impl<S: TaskStore + 'static> Runner<S> {
    /// Record an error for a task. The task is skipped until the error is
    /// resolved. Recording again replaces the previous error.
    pub async fn record_error(
        &self,
        task_id: TaskId,
        message: Option<&str>,
        error_id: Option<&str>,
    ) -> Result<RecordedError, RunnerError> {
        let _state = self.inner.state.lock().await;
        let task = self.require_task(task_id).await?;
        let recorded = self
            .inner
            .store
            .upsert_error(task_id, message, error_id, Utc::now())
            .await?;

        info!(task_id = %task_id, tag = %task.tag, error_message = message, error_id, "Error recorded");
        self.inner.notifier.emit(RunnerEvent::ErrorRecorded {
            task,
            message: recorded.message.clone(),
            error_id: recorded.error_id.clone(),
        });
        Ok(recorded)
    }

    /// Resolve a task's recorded error. Returns false if none was recorded.
    ///
    /// With automatic running on, the task (or its whole group) is run again
    /// in the background.
    pub async fn resolve_error(&self, task_id: TaskId) -> Result<bool, RunnerError> {
        let _state = self.inner.state.lock().await;
        let task = self.require_task(task_id).await?;
        self.resolve_locked(&task).await
    }

    /// Resolve while the caller holds the state lock.
    pub(crate) async fn resolve_locked(&self, task: &StoredTask) -> Result<bool, RunnerError> {
        if !self.inner.store.delete_error(task.id).await? {
            debug!(task_id = %task.id, "No recorded error to resolve");
            return Ok(false);
        }

        info!(task_id = %task.id, tag = %task.tag, "Error resolved");
        self.inner
            .notifier
            .emit(RunnerEvent::ErrorResolved { task: task.clone() });
        self.rerun_after_resolve(task);
        Ok(true)
    }

    fn rerun_after_resolve(&self, task: &StoredTask) {
        let Some(group_id) = &task.group_id else {
            self.run_in_background_if_able(task);
            return;
        };
        if !self.inner.config.automatically_run_tasks {
            return;
        }

        let runner = self.clone();
        let filter = RunFilter::group(group_id.clone());
        tokio::spawn(async move {
            if let Err(e) = runner.run_all(filter).await {
                error!(error = %e, "Group run after resolving error failed");
            }
        });
    }

    /// The task's recorded error, if any.
    pub async fn latest_error(&self, task_id: TaskId) -> Result<Option<RecordedError>, RunnerError> {
        self.require_task(task_id).await?;
        Ok(self.inner.store.error_for(task_id).await?)
    }

    /// Whether the task has an unresolved recorded error.
    pub async fn has_error(&self, task_id: TaskId) -> Result<bool, RunnerError> {
        Ok(self.latest_error(task_id).await?.is_some())
    }

    /// Every unresolved recorded error, oldest first.
    pub async fn all_errors(&self) -> Result<Vec<RecordedError>, RunnerError> {
        Ok(self.inner.store.all_errors().await?)
    }
}

#[async_trait]
impl<S: TaskStore + 'static> ErrorGate for Runner<S> {
    async fn record_error(
        &self,
        task_id: TaskId,
        message: Option<String>,
        error_id: Option<String>,
    ) -> Result<RecordedError, RunnerError> {
        Runner::record_error(self, task_id, message.as_deref(), error_id.as_deref()).await
    }

    async fn resolve_error(&self, task_id: TaskId) -> Result<bool, RunnerError> {
        Runner::resolve_error(self, task_id).await
    }

    async fn latest_error(&self, task_id: TaskId) -> Result<Option<RecordedError>, RunnerError> {
        Runner::latest_error(self, task_id).await
    }
}
