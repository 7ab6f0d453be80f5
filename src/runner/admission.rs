//! Task admission: validation, identity dedup, and the auto-run kick.

use chrono::Utc;
use tracing::{debug, error, info};

use super::runner::{AdmissionRejection, Runner, RunnerError};
use super::store::{NewTask, StoredTask, TaskId, TaskStore};
use crate::listener::RunnerEvent;

impl<S: TaskStore + 'static> Runner<S> {
    /// Add a task to the queue, or fold it into an existing task with the
    /// same `(tag, data_id)`.
    ///
    /// If the existing task has a recorded error, that error is resolved so
    /// the task runs again with the new input.
    pub async fn submit(&self, task: NewTask) -> Result<TaskId, RunnerError> {
        self.admit(task, true).await
    }

    /// Like [`submit`](Self::submit) but leaves a recorded error on the
    /// existing task untouched.
    pub async fn submit_without_resolving(&self, task: NewTask) -> Result<TaskId, RunnerError> {
        self.admit(task, false).await
    }

    async fn admit(&self, task: NewTask, resolve_errors: bool) -> Result<TaskId, RunnerError> {
        if task.tag.trim().is_empty() {
            return Err(AdmissionRejection::BlankTag.into());
        }
        if !self.inner.registry.contains(&task.tag) {
            return Err(RunnerError::UnknownTag(task.tag));
        }

        let state = self.inner.state.lock().await;
        let store = &self.inner.store;

        if let Some(similar) = store.find_by_tag(&task.tag).await? {
            let previously_grouped = similar.group_id.is_some();
            if previously_grouped != task.group_id.is_some() {
                return Err(AdmissionRejection::GroupMismatch {
                    tag: task.tag,
                    previously_grouped,
                }
                .into());
            }
        }

        let existing = store
            .find_by_identity(&task.tag, task.data_id.as_deref())
            .await?;
        let Some(latest) = existing.last() else {
            let added = store.insert(&task, Utc::now()).await?;
            drop(state);
            return Ok(self.added(added));
        };

        // Only the newest row of an identity takes new input. In a group like
        // (a, b, a) a running head `a` is left alone and the tail absorbs it.
        if let Some(running) = state
            .is_running_identity(&task.tag, task.data_id.as_deref())
            .filter(|running| running.id == latest.id)
        {
            let running = running.id;
            store.set_rerun_flag(true).await?;
            info!(task_id = %running, tag = %task.tag, "Task is running, it will run again when done");
            return Ok(running);
        }

        if resolve_errors && store.error_for(latest.id).await?.is_some() {
            for row in &existing {
                self.resolve_locked(row).await?;
            }
            return Ok(latest.id);
        }

        if let Some(group_id) = &task.group_id {
            if let Some(tail) = store.group_tail(group_id).await? {
                if task.same_identity(&tail) {
                    debug!(task_id = %tail.id, group_id = group_id.as_str(), "Task already last in its group");
                    return Ok(tail.id);
                }
            }
            let added = store.insert(&task, Utc::now()).await?;
            drop(state);
            return Ok(self.added(added));
        }

        if latest.manually_run != task.manually_run {
            // Replacing would drop the recorded error along with the old row.
            if store.error_for(latest.id).await?.is_some() {
                debug!(task_id = %latest.id, tag = %task.tag, "Task has an unresolved error, keeping its definition");
                return Ok(latest.id);
            }
            let replaced = store.replace_by_identity(&task, Utc::now()).await?;
            drop(state);
            return Ok(self.added(replaced));
        }

        debug!(task_id = %latest.id, tag = %task.tag, "Task already queued");
        Ok(latest.id)
    }

    fn added(&self, task: StoredTask) -> TaskId {
        info!(task_id = %task.id, tag = %task.tag, data_id = task.data_id.as_deref(), group_id = task.group_id.as_deref(), "Task added");
        let id = task.id;
        self.inner
            .notifier
            .emit(RunnerEvent::TaskAdded { task: task.clone() });
        self.run_in_background_if_able(&task);
        id
    }

    /// Spawn a single run of `task` when automatic running allows it.
    pub(crate) fn run_in_background_if_able(&self, task: &StoredTask) {
        if !self.inner.config.automatically_run_tasks || task.manually_run {
            return;
        }

        let runner = self.clone();
        let id = task.id;
        tokio::spawn(async move {
            match runner.run_task(id).await {
                Ok(outcome) => debug!(task_id = %id, ?outcome, "Background run finished"),
                Err(RunnerError::TaskNotFound(_) | RunnerError::ManualRunNotAllowed(_)) => {
                    debug!(task_id = %id, "Task not runnable on its own, leaving it for a drain");
                }
                Err(e) => error!(task_id = %id, error = %e, "Background run failed"),
            }
        });
    }
}
